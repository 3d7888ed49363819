//! Dispatch and composition primitives, and the yielded-value classifier.

use crate::continuation::Continuation;
use crate::effect::Effect;
use crate::error::Failure;
use crate::handler::HandlerRef;
use crate::program::ProgramRef;
use crate::value::Value;

/// Primitives the VM processes directly. These never reach a handler.
#[derive(Debug, Clone)]
pub enum Ctl {
    /// Deliver a value to the current frame without suspending.
    Pure { value: Value },
    /// Install `handler` around `expr`; the expression's value (or the
    /// handler's return, if it intercepts) is delivered back to the yielder.
    WithHandler { handler: HandlerRef, expr: ProgramRef },
    /// Continue the captured caller; control returns to the yielding handler
    /// once the caller finishes.
    Resume { continuation: Continuation, value: Value },
    /// Like `Resume` but injects a failure at the suspension point.
    ResumeThrow { continuation: Continuation, error: Failure },
    /// Continue the captured caller and abandon the yielding handler body.
    Transfer { continuation: Continuation, value: Value },
    /// Like `Transfer` but injects a failure at the suspension point.
    TransferThrow { continuation: Continuation, error: Failure },
    /// Restore the captured caller and start `program` on top of it, so the
    /// program's result flows straight into the caller. Used for deferred
    /// call expansion; the yielding handler body is abandoned.
    TransferCall { continuation: Continuation, program: ProgramRef },
    /// Forward the current dispatch to the next outer handler, optionally
    /// substituting a different effect. Only valid during dispatch.
    Delegate { effect: Option<Effect> },
    /// Deliver the handlers visible at the current scope, innermost first.
    GetHandlers,
    /// Deliver an unstarted continuation for `program` with `handlers`
    /// installed around it (innermost first). The scheduler builds tasks
    /// from these.
    CreateContinuation { program: ProgramRef, handlers: Vec<HandlerRef> },
    /// Evaluate `program` under freshly installed `handlers`, delivering its
    /// value back to the yielder.
    Eval { program: ProgramRef, handlers: Vec<HandlerRef> },
    /// Run `body` with `cleanup` guaranteed on every exit path.
    Protect { body: ProgramRef, cleanup: ProgramRef },
    /// Run `body`, delivering `Outcome(Ok(v))` or `Outcome(Err(f))` instead
    /// of unwinding.
    Catch { body: ProgramRef },
}

/// Strict ternary classification of a yielded value. Anything a stream
/// yields is exactly one of these; there is no fallback.
#[derive(Debug, Clone)]
pub enum Yielded {
    Effect(Effect),
    Ctl(Ctl),
    Thunk(ProgramRef),
}

impl Yielded {
    pub fn describe(&self) -> String {
        match self {
            Yielded::Effect(e) => format!("effect {}", e.repr()),
            Yielded::Ctl(c) => format!("primitive {}", c.describe()),
            Yielded::Thunk(_) => "thunk".to_string(),
        }
    }
}

impl Ctl {
    pub fn describe(&self) -> &'static str {
        match self {
            Ctl::Pure { .. } => "Pure",
            Ctl::WithHandler { .. } => "WithHandler",
            Ctl::Resume { .. } => "Resume",
            Ctl::ResumeThrow { .. } => "ResumeThrow",
            Ctl::Transfer { .. } => "Transfer",
            Ctl::TransferThrow { .. } => "TransferThrow",
            Ctl::TransferCall { .. } => "TransferCall",
            Ctl::Delegate { .. } => "Delegate",
            Ctl::GetHandlers => "GetHandlers",
            Ctl::CreateContinuation { .. } => "CreateContinuation",
            Ctl::Eval { .. } => "Eval",
            Ctl::Protect { .. } => "Protect",
            Ctl::Catch { .. } => "Catch",
        }
    }
}

impl From<Effect> for Yielded {
    fn from(effect: Effect) -> Self {
        Yielded::Effect(effect)
    }
}

impl From<Ctl> for Yielded {
    fn from(ctl: Ctl) -> Self {
        Yielded::Ctl(ctl)
    }
}

/// `WithHandler` as a yieldable value.
pub fn with_handler(handler: HandlerRef, expr: ProgramRef) -> Yielded {
    Yielded::Ctl(Ctl::WithHandler { handler, expr })
}

pub fn resume(continuation: Continuation, value: Value) -> Yielded {
    Yielded::Ctl(Ctl::Resume {
        continuation,
        value,
    })
}

pub fn transfer(continuation: Continuation, value: Value) -> Yielded {
    Yielded::Ctl(Ctl::Transfer {
        continuation,
        value,
    })
}

pub fn delegate() -> Yielded {
    Yielded::Ctl(Ctl::Delegate { effect: None })
}

pub fn delegate_as(effect: Effect) -> Yielded {
    Yielded::Ctl(Ctl::Delegate {
        effect: Some(effect),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yielded_describe() {
        let y = Yielded::Effect(Effect::get("x"));
        assert!(y.describe().contains("Get"));
        assert_eq!(delegate().describe(), "primitive Delegate");
    }

    #[test]
    fn test_from_effect_classifies_as_effect() {
        let y: Yielded = Effect::tell(Value::Int(1)).into();
        assert!(matches!(y, Yielded::Effect(_)));
    }
}
