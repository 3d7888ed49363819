//! Kleisli arrows: deferred function calls into programs.
//!
//! Calling a program-shaped function does not start it; it produces a
//! `ProgramCall` (the deferred-call effect payload) that the VM dispatches to
//! the call handler, which resolves argument programs and expands the callee.

use std::fmt;
use std::sync::Arc;

use crate::capture::CallSite;
use crate::ctl::Yielded;
use crate::effect::Effect;
use crate::error::Failure;
use crate::program::{self, IntoProgram, ProgramRef, StreamStep};
use crate::value::Value;

/// A function from argument values into a program.
pub trait Kleisli: fmt::Debug + Send + Sync {
    fn call(&self, args: Vec<Value>) -> Result<ProgramRef, Failure>;

    fn name(&self) -> &str {
        "<kleisli>"
    }
}

pub type KleisliRef = Arc<dyn Kleisli>;

struct FnKleisli<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for FnKleisli<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKleisli").field("name", &self.name).finish()
    }
}

impl<F> Kleisli for FnKleisli<F>
where
    F: Fn(Vec<Value>) -> Result<ProgramRef, Failure> + Send + Sync,
{
    fn call(&self, args: Vec<Value>) -> Result<ProgramRef, Failure> {
        (self.f)(args)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build a Kleisli arrow from a closure.
pub fn kleisli<F>(name: impl Into<String>, f: F) -> KleisliRef
where
    F: Fn(Vec<Value>) -> Result<ProgramRef, Failure> + Send + Sync + 'static,
{
    Arc::new(FnKleisli {
        name: name.into(),
        f,
    })
}

/// An argument to a deferred call: either a plain value or a program whose
/// result supplies the value (resolved by the call handler before expansion).
#[derive(Debug, Clone)]
pub enum CallArg {
    Value(Value),
    Expr(ProgramRef),
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        CallArg::Value(value)
    }
}

/// The deferred-call effect payload.
#[derive(Debug, Clone)]
pub struct ProgramCall {
    pub kleisli: KleisliRef,
    pub args: Vec<CallArg>,
    pub site: CallSite,
}

impl ProgramCall {
    #[track_caller]
    pub fn new(kleisli: KleisliRef, args: Vec<CallArg>) -> Self {
        ProgramCall {
            kleisli,
            args,
            site: CallSite::here(),
        }
    }

    pub fn name(&self) -> &str {
        self.kleisli.name()
    }
}

impl IntoProgram for ProgramCall {
    /// Running a deferred call directly: yield it as an effect once and
    /// return whatever the call handler delivers back.
    fn into_program(self) -> ProgramRef {
        let mut call = Some(self);
        program::from_fn("program-call", move |event, _| {
            let value = match event.try_value() {
                Ok(v) => v,
                Err(e) => return StreamStep::Throw(e),
            };
            match call.take() {
                Some(c) => StreamStep::Yield(Yielded::Effect(Effect::call(c))),
                None => StreamStep::Return(value),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_kleisli_produces_program() {
        let arrow = kleisli("double", |args| {
            let n = args.first().and_then(Value::as_int).unwrap_or(0);
            Ok(program::pure(Value::Int(n * 2)))
        });
        assert_eq!(arrow.name(), "double");

        let prog = arrow.call(vec![Value::Int(21)]).expect("call succeeds");
        let mut store = Store::new();
        let mut stream = prog.lock().expect("stream lock poisoned");
        assert!(matches!(
            stream.resume(Value::Unit, &mut store),
            StreamStep::Return(Value::Int(42))
        ));
    }

    #[test]
    fn test_program_call_into_program_yields_call_effect() {
        let arrow = kleisli("noop", |_| Ok(program::pure(Value::Unit)));
        let call = ProgramCall::new(arrow, vec![]);
        let prog = call.into_program();

        let mut store = Store::new();
        let mut stream = prog.lock().expect("stream lock poisoned");
        match stream.resume(Value::Unit, &mut store) {
            StreamStep::Yield(Yielded::Effect(e)) => {
                assert!(e.repr().starts_with("Call("));
            }
            other => panic!("expected Call effect yield, got {other:?}"),
        }
        assert!(matches!(
            stream.resume(Value::Int(7), &mut store),
            StreamStep::Return(Value::Int(7))
        ));
    }
}
