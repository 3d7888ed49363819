//! Effect types yielded by user code.
//!
//! Effects are requests; handlers decide what happens to them. The built-in
//! families are closed enum variants so the native handlers can match without
//! downcasting; everything else travels as an opaque `User` effect. Every
//! effect records the source location it was constructed at, which is what
//! `UnhandledEffect` failures report.

use std::fmt;
use std::sync::Arc;

use crate::cache::CacheEffect;
use crate::capture::CallSite;
use crate::host::HostFuture;
use crate::kleisli::ProgramCall;
use crate::program::ProgramRef;
use crate::scheduler::SchedEffect;
use crate::value::{Opaque, Value};

/// The function carried by a `Modify` effect.
#[derive(Clone)]
pub struct ModifyFn(Arc<dyn Fn(Value) -> Value + Send + Sync>);

impl ModifyFn {
    pub fn new(f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        ModifyFn(Arc::new(f))
    }

    pub fn apply(&self, value: Value) -> Value {
        (self.0)(value)
    }
}

impl fmt::Debug for ModifyFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModifyFn(..)")
    }
}

/// An opaque effect the VM routes without inspecting.
#[derive(Debug, Clone)]
pub struct UserEffect {
    pub name: String,
    pub payload: Opaque,
}

#[derive(Debug, Clone)]
pub enum EffectKind {
    Get { key: String },
    Put { key: String, value: Value },
    Modify { key: String, func: ModifyFn },
    Ask { key: String },
    Local { overrides: Vec<(String, Value)>, expr: ProgramRef },
    Tell { message: Value },
    Listen { expr: ProgramRef },
    Sched(SchedEffect),
    Cache(CacheEffect),
    Call(ProgramCall),
    Await(HostFuture),
    User(UserEffect),
}

#[derive(Debug, Clone)]
pub struct Effect {
    kind: EffectKind,
    site: CallSite,
}

impl Effect {
    #[track_caller]
    pub fn new(kind: EffectKind) -> Self {
        Effect {
            kind,
            site: CallSite::here(),
        }
    }

    pub fn kind(&self) -> &EffectKind {
        &self.kind
    }

    pub fn into_kind(self) -> EffectKind {
        self.kind
    }

    pub fn site(&self) -> &CallSite {
        &self.site
    }

    #[track_caller]
    pub fn get(key: impl Into<String>) -> Self {
        Effect::new(EffectKind::Get { key: key.into() })
    }

    #[track_caller]
    pub fn put(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Effect::new(EffectKind::Put {
            key: key.into(),
            value: value.into(),
        })
    }

    #[track_caller]
    pub fn modify(key: impl Into<String>, func: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Effect::new(EffectKind::Modify {
            key: key.into(),
            func: ModifyFn::new(func),
        })
    }

    #[track_caller]
    pub fn ask(key: impl Into<String>) -> Self {
        Effect::new(EffectKind::Ask { key: key.into() })
    }

    #[track_caller]
    pub fn local(overrides: Vec<(String, Value)>, expr: ProgramRef) -> Self {
        Effect::new(EffectKind::Local { overrides, expr })
    }

    #[track_caller]
    pub fn tell(message: impl Into<Value>) -> Self {
        Effect::new(EffectKind::Tell {
            message: message.into(),
        })
    }

    #[track_caller]
    pub fn listen(expr: ProgramRef) -> Self {
        Effect::new(EffectKind::Listen { expr })
    }

    #[track_caller]
    pub fn sched(effect: SchedEffect) -> Self {
        Effect::new(EffectKind::Sched(effect))
    }

    #[track_caller]
    pub fn cache(effect: CacheEffect) -> Self {
        Effect::new(EffectKind::Cache(effect))
    }

    #[track_caller]
    pub fn call(call: ProgramCall) -> Self {
        Effect::new(EffectKind::Call(call))
    }

    #[track_caller]
    pub fn await_future(future: HostFuture) -> Self {
        Effect::new(EffectKind::Await(future))
    }

    #[track_caller]
    pub fn user<T: std::any::Any + Send + Sync>(payload: T) -> Self {
        Effect::new(EffectKind::User(UserEffect {
            name: short_type_name::<T>(),
            payload: Opaque::new(payload),
        }))
    }

    #[track_caller]
    pub fn user_named<T: std::any::Any + Send + Sync>(name: impl Into<String>, payload: T) -> Self {
        Effect::new(EffectKind::User(UserEffect {
            name: name.into(),
            payload: Opaque::new(payload),
        }))
    }

    pub fn as_user(&self) -> Option<&UserEffect> {
        match &self.kind {
            EffectKind::User(u) => Some(u),
            _ => None,
        }
    }

    /// Identity comparison for opaque effects: same payload allocation.
    pub fn same_user_payload(&self, other: &Effect) -> bool {
        match (&self.kind, &other.kind) {
            (EffectKind::User(a), EffectKind::User(b)) => a.payload.ptr_eq(&b.payload),
            _ => false,
        }
    }

    pub fn repr(&self) -> String {
        match &self.kind {
            EffectKind::Get { key } => format!("Get({key:?})"),
            EffectKind::Put { key, value } => format!("Put({key:?}, {})", value.repr()),
            EffectKind::Modify { key, .. } => format!("Modify({key:?}, <fn>)"),
            EffectKind::Ask { key } => format!("Ask({key:?})"),
            EffectKind::Local { overrides, .. } => format!("Local(<{} overrides>)", overrides.len()),
            EffectKind::Tell { message } => format!("Tell({})", message.repr()),
            EffectKind::Listen { .. } => "Listen(<expr>)".to_string(),
            EffectKind::Sched(s) => s.repr(),
            EffectKind::Cache(c) => c.repr(),
            EffectKind::Call(call) => format!("Call({})", call.name()),
            EffectKind::Await(_) => "Await(<future>)".to_string(),
            EffectKind::User(u) => format!("{}(<opaque>)", u.name),
        }
    }
}

fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_constructors_capture_site() {
        let effect = Effect::get("counter");
        assert!(effect.site().file.ends_with("effect.rs"));
        assert!(matches!(effect.kind(), EffectKind::Get { key } if key == "counter"));
    }

    #[test]
    fn test_modify_fn_applies() {
        let effect = Effect::modify("n", |v| Value::Int(v.as_int().unwrap_or(0) + 1));
        match effect.kind() {
            EffectKind::Modify { func, .. } => {
                assert_eq!(func.apply(Value::Int(1)), Value::Int(2));
            }
            _ => panic!("expected Modify"),
        }
    }

    #[test]
    fn test_user_effect_identity() {
        let a = Effect::user("probe");
        let b = a.clone();
        let c = Effect::user("probe");
        assert!(a.same_user_payload(&b));
        assert!(!a.same_user_payload(&c));
    }

    #[test]
    fn test_user_effect_default_name() {
        let effect = Effect::user(42i64);
        assert_eq!(effect.as_user().map(|u| u.name.as_str()), Some("i64"));
    }

    #[test]
    fn test_effect_repr() {
        assert_eq!(Effect::get("x").repr(), "Get(\"x\")");
        assert_eq!(Effect::tell(Value::Int(1)).repr(), "Tell(1)");
    }
}
