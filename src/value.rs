//! Value types that flow through the VM.
//!
//! Values are either native scalars (cheap, allocation-free) or opaque
//! payloads the VM never inspects. Continuations and scheduler handles ride
//! through the same type so handlers can return them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::continuation::Continuation;
use crate::error::Failure;
use crate::handler::HandlerRef;
use crate::scheduler::{ExternalPromise, PromiseHandle, TaskHandle};

/// An opaque user payload. The VM routes these without looking inside;
/// identity is pointer identity.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Opaque(Arc::new(value))
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Opaque(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({:p})", Arc::as_ptr(&self.0))
    }
}

/// A value that can flow through the VM.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Opaque(Opaque),
    Continuation(Continuation),
    Handlers(Vec<HandlerRef>),
    Task(TaskHandle),
    Promise(PromiseHandle),
    External(ExternalPromise),
    /// Result of a `Catch` scope: the caught failure or the body's value.
    Outcome(Box<Result<Value, Failure>>),
}

impl Value {
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Opaque::new(value))
    }

    pub fn ok(value: Value) -> Self {
        Value::Outcome(Box::new(Ok(value)))
    }

    pub fn err(failure: Failure) -> Self {
        Value::Outcome(Box::new(Err(failure)))
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_continuation(&self) -> Option<&Continuation> {
        match self {
            Value::Continuation(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_handlers(&self) -> Option<&[HandlerRef]> {
        match self {
            Value::Handlers(hs) => Some(hs),
            _ => None,
        }
    }

    pub fn as_outcome(&self) -> Option<&Result<Value, Failure>> {
        match self {
            Value::Outcome(r) => Some(r),
            _ => None,
        }
    }

    /// Short display form for traces and snapshots.
    pub fn repr(&self) -> String {
        match self {
            Value::Unit => "()".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Str(s) => format!("{s:?}"),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Opaque(o) => format!("{o:?}"),
            Value::Continuation(k) => format!("<continuation {}>", k.cont_id.raw()),
            Value::Handlers(hs) => format!("<handlers x{}>", hs.len()),
            Value::Task(t) => format!("<task {}>", t.id.raw()),
            Value::Promise(p) => format!("<promise {}>", p.id.raw()),
            Value::External(p) => format!("<external promise {}>", p.id.raw()),
            Value::Outcome(r) => match r.as_ref() {
                Ok(v) => format!("Ok({})", v.repr()),
                Err(f) => format!("Err({f})"),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            (Value::Continuation(a), Value::Continuation(b)) => a.cont_id == b.cont_id,
            (Value::Task(a), Value::Task(b)) => a.id == b.id,
            (Value::Promise(a), Value::Promise(b)) => a.id == b.id,
            (Value::External(a), Value::External(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from_primitives() {
        assert_eq!(Value::from(42i64), Value::Int(42));
        assert_eq!(Value::from("hello"), Value::Str("hello".into()));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(()), Value::Unit);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Int(42).as_int(), Some(42));
        assert_eq!(Value::Str("hello".into()).as_str(), Some("hello"));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert!(Value::Unit.is_unit());
    }

    #[test]
    fn test_opaque_identity_not_structural() {
        let a = Value::opaque("payload".to_string());
        let b = Value::opaque("payload".to_string());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_value_repr() {
        assert_eq!(Value::Int(3).repr(), "3");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Str("x".into())]).repr(),
            "[1, \"x\"]"
        );
    }

    #[test]
    fn test_outcome_round_trip() {
        let ok = Value::ok(Value::Int(1));
        assert!(matches!(ok.as_outcome(), Some(Ok(Value::Int(1)))));
    }
}
