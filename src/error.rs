//! Error types: the internal VM taxonomy and user-level failures.
//!
//! `VmError` covers conditions the machine itself detects (misused
//! continuations, missing handlers, escapes in sync mode). `Failure` is the
//! user-visible error that travels through Catch/Finally frames and lands in
//! `RunResult::result`, carrying the provenance of the failing effect.

use std::sync::Arc;

use thiserror::Error;

use crate::capture::{CallSite, DispatchRecord};
use crate::effect::Effect;
use crate::ids::ContId;
use crate::value::Value;

#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("one-shot violation: continuation {} already consumed", .cont_id.raw())]
    OneShotViolation { cont_id: ContId },

    #[error("unhandled effect: {}", .effect.repr())]
    UnhandledEffect { effect: Effect },

    #[error("delegate: no outer handler for effect: {}", .effect.repr())]
    DelegateNoOuterHandler { effect: Effect },

    #[error("{primitive} used outside of an active dispatch")]
    PrimitiveOutsideDispatch { primitive: &'static str },

    #[error("invalid segment: {message}")]
    InvalidSegment { message: String },

    #[error("host-async escape reached sync run; install a sync Await handler or use async_run")]
    SyncEscape,

    #[error("scheduler deadlock: no runnable task and no outstanding external completion")]
    Deadlock,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl VmError {
    pub fn one_shot(cont_id: ContId) -> Self {
        VmError::OneShotViolation { cont_id }
    }

    pub fn unhandled(effect: Effect) -> Self {
        VmError::UnhandledEffect { effect }
    }

    pub fn delegate_no_outer(effect: Effect) -> Self {
        VmError::DelegateNoOuterHandler { effect }
    }

    pub fn outside_dispatch(primitive: &'static str) -> Self {
        VmError::PrimitiveOutsideDispatch { primitive }
    }

    pub fn invalid_segment(message: impl Into<String>) -> Self {
        VmError::InvalidSegment {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        VmError::Internal {
            message: message.into(),
        }
    }
}

/// Broad classification of a user-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Raised by user code or a handler body.
    Raised,
    /// An effect reached the outermost scope with no handler.
    Unhandled,
    /// Injected into a task by the scheduler after `Cancel`.
    Cancelled,
    /// No runnable task and nothing external outstanding.
    Deadlock,
    /// Surfaced from the VM taxonomy.
    Vm,
}

/// A user-level error value.
///
/// Carries the failing effect (identity-preserving clone), the creation site
/// captured when that effect was constructed, the dispatch trace at failure
/// time, and an optional cause chain.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub payload: Option<Value>,
    pub effect: Option<Effect>,
    pub site: Option<CallSite>,
    pub trace: Vec<DispatchRecord>,
    pub cause: Option<Arc<Failure>>,
}

impl Failure {
    pub fn raised(message: impl Into<String>) -> Self {
        Failure {
            kind: FailureKind::Raised,
            message: message.into(),
            payload: None,
            effect: None,
            site: None,
            trace: Vec::new(),
            cause: None,
        }
    }

    #[track_caller]
    pub fn raised_here(message: impl Into<String>) -> Self {
        Failure {
            site: Some(CallSite::here()),
            ..Failure::raised(message)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_cause(mut self, cause: Failure) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn unhandled(effect: Effect) -> Self {
        let site = Some(effect.site().clone());
        Failure {
            kind: FailureKind::Unhandled,
            message: format!("unhandled effect: {}", effect.repr()),
            payload: None,
            effect: Some(effect),
            site,
            trace: Vec::new(),
            cause: None,
        }
    }

    pub fn cancelled() -> Self {
        Failure {
            kind: FailureKind::Cancelled,
            message: "task cancelled".to_string(),
            payload: None,
            effect: None,
            site: None,
            trace: Vec::new(),
            cause: None,
        }
    }

    pub fn deadlock() -> Self {
        Failure {
            kind: FailureKind::Deadlock,
            message: VmError::Deadlock.to_string(),
            payload: None,
            effect: None,
            site: None,
            trace: Vec::new(),
            cause: None,
        }
    }

    pub fn from_vm(error: VmError) -> Self {
        let (kind, effect) = match &error {
            VmError::UnhandledEffect { effect } | VmError::DelegateNoOuterHandler { effect } => {
                (FailureKind::Unhandled, Some(effect.clone()))
            }
            VmError::Deadlock => (FailureKind::Deadlock, None),
            _ => (FailureKind::Vm, None),
        };
        let site = effect.as_ref().map(|e| e.site().clone());
        Failure {
            kind,
            message: error.to_string(),
            payload: None,
            effect,
            site,
            trace: Vec::new(),
            cause: None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(site) = &self.site {
            write!(f, " (at {site})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "; caused by: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

impl From<VmError> for Failure {
    fn from(error: VmError) -> Self {
        Failure::from_vm(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_error_display() {
        let err = VmError::one_shot(ContId::fresh());
        assert!(err.to_string().contains("one-shot violation"));

        let err = VmError::internal("boom");
        assert!(err.to_string().contains("internal error: boom"));
    }

    #[test]
    fn test_unhandled_failure_keeps_effect_identity() {
        let effect = Effect::user("probe");
        let failure = Failure::unhandled(effect.clone());
        let kept = failure.effect.expect("effect retained");
        assert!(kept.same_user_payload(&effect));
        assert_eq!(failure.kind, FailureKind::Unhandled);
    }

    #[test]
    fn test_failure_cause_chain_display() {
        let inner = Failure::raised("inner");
        let outer = Failure::raised("outer").with_cause(inner);
        let text = outer.to_string();
        assert!(text.contains("outer"));
        assert!(text.contains("caused by: inner"));
    }

    #[test]
    fn test_failure_from_vm_maps_deadlock() {
        let failure = Failure::from_vm(VmError::Deadlock);
        assert_eq!(failure.kind, FailureKind::Deadlock);
    }
}
