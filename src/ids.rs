//! Core identifier types for the VM.
//!
//! All IDs are lightweight Copy types using the newtype pattern for type
//! safety. Process-global counters keep them unique across VM instances so
//! continuations from different runs can never collide.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identifies a handler installation point (prompt).
///
/// Each `WithHandler` creates a fresh PromptId; scope chains are ordered
/// lists of these.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PromptId(pub u64);

/// Arena handle for segments.
///
/// Carries a generation so a dereference after reclamation is a detectable
/// error rather than a silent alias.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SegmentId {
    pub index: u32,
    pub generation: u32,
}

/// Identifier for captured continuations, used for one-shot tracking.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContId(pub u64);

/// Identifier tracking one effect dispatch through the handler chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DispatchId(pub u64);

/// Identifier for runnable continuations queued by the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RunnableId(pub u64);

/// Identifier for native callbacks stored in the VM's callback table.
///
/// Callbacks are stored separately from frames so frames stay Clone; the
/// callback itself is consumed when executed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CallbackId(pub u32);

/// Identifier for spawned tasks. Allocated by the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub u64);

/// Identifier for promises. Allocated by the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PromiseId(pub u64);

static PROMPT_COUNTER: AtomicU64 = AtomicU64::new(1);
static CONT_COUNTER: AtomicU64 = AtomicU64::new(1);
static DISPATCH_COUNTER: AtomicU64 = AtomicU64::new(1);
static RUNNABLE_COUNTER: AtomicU64 = AtomicU64::new(1);
static CALLBACK_COUNTER: AtomicU32 = AtomicU32::new(1);

impl PromptId {
    pub fn fresh() -> Self {
        PromptId(PROMPT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserved placeholder for unstarted continuations.
    pub fn placeholder() -> Self {
        PromptId(0)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl ContId {
    pub fn fresh() -> Self {
        ContId(CONT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl DispatchId {
    pub fn fresh() -> Self {
        DispatchId(DISPATCH_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl RunnableId {
    pub fn fresh() -> Self {
        RunnableId(RUNNABLE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl CallbackId {
    pub fn fresh() -> Self {
        CallbackId(CALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl SegmentId {
    pub fn new(index: usize, generation: u32) -> Self {
        SegmentId {
            index: index as u32,
            generation,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl TaskId {
    pub fn from_raw(value: u64) -> Self {
        TaskId(value)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl PromiseId {
    pub fn from_raw(value: u64) -> Self {
        PromiseId(value)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_id_fresh_is_unique() {
        let a = PromptId::fresh();
        let b = PromptId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cont_id_fresh_is_unique() {
        let a = ContId::fresh();
        let b = ContId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn test_segment_id_carries_generation() {
        let a = SegmentId::new(3, 0);
        let b = SegmentId::new(3, 1);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
    }

    #[test]
    fn test_callback_id_fresh_is_unique() {
        let a = CallbackId::fresh();
        let b = CallbackId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn test_task_and_promise_ids_compare_by_value() {
        assert_eq!(TaskId::from_raw(7), TaskId::from_raw(7));
        assert_eq!(PromiseId::from_raw(7), PromiseId::from_raw(7));
        assert_ne!(TaskId::from_raw(7).raw(), TaskId::from_raw(8).raw());
    }
}
