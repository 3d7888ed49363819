//! Dispatch bookkeeping: one context per in-flight effect dispatch.

use crate::continuation::Continuation;
use crate::effect::Effect;
use crate::handler::HandlerRef;
use crate::ids::{DispatchId, PromptId, SegmentId};

/// Registry entry for an installed handler.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub handler: HandlerRef,
    pub prompt_seg: SegmentId,
}

impl HandlerEntry {
    pub fn new(handler: HandlerRef, prompt_seg: SegmentId) -> Self {
        HandlerEntry {
            handler,
            prompt_seg,
        }
    }
}

/// Live state of one effect dispatch.
///
/// `handler_chain` is the handler visibility snapshot taken when dispatch
/// started; `handler_idx` advances along it as the dispatch delegates
/// outward. Completed contexts are popped lazily the next time dispatch
/// machinery runs.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub dispatch_id: DispatchId,
    pub effect: Effect,
    pub handler_chain: Vec<PromptId>,
    pub handler_idx: usize,
    pub k_user: Continuation,
    /// Prompt boundary the dispatch value emerges at.
    pub prompt_seg: SegmentId,
    /// Segment the current handler body runs in.
    pub handler_seg: SegmentId,
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PromptId;
    use crate::segment::Segment;

    #[test]
    fn test_handler_entry_holds_prompt_segment() {
        let entry = HandlerEntry::new(crate::handler::state(), SegmentId::new(4, 0));
        assert_eq!(entry.prompt_seg, SegmentId::new(4, 0));
        assert_eq!(entry.handler.name(), "StateHandler");
    }

    #[test]
    fn test_dispatch_context_clone_keeps_chain() {
        let prompt = PromptId::fresh();
        let seg = Segment::body(prompt, None, vec![prompt]);
        let k = Continuation::capture(&seg, SegmentId::new(0, 0), Some(DispatchId::fresh()));
        let ctx = DispatchContext {
            dispatch_id: DispatchId::fresh(),
            effect: Effect::get("x"),
            handler_chain: vec![prompt],
            handler_idx: 0,
            k_user: k,
            prompt_seg: SegmentId::new(1, 0),
            handler_seg: SegmentId::new(2, 0),
            completed: false,
        };
        let copy = ctx.clone();
        assert_eq!(copy.handler_chain, ctx.handler_chain);
        assert!(!copy.completed);
    }
}
