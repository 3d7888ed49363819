//! Segment types for delimited continuations.

use crate::frame::Frame;
use crate::ids::{DispatchId, PromptId, SegmentId};

/// What role a segment plays in the delimited-control graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    /// A running program body with a local frame stack.
    Body,
    /// Marks an installed handler; `Delegate` and dispatch walk to these.
    Prompt { handled: PromptId },
    /// Pairs with a prompt; routes the final value a handler body evaluated
    /// to back out of the `WithHandler` expression.
    HandlerReturn { prompt: SegmentId },
    /// Runs a handler's body for one dispatch; records which dispatch the
    /// produced value belongs to.
    DispatchReturn { dispatch: DispatchId },
}

#[derive(Debug)]
pub struct Segment {
    /// Innermost prompt in whose scope this segment runs.
    pub prompt: PromptId,
    pub frames: Vec<Frame>,
    pub caller: Option<SegmentId>,
    /// Immutable snapshot of ancestor prompts, innermost first.
    pub scope_chain: Vec<PromptId>,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn body(prompt: PromptId, caller: Option<SegmentId>, scope_chain: Vec<PromptId>) -> Self {
        Segment {
            prompt,
            frames: Vec::new(),
            caller,
            scope_chain,
            kind: SegmentKind::Body,
        }
    }

    pub fn prompt_boundary(
        handled: PromptId,
        caller: Option<SegmentId>,
        scope_chain: Vec<PromptId>,
    ) -> Self {
        Segment {
            prompt: handled,
            frames: Vec::new(),
            caller,
            scope_chain,
            kind: SegmentKind::Prompt { handled },
        }
    }

    pub fn handler_return(
        prompt: PromptId,
        prompt_seg: SegmentId,
        caller: Option<SegmentId>,
        scope_chain: Vec<PromptId>,
    ) -> Self {
        Segment {
            prompt,
            frames: Vec::new(),
            caller,
            scope_chain,
            kind: SegmentKind::HandlerReturn { prompt: prompt_seg },
        }
    }

    pub fn dispatch_return(
        prompt: PromptId,
        dispatch: DispatchId,
        caller: Option<SegmentId>,
        scope_chain: Vec<PromptId>,
    ) -> Self {
        Segment {
            prompt,
            frames: Vec::new(),
            caller,
            scope_chain,
            kind: SegmentKind::DispatchReturn { dispatch },
        }
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_prompt_boundary(&self) -> bool {
        matches!(self.kind, SegmentKind::Prompt { .. })
    }

    pub fn handled_prompt(&self) -> Option<PromptId> {
        match &self.kind {
            SegmentKind::Prompt { handled } => Some(*handled),
            _ => None,
        }
    }
}
