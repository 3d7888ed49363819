//! Continuation capture and resumption handles.

use std::sync::Arc;

use crate::frame::Frame;
use crate::handler::HandlerRef;
use crate::ids::{ContId, DispatchId, PromptId, SegmentId};
use crate::program::ProgramRef;
use crate::segment::Segment;

/// Opaque handle to a suspended caller.
///
/// Holds `Arc` snapshots of the captured segment's frames and scope chain;
/// `Resume`/`Transfer` materialize the snapshot into a fresh execution
/// segment. The handle is deliberately `Clone` (the scheduler stores and
/// moves them), so one-shot use is enforced by the VM's consumed-ID set
/// rather than move semantics.
///
/// Two states:
/// - **started** (captured): taken from a running segment at an effect yield.
/// - **unstarted** (created): carries a program plus the handlers to install
///   around it; resuming starts the program. The scheduler builds spawned
///   tasks this way.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub cont_id: ContId,
    pub segment_id: SegmentId,
    pub frames_snapshot: Arc<Vec<Frame>>,
    pub scope_chain: Arc<Vec<PromptId>>,
    pub prompt: PromptId,
    pub dispatch_id: Option<DispatchId>,
    pub started: bool,
    /// Program to start when `started == false`.
    pub program: Option<ProgramRef>,
    /// Handlers to install around `program`, innermost first.
    pub handlers: Vec<HandlerRef>,
}

impl Continuation {
    pub fn capture(segment: &Segment, segment_id: SegmentId, dispatch_id: Option<DispatchId>) -> Self {
        Continuation {
            cont_id: ContId::fresh(),
            segment_id,
            frames_snapshot: Arc::new(segment.frames.clone()),
            scope_chain: Arc::new(segment.scope_chain.clone()),
            prompt: segment.prompt,
            dispatch_id,
            started: true,
            program: None,
            handlers: Vec::new(),
        }
    }

    pub fn create(program: ProgramRef, handlers: Vec<HandlerRef>) -> Self {
        Continuation {
            cont_id: ContId::fresh(),
            segment_id: SegmentId::new(0, 0),
            frames_snapshot: Arc::new(Vec::new()),
            scope_chain: Arc::new(Vec::new()),
            prompt: PromptId::placeholder(),
            dispatch_id: None,
            started: false,
            program: None,
            handlers,
        }
        .with_program(program)
    }

    fn with_program(mut self, program: ProgramRef) -> Self {
        self.program = Some(program);
        self
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CallbackId;
    use crate::program;
    use crate::program::StreamStep;
    use crate::value::Value;

    fn make_segment() -> (Segment, SegmentId) {
        let prompt = PromptId::fresh();
        let seg = Segment::body(prompt, None, vec![prompt]);
        (seg, SegmentId::new(0, 0))
    }

    #[test]
    fn test_capture_snapshots_segment() {
        let (seg, seg_id) = make_segment();
        let k = Continuation::capture(&seg, seg_id, None);

        assert_eq!(k.segment_id, seg_id);
        assert_eq!(k.prompt, seg.prompt);
        assert!(k.dispatch_id.is_none());
        assert!(k.frames_snapshot.is_empty());
        assert_eq!(k.scope_chain.len(), 1);
        assert!(k.is_started());
        assert!(k.program.is_none());
    }

    #[test]
    fn test_capture_ids_are_unique() {
        let (seg, seg_id) = make_segment();
        let a = Continuation::capture(&seg, seg_id, None);
        let b = Continuation::capture(&seg, seg_id, None);
        assert_ne!(a.cont_id, b.cont_id);
    }

    #[test]
    fn test_snapshot_is_independent_of_segment() {
        let (mut seg, seg_id) = make_segment();
        seg.push_frame(Frame::ret(CallbackId::fresh()));

        let k = Continuation::capture(&seg, seg_id, None);
        assert_eq!(k.frames_snapshot.len(), 1);

        seg.push_frame(Frame::ret(CallbackId::fresh()));
        assert_eq!(k.frames_snapshot.len(), 1);
        assert_eq!(seg.frame_count(), 2);
    }

    #[test]
    fn test_created_continuation_is_unstarted() {
        let prog = program::from_fn("noop", |_, _| StreamStep::Return(Value::Unit));
        let k = Continuation::create(prog, vec![]);
        assert!(!k.is_started());
        assert!(k.program.is_some());
    }
}
