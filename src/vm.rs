//! The VM: phase-based step machine and dispatch engine.
//!
//! One `step` advances exactly one thing: a frame receives a value or a
//! failure, a yielded value gets classified, or a finished segment delivers
//! to its caller. Dispatch primitives splice continuation snapshots into the
//! live segment graph; nothing is ever mutated in place across a capture.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::arena::SegmentArena;
use crate::capture::{
    DispatchOutcome, DispatchRecord, ExecutionSnapshot, FrameDescriptor, SnapshotStatus,
};
use crate::continuation::Continuation;
use crate::ctl::{Ctl, Yielded};
use crate::dispatch::{DispatchContext, HandlerEntry};
use crate::effect::Effect;
use crate::error::{Failure, VmError};
use crate::frame::Frame;
use crate::handler::{HandlerAction, HandlerInvocation, HandlerRef};
use crate::host::HostAsyncEscape;
use crate::ids::{CallbackId, ContId, DispatchId, PromptId, SegmentId};
use crate::program::{self, ProgramRef, StreamStep};
use crate::segment::{Segment, SegmentKind};
use crate::store::Store;
use crate::value::Value;

const TRACE_LIMIT: usize = 1024;

pub(crate) type Callback = Box<dyn FnOnce(Value, &mut Vm) -> Phase + Send>;

/// What the machine does on its next step.
#[derive(Debug)]
pub(crate) enum Phase {
    /// Deliver a value to the top frame of the current segment.
    Deliver(Value),
    /// Unwind a failure through the current segment's frames.
    Raise(Failure),
    /// Classify a value a stream just yielded.
    Classify(Yielded),
    /// The current segment finished with this value.
    Complete(Value),
}

/// Public outcome of one step.
#[derive(Debug)]
pub enum StepOutcome {
    Running,
    Done(Value),
    Failed(Failure),
    HostAsync(HostAsyncEscape),
}

pub struct Vm {
    pub(crate) segments: SegmentArena,
    pub(crate) dispatch_stack: Vec<DispatchContext>,
    callbacks: FxHashMap<CallbackId, Callback>,
    consumed: FxHashSet<ContId>,
    pub(crate) handlers: FxHashMap<PromptId, HandlerEntry>,
    pub store: Store,
    pub(crate) current_segment: Option<SegmentId>,
    phase: Phase,
    pub step_count: u64,
    pending_host: Option<Continuation>,
    trace: Vec<DispatchRecord>,
}

impl Vm {
    pub fn new(store: Store) -> Self {
        Vm {
            segments: SegmentArena::new(),
            dispatch_stack: Vec::new(),
            callbacks: FxHashMap::default(),
            consumed: FxHashSet::default(),
            handlers: FxHashMap::default(),
            store,
            current_segment: None,
            phase: Phase::Deliver(Value::Unit),
            step_count: 0,
            pending_host: None,
            trace: Vec::new(),
        }
    }

    /// Install the root program as the initial body segment.
    pub fn load_root(&mut self, program: ProgramRef) {
        let mut root = Segment::body(PromptId::placeholder(), None, Vec::new());
        root.push_frame(Frame::stream(program));
        let root_id = self.segments.alloc(root);
        self.current_segment = Some(root_id);
        self.phase = Phase::Deliver(Value::Unit);
    }

    pub fn trace_records(&self) -> &[DispatchRecord] {
        &self.trace
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatch_stack.iter().any(|ctx| !ctx.completed)
    }

    /// Advance the machine by one step.
    pub fn step(&mut self) -> StepOutcome {
        self.step_count += 1;
        let phase = std::mem::replace(&mut self.phase, Phase::Deliver(Value::Unit));
        match phase {
            Phase::Deliver(value) => self.step_frames(Ok(value)),
            Phase::Raise(failure) => self.step_frames(Err(failure)),
            Phase::Classify(yielded) => self.step_classify(yielded),
            Phase::Complete(value) => self.step_complete(value),
        }
    }

    /// Feed a host-async outcome back into the continuation parked by the
    /// escape-producing `Await` handler.
    pub fn complete_host_async(&mut self, outcome: Result<Value, Failure>) -> StepOutcome {
        match self.pending_host.take() {
            Some(k) => self.apply_resume(k, outcome),
            None => StepOutcome::Failed(Failure::from_vm(VmError::internal(
                "host-async completion without a pending escape",
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Frame delivery
    // ------------------------------------------------------------------

    fn step_frames(&mut self, input: Result<Value, Failure>) -> StepOutcome {
        let Some(seg_id) = self.current_segment else {
            return match input {
                Ok(value) => StepOutcome::Done(value),
                Err(failure) => StepOutcome::Failed(failure),
            };
        };

        let frame = match self.segments.get_mut(seg_id) {
            Some(segment) => segment.pop_frame(),
            None => {
                return StepOutcome::Failed(Failure::from_vm(VmError::invalid_segment(
                    "current segment was reclaimed",
                )))
            }
        };

        let Some(frame) = frame else {
            return self.segment_exhausted(seg_id, input);
        };

        match frame {
            Frame::Return { cb } => {
                let callback = self.callbacks.remove(&cb);
                match input {
                    Ok(value) => match callback {
                        Some(callback) => {
                            self.phase = callback(value, self);
                            StepOutcome::Running
                        }
                        None => StepOutcome::Failed(Failure::from_vm(VmError::internal(
                            "return frame without a registered callback",
                        ))),
                    },
                    // Unwinding skips return frames; the callback is dropped.
                    Err(failure) => {
                        self.phase = Phase::Raise(failure);
                        StepOutcome::Running
                    }
                }
            }

            Frame::Catch => {
                self.phase = match input {
                    Ok(value) => Phase::Deliver(Value::ok(value)),
                    Err(failure) => Phase::Deliver(Value::err(failure)),
                };
                StepOutcome::Running
            }

            Frame::Finally { cleanup } => {
                let restore = match input {
                    Ok(value) => Phase::Deliver(value),
                    Err(failure) => Phase::Raise(failure),
                };
                self.phase = self.queue_cleanups(seg_id, vec![cleanup], restore);
                StepOutcome::Running
            }

            Frame::Stream {
                stream,
                started: _,
                meta,
            } => {
                let step = {
                    let mut guard = stream.lock().expect("stream lock poisoned");
                    match input {
                        Ok(value) => guard.resume(value, &mut self.store),
                        Err(failure) => guard.throw(failure, &mut self.store),
                    }
                };
                match step {
                    StreamStep::Yield(yielded) => {
                        if let Some(segment) = self.segments.get_mut(seg_id) {
                            segment.push_frame(Frame::Stream {
                                stream,
                                started: true,
                                meta,
                            });
                        }
                        self.phase = Phase::Classify(yielded);
                        StepOutcome::Running
                    }
                    StreamStep::Return(value) => {
                        self.phase = Phase::Deliver(value);
                        StepOutcome::Running
                    }
                    StreamStep::Throw(failure) => {
                        self.phase = Phase::Raise(failure);
                        StepOutcome::Running
                    }
                }
            }
        }
    }

    /// The current segment has no frames left for the in-flight value or
    /// failure: leave it and continue at the caller.
    fn segment_exhausted(&mut self, seg_id: SegmentId, input: Result<Value, Failure>) -> StepOutcome {
        match input {
            Ok(value) => {
                self.phase = Phase::Complete(value);
                StepOutcome::Running
            }
            Err(failure) => {
                let (caller, cleanups) = self.exit_segment(seg_id, true);
                self.current_segment = caller;
                match caller {
                    Some(caller_id) => {
                        self.phase = if cleanups.is_empty() {
                            Phase::Raise(failure)
                        } else {
                            self.queue_cleanups(caller_id, cleanups, Phase::Raise(failure))
                        };
                        StepOutcome::Running
                    }
                    None => self.finish_at_root(cleanups, Err(failure)),
                }
            }
        }
    }

    fn step_complete(&mut self, value: Value) -> StepOutcome {
        let Some(seg_id) = self.current_segment else {
            return StepOutcome::Done(value);
        };
        let (caller, cleanups) = self.exit_segment(seg_id, false);
        self.current_segment = caller;
        match caller {
            Some(caller_id) => {
                self.phase = if cleanups.is_empty() {
                    Phase::Deliver(value)
                } else {
                    self.queue_cleanups(caller_id, cleanups, Phase::Deliver(value))
                };
                StepOutcome::Running
            }
            None => self.finish_at_root(cleanups, Ok(value)),
        }
    }

    /// Terminal delivery with no caller left. Outstanding cleanups still run,
    /// in a scratch segment, before the machine reports Done/Failed.
    fn finish_at_root(
        &mut self,
        cleanups: Vec<ProgramRef>,
        outcome: Result<Value, Failure>,
    ) -> StepOutcome {
        if cleanups.is_empty() {
            return match outcome {
                Ok(value) => StepOutcome::Done(value),
                Err(failure) => StepOutcome::Failed(failure),
            };
        }
        let scratch = Segment::body(PromptId::placeholder(), None, Vec::new());
        let scratch_id = self.segments.alloc(scratch);
        self.current_segment = Some(scratch_id);
        let restore = match outcome {
            Ok(value) => Phase::Complete(value),
            Err(failure) => Phase::Raise(failure),
        };
        self.phase = self.queue_cleanups(scratch_id, cleanups, restore);
        StepOutcome::Running
    }

    /// Leave `seg_id` upward: uninstall prompt handlers, finalize dispatches
    /// bound to it, reclaim the slot. Returns the caller and any abandoned
    /// finally cleanups that still must run.
    fn exit_segment(&mut self, seg_id: SegmentId, failing: bool) -> (Option<SegmentId>, Vec<ProgramRef>) {
        let (caller, kind) = match self.segments.get(seg_id) {
            Some(segment) => (segment.caller, segment.kind.clone()),
            None => return (None, Vec::new()),
        };
        let mut cleanups = Vec::new();
        match kind {
            SegmentKind::Prompt { handled } => {
                trace!(prompt = handled.raw(), "uninstall handler");
                self.handlers.remove(&handled);
                let bound: Vec<DispatchId> = self
                    .dispatch_stack
                    .iter()
                    .filter(|ctx| ctx.prompt_seg == seg_id && !ctx.completed)
                    .map(|ctx| ctx.dispatch_id)
                    .collect();
                for dispatch_id in bound {
                    let outcome = if failing {
                        DispatchOutcome::Threw
                    } else {
                        DispatchOutcome::Returned
                    };
                    cleanups.extend(self.finalize_dispatch(dispatch_id, outcome));
                }
            }
            SegmentKind::DispatchReturn { dispatch } => {
                let outcome = if failing {
                    DispatchOutcome::Threw
                } else {
                    DispatchOutcome::Returned
                };
                cleanups.extend(self.finalize_dispatch(dispatch, outcome));
            }
            SegmentKind::Body | SegmentKind::HandlerReturn { .. } => {}
        }
        self.segments.free(seg_id);
        self.lazy_pop_completed();
        (caller, cleanups)
    }

    /// Queue `cleanups` (innermost first) on `seg_id`, restoring `restore`
    /// once they all ran. Returns the phase that starts the first cleanup.
    fn queue_cleanups(
        &mut self,
        seg_id: SegmentId,
        cleanups: Vec<ProgramRef>,
        restore: Phase,
    ) -> Phase {
        let cb = self.register_callback(Box::new(move |_value, _vm| restore));
        if let Some(segment) = self.segments.get_mut(seg_id) {
            segment.push_frame(Frame::ret(cb));
            for cleanup in cleanups.into_iter().rev() {
                segment.push_frame(Frame::stream(cleanup));
            }
        }
        Phase::Deliver(Value::Unit)
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    fn step_classify(&mut self, yielded: Yielded) -> StepOutcome {
        trace!(yielded = %yielded.describe(), "classify");
        match yielded {
            Yielded::Thunk(program) => {
                let Some(seg_id) = self.current_segment else {
                    return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                        "thunk yielded without a current segment",
                    )));
                };
                if let Some(segment) = self.segments.get_mut(seg_id) {
                    segment.push_frame(Frame::stream(program));
                }
                self.phase = Phase::Deliver(Value::Unit);
                StepOutcome::Running
            }
            Yielded::Effect(effect) => self.start_dispatch(effect),
            Yielded::Ctl(ctl) => self.step_ctl(ctl),
        }
    }

    fn step_ctl(&mut self, ctl: Ctl) -> StepOutcome {
        match ctl {
            Ctl::Pure { value } => {
                self.phase = Phase::Deliver(value);
                StepOutcome::Running
            }
            Ctl::WithHandler { handler, expr } => self.install_with_handler(handler, expr),
            Ctl::Resume {
                continuation,
                value,
            } => self.apply_resume(continuation, Ok(value)),
            Ctl::ResumeThrow {
                continuation,
                error,
            } => self.apply_resume(continuation, Err(error)),
            Ctl::Transfer {
                continuation,
                value,
            } => self.apply_transfer(continuation, Ok(value), None),
            Ctl::TransferThrow {
                continuation,
                error,
            } => self.apply_transfer(continuation, Err(error), None),
            Ctl::TransferCall {
                continuation,
                program,
            } => self.apply_transfer(continuation, Ok(Value::Unit), Some(program)),
            Ctl::Delegate { effect } => self.handle_delegate(effect),
            Ctl::GetHandlers => {
                let handlers = self.scope_handler_refs();
                self.phase = Phase::Deliver(Value::Handlers(handlers));
                StepOutcome::Running
            }
            Ctl::CreateContinuation { program, handlers } => {
                let k = Continuation::create(program, handlers);
                self.phase = Phase::Deliver(Value::Continuation(k));
                StepOutcome::Running
            }
            Ctl::Eval { program, handlers } => {
                let Some(seg_id) = self.current_segment else {
                    return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                        "Eval without a current segment",
                    )));
                };
                let wrapped = wrap_with_handlers(program, handlers);
                if let Some(segment) = self.segments.get_mut(seg_id) {
                    segment.push_frame(Frame::stream(wrapped));
                }
                self.phase = Phase::Deliver(Value::Unit);
                StepOutcome::Running
            }
            Ctl::Protect { body, cleanup } => {
                let Some(seg_id) = self.current_segment else {
                    return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                        "Protect without a current segment",
                    )));
                };
                if let Some(segment) = self.segments.get_mut(seg_id) {
                    segment.push_frame(Frame::Finally { cleanup });
                    segment.push_frame(Frame::stream(body));
                }
                self.phase = Phase::Deliver(Value::Unit);
                StepOutcome::Running
            }
            Ctl::Catch { body } => {
                let Some(seg_id) = self.current_segment else {
                    return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                        "Catch without a current segment",
                    )));
                };
                if let Some(segment) = self.segments.get_mut(seg_id) {
                    segment.push_frame(Frame::Catch);
                    segment.push_frame(Frame::stream(body));
                }
                self.phase = Phase::Deliver(Value::Unit);
                StepOutcome::Running
            }
        }
    }

    // ------------------------------------------------------------------
    // WithHandler installation
    // ------------------------------------------------------------------

    fn install_with_handler(&mut self, handler: HandlerRef, expr: ProgramRef) -> StepOutcome {
        let Some(outside_id) = self.current_segment else {
            return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                "WithHandler without a current segment",
            )));
        };
        let outside_scope = self
            .segments
            .get(outside_id)
            .map(|segment| segment.scope_chain.clone())
            .unwrap_or_default();

        let prompt = PromptId::fresh();
        debug!(prompt = prompt.raw(), handler = handler.name(), "install handler");
        let prompt_seg = Segment::prompt_boundary(prompt, Some(outside_id), outside_scope.clone());
        let prompt_seg_id = self.segments.alloc(prompt_seg);
        self.handlers
            .insert(prompt, HandlerEntry::new(handler, prompt_seg_id));

        let mut body_scope = Vec::with_capacity(outside_scope.len() + 1);
        body_scope.push(prompt);
        body_scope.extend(outside_scope);
        let mut body = Segment::body(prompt, Some(prompt_seg_id), body_scope);
        body.push_frame(Frame::stream(expr));
        let body_id = self.segments.alloc(body);
        self.current_segment = Some(body_id);
        self.phase = Phase::Deliver(Value::Unit);
        StepOutcome::Running
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(crate) fn current_scope_chain(&self) -> Vec<PromptId> {
        self.current_segment
            .and_then(|id| self.segments.get(id))
            .map(|segment| segment.scope_chain.clone())
            .unwrap_or_default()
    }

    pub(crate) fn lazy_pop_completed(&mut self) {
        while let Some(top) = self.dispatch_stack.last() {
            if top.completed {
                self.dispatch_stack.pop();
            } else {
                break;
            }
        }
    }

    /// Busy boundary: handlers at or inside the active handler of the top
    /// non-completed dispatch are excluded, so a handler's own emissions only
    /// ever reach strictly outer handlers.
    pub(crate) fn visible_handlers(&self, scope_chain: &[PromptId]) -> Vec<PromptId> {
        let installed =
            |prompt: &PromptId| -> bool { self.handlers.contains_key(prompt) };
        let Some(top) = self.dispatch_stack.last() else {
            return scope_chain.iter().copied().filter(installed).collect();
        };
        if top.completed || self.consumed.contains(&top.k_user.cont_id) {
            return scope_chain.iter().copied().filter(installed).collect();
        }
        let busy: FxHashSet<PromptId> = top.handler_chain[..=top.handler_idx]
            .iter()
            .copied()
            .collect();
        scope_chain
            .iter()
            .copied()
            .filter(|prompt| !busy.contains(prompt) && installed(prompt))
            .collect()
    }

    /// Handler instances visible at the current scope, innermost first.
    /// Introspection, not dispatch: the busy boundary does not apply.
    fn scope_handler_refs(&self) -> Vec<HandlerRef> {
        self.current_scope_chain()
            .iter()
            .filter_map(|prompt| self.handlers.get(prompt).map(|entry| entry.handler.clone()))
            .collect()
    }

    fn start_dispatch(&mut self, effect: Effect) -> StepOutcome {
        self.lazy_pop_completed();
        let scope_chain = self.current_scope_chain();
        let chain = self.visible_handlers(&scope_chain);

        let found = chain.iter().enumerate().find_map(|(idx, prompt)| {
            self.handlers
                .get(prompt)
                .filter(|entry| entry.handler.can_handle(&effect))
                .map(|entry| (idx, entry.clone()))
        });
        let Some((handler_idx, entry)) = found else {
            debug!(effect = %effect.repr(), "unhandled effect");
            self.phase = Phase::Raise(Failure::unhandled(effect));
            return StepOutcome::Running;
        };

        let Some(seg_id) = self.current_segment else {
            return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                "dispatch without a current segment",
            )));
        };
        let Some(current) = self.segments.get(seg_id) else {
            return StepOutcome::Failed(Failure::from_vm(VmError::invalid_segment(
                "current segment not found during dispatch",
            )));
        };

        let dispatch_id = DispatchId::fresh();
        let k_user = Continuation::capture(current, seg_id, Some(dispatch_id));
        trace!(
            dispatch = dispatch_id.raw(),
            effect = %effect.repr(),
            handler = entry.handler.name(),
            "dispatch"
        );

        let handler_prompt = chain[handler_idx];
        let handler_seg = Segment::dispatch_return(
            handler_prompt,
            dispatch_id,
            Some(entry.prompt_seg),
            scope_chain,
        );
        let handler_seg_id = self.segments.alloc(handler_seg);
        self.current_segment = Some(handler_seg_id);

        self.push_trace(DispatchRecord {
            dispatch_id: dispatch_id.raw(),
            effect_repr: effect.repr(),
            handler_name: entry.handler.name().to_string(),
            handler_kind: entry.handler.kind(),
            creation_site: Some(effect.site().clone()),
            delegation_chain: Vec::new(),
            outcome: DispatchOutcome::Active,
        });

        self.dispatch_stack.push(DispatchContext {
            dispatch_id,
            effect: effect.clone(),
            handler_chain: chain,
            handler_idx,
            k_user: k_user.clone(),
            prompt_seg: entry.prompt_seg,
            handler_seg: handler_seg_id,
            completed: false,
        });

        self.invoke_handler(entry.handler, effect, k_user, dispatch_id)
    }

    fn invoke_handler(
        &mut self,
        handler: HandlerRef,
        effect: Effect,
        k_user: Continuation,
        dispatch_id: DispatchId,
    ) -> StepOutcome {
        match handler.invoke(effect, k_user, &mut self.store) {
            HandlerInvocation::Action(action) => self.apply_handler_action(action),
            HandlerInvocation::Stream(stream) => {
                let cb = self.register_callback(Box::new(move |value, vm| {
                    vm.handler_returned(dispatch_id, value)
                }));
                let Some(segment) = self.current_segment_mut() else {
                    return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                        "handler invocation without a current segment",
                    )));
                };
                segment.push_frame(Frame::ret(cb));
                segment.push_frame(Frame::stream(stream));
                self.phase = Phase::Deliver(Value::Unit);
                StepOutcome::Running
            }
        }
    }

    /// A handler body evaluated to `value`. If the dispatch is still open the
    /// handler returned without resuming: the dispatch ends here and the
    /// value becomes the value of the surrounding `WithHandler`. If the
    /// dispatch already completed (the handler resumed earlier), the value
    /// simply continues to the caller chain.
    fn handler_returned(&mut self, dispatch_id: DispatchId, value: Value) -> Phase {
        let open_prompt = self
            .dispatch_stack
            .iter()
            .rev()
            .find(|ctx| ctx.dispatch_id == dispatch_id)
            .filter(|ctx| !ctx.completed)
            .map(|ctx| ctx.prompt_seg);
        let Some(prompt_seg) = open_prompt else {
            self.lazy_pop_completed();
            return Phase::Deliver(value);
        };

        let cleanups = self.finalize_dispatch(dispatch_id, DispatchOutcome::Returned);
        self.lazy_pop_completed();

        let Some((prompt_id, scope_chain)) = self
            .segments
            .get(prompt_seg)
            .map(|segment| (segment.prompt, segment.scope_chain.clone()))
        else {
            return Phase::Deliver(value);
        };

        if let Some(seg_id) = self.current_segment {
            self.segments.free(seg_id);
        }
        let hr = Segment::handler_return(prompt_id, prompt_seg, Some(prompt_seg), scope_chain);
        let hr_id = self.segments.alloc(hr);
        self.current_segment = Some(hr_id);

        if cleanups.is_empty() {
            Phase::Deliver(value)
        } else {
            self.queue_cleanups(hr_id, cleanups, Phase::Deliver(value))
        }
    }

    fn apply_handler_action(&mut self, action: HandlerAction) -> StepOutcome {
        match action {
            HandlerAction::Resume { k, value } => self.apply_resume(k, Ok(value)),
            HandlerAction::ResumeThrow { k, error } => self.apply_resume(k, Err(error)),
            HandlerAction::Transfer { k, value } => self.apply_transfer(k, Ok(value), None),
            HandlerAction::Return { value } => {
                let Some(top) = self.dispatch_stack.last() else {
                    return StepOutcome::Failed(Failure::from_vm(VmError::outside_dispatch(
                        "Return",
                    )));
                };
                let dispatch_id = top.dispatch_id;
                self.phase = self.handler_returned(dispatch_id, value);
                StepOutcome::Running
            }
            HandlerAction::Throw { error } => {
                self.phase = Phase::Raise(error);
                StepOutcome::Running
            }
            HandlerAction::HostEscape { k, future } => match future.take() {
                Some(awaitable) => {
                    self.pending_host = Some(k);
                    StepOutcome::HostAsync(HostAsyncEscape { awaitable })
                }
                None => StepOutcome::Failed(Failure::from_vm(VmError::internal(
                    "await future already consumed",
                ))),
            },
        }
    }

    // ------------------------------------------------------------------
    // Resume / Transfer
    // ------------------------------------------------------------------

    fn apply_resume(&mut self, k: Continuation, input: Result<Value, Failure>) -> StepOutcome {
        if !k.started {
            return self.start_unstarted(k, input, true);
        }
        if self.consumed.contains(&k.cont_id) {
            return StepOutcome::Failed(Failure::from_vm(VmError::one_shot(k.cont_id)));
        }
        self.consumed.insert(k.cont_id);
        self.lazy_pop_completed();
        self.mark_dispatch_for_k(&k, DispatchOutcome::Resumed);

        let exec = Segment {
            prompt: k.prompt,
            frames: (*k.frames_snapshot).clone(),
            caller: self.current_segment,
            scope_chain: (*k.scope_chain).clone(),
            kind: SegmentKind::Body,
        };
        let exec_id = self.segments.alloc(exec);
        self.current_segment = Some(exec_id);
        self.phase = match input {
            Ok(value) => Phase::Deliver(value),
            Err(failure) => Phase::Raise(failure),
        };
        StepOutcome::Running
    }

    fn apply_transfer(
        &mut self,
        k: Continuation,
        input: Result<Value, Failure>,
        entry_program: Option<ProgramRef>,
    ) -> StepOutcome {
        if !k.started {
            return self.start_unstarted(k, input, false);
        }
        if self.consumed.contains(&k.cont_id) {
            return StepOutcome::Failed(Failure::from_vm(VmError::one_shot(k.cont_id)));
        }
        self.consumed.insert(k.cont_id);
        self.lazy_pop_completed();

        // Capture drops the caller pointer, but the suspended source segment
        // is still in the arena; Transfer rethreads the restored caller onto
        // that original chain, bypassing the abandoned handler body.
        let caller = self
            .segments
            .get(k.segment_id)
            .and_then(|segment| segment.caller);
        self.mark_dispatch_for_k(&k, DispatchOutcome::Transferred);

        let cleanups = self.abandon_current_segment();

        let exec = Segment {
            prompt: k.prompt,
            frames: (*k.frames_snapshot).clone(),
            caller,
            scope_chain: (*k.scope_chain).clone(),
            kind: SegmentKind::Body,
        };
        let exec_id = self.segments.alloc(exec);
        self.current_segment = Some(exec_id);

        let has_entry = entry_program.is_some();
        if let Some(program) = entry_program {
            if let Some(segment) = self.segments.get_mut(exec_id) {
                segment.push_frame(Frame::stream(program));
            }
        }

        let after = if has_entry {
            Phase::Deliver(Value::Unit)
        } else {
            match input {
                Ok(value) => Phase::Deliver(value),
                Err(failure) => Phase::Raise(failure),
            }
        };
        self.phase = if cleanups.is_empty() {
            after
        } else {
            self.queue_cleanups(exec_id, cleanups, after)
        };
        StepOutcome::Running
    }

    /// Materialize an unstarted continuation: install its handlers around a
    /// fresh body running its program.
    fn start_unstarted(
        &mut self,
        k: Continuation,
        input: Result<Value, Failure>,
        keep_caller: bool,
    ) -> StepOutcome {
        if self.consumed.contains(&k.cont_id) {
            return StepOutcome::Failed(Failure::from_vm(VmError::one_shot(k.cont_id)));
        }
        self.consumed.insert(k.cont_id);
        let Some(program) = k.program else {
            return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                "unstarted continuation without a program",
            )));
        };

        let mut parent = if keep_caller { self.current_segment } else { None };
        let mut scope: Vec<PromptId> = Vec::new();
        // k.handlers is innermost-first; install outermost first.
        for handler in k.handlers.iter().rev() {
            let prompt = PromptId::fresh();
            let prompt_seg = Segment::prompt_boundary(prompt, parent, scope.clone());
            let prompt_seg_id = self.segments.alloc(prompt_seg);
            self.handlers
                .insert(prompt, HandlerEntry::new(handler.clone(), prompt_seg_id));
            scope.insert(0, prompt);
            parent = Some(prompt_seg_id);
        }

        let innermost = scope.first().copied().unwrap_or_else(PromptId::placeholder);
        let mut body = Segment::body(innermost, parent, scope);
        body.push_frame(Frame::stream(program));
        let body_id = self.segments.alloc(body);
        self.current_segment = Some(body_id);
        self.phase = match input {
            Ok(value) => Phase::Deliver(value),
            Err(failure) => Phase::Raise(failure),
        };
        StepOutcome::Running
    }

    /// Abandon the current segment permanently, harvesting its finally
    /// cleanups (innermost first) and dropping everything else.
    fn abandon_current_segment(&mut self) -> Vec<ProgramRef> {
        let Some(seg_id) = self.current_segment.take() else {
            return Vec::new();
        };
        let frames = match self.segments.get_mut(seg_id) {
            Some(segment) => std::mem::take(&mut segment.frames),
            None => return Vec::new(),
        };
        let mut cleanups = Vec::new();
        for frame in frames.into_iter().rev() {
            match frame {
                Frame::Finally { cleanup } => cleanups.push(cleanup),
                Frame::Return { cb } => {
                    self.callbacks.remove(&cb);
                }
                Frame::Catch | Frame::Stream { .. } => {}
            }
        }
        self.segments.free(seg_id);
        cleanups
    }

    // ------------------------------------------------------------------
    // Delegate
    // ------------------------------------------------------------------

    fn handle_delegate(&mut self, substitute: Option<Effect>) -> StepOutcome {
        let Some(top) = self.dispatch_stack.last() else {
            return StepOutcome::Failed(Failure::from_vm(VmError::outside_dispatch("Delegate")));
        };
        if top.completed {
            return StepOutcome::Failed(Failure::from_vm(VmError::outside_dispatch("Delegate")));
        }
        let dispatch_id = top.dispatch_id;
        let prompt_seg = top.prompt_seg;
        let k_user = top.k_user.clone();
        let chain = top.handler_chain.clone();
        let start_idx = top.handler_idx + 1;
        let effect = substitute.unwrap_or_else(|| top.effect.clone());

        // The delegating handler body is abandoned; its cleanups ride along
        // on the next handler's segment.
        let mut cleanups = self.abandon_current_segment();

        for idx in start_idx..chain.len() {
            let prompt = chain[idx];
            let Some(entry) = self.handlers.get(&prompt).cloned() else {
                continue;
            };
            if !entry.handler.can_handle(&effect) {
                continue;
            }

            self.record_delegation(dispatch_id, &entry);
            {
                let Some(top) = self.dispatch_stack.last_mut() else {
                    return StepOutcome::Failed(Failure::from_vm(VmError::internal(
                        "delegate lost its dispatch context",
                    )));
                };
                top.handler_idx = idx;
                top.effect = effect.clone();
            }

            let scope_chain = self
                .segments
                .get(prompt_seg)
                .map(|segment| segment.scope_chain.clone())
                .unwrap_or_default();
            let mut handler_seg =
                Segment::dispatch_return(prompt, dispatch_id, Some(prompt_seg), scope_chain);
            // Abandoned cleanups run as the dispatch value passes outward.
            for cleanup in cleanups.drain(..).rev() {
                handler_seg.push_frame(Frame::Finally { cleanup });
            }
            let handler_seg_id = self.segments.alloc(handler_seg);
            self.current_segment = Some(handler_seg_id);
            if let Some(top) = self.dispatch_stack.last_mut() {
                top.handler_seg = handler_seg_id;
            }

            return self.invoke_handler(entry.handler, effect, k_user, dispatch_id);
        }

        // Nobody outward accepts the effect.
        let failure = Failure::from_vm(VmError::delegate_no_outer(effect));
        let scratch = Segment::body(
            k_user.prompt,
            Some(prompt_seg),
            self.segments
                .get(prompt_seg)
                .map(|segment| segment.scope_chain.clone())
                .unwrap_or_default(),
        );
        let scratch_id = self.segments.alloc(scratch);
        self.current_segment = Some(scratch_id);
        self.phase = if cleanups.is_empty() {
            Phase::Raise(failure)
        } else {
            self.queue_cleanups(scratch_id, cleanups, Phase::Raise(failure))
        };
        StepOutcome::Running
    }

    // ------------------------------------------------------------------
    // Dispatch bookkeeping
    // ------------------------------------------------------------------

    fn mark_dispatch_for_k(&mut self, k: &Continuation, outcome: DispatchOutcome) {
        let Some(did) = k.dispatch_id else { return };
        let Some(idx) = self
            .dispatch_stack
            .iter()
            .rposition(|ctx| ctx.dispatch_id == did)
        else {
            return;
        };
        if self.dispatch_stack[idx].completed
            || self.dispatch_stack[idx].k_user.cont_id != k.cont_id
        {
            return;
        }
        self.dispatch_stack[idx].completed = true;
        self.record_outcome(did, outcome);
    }

    /// Close an open dispatch: mark completed, consume its continuation, and
    /// collect the abandoned caller's finally cleanups. The whole segment
    /// chain between the capture site and the dispatch prompt is abandoned,
    /// so every Finally on it is harvested (innermost first) and nested
    /// prompt installs on it are torn down.
    fn finalize_dispatch(&mut self, did: DispatchId, outcome: DispatchOutcome) -> Vec<ProgramRef> {
        let Some(idx) = self
            .dispatch_stack
            .iter()
            .rposition(|ctx| ctx.dispatch_id == did)
        else {
            return Vec::new();
        };
        if self.dispatch_stack[idx].completed {
            return Vec::new();
        }
        self.dispatch_stack[idx].completed = true;
        let k = self.dispatch_stack[idx].k_user.clone();
        let prompt_seg = self.dispatch_stack[idx].prompt_seg;
        self.record_outcome(did, outcome);

        let mut cleanups = Vec::new();
        if !self.consumed.contains(&k.cont_id) {
            self.consumed.insert(k.cont_id);
            for frame in k.frames_snapshot.iter().rev() {
                if let Frame::Finally { cleanup } = frame {
                    cleanups.push(cleanup.clone());
                }
            }
            cleanups.extend(self.harvest_abandoned_chain(k.segment_id, prompt_seg));
        }
        cleanups
    }

    /// Clear the abandoned segments strictly between `from` and `stop_at`,
    /// collecting their Finally cleanups and uninstalling any prompts.
    fn harvest_abandoned_chain(&mut self, from: SegmentId, stop_at: SegmentId) -> Vec<ProgramRef> {
        let mut cleanups = Vec::new();
        let mut cursor = self.segments.get(from).and_then(|segment| segment.caller);
        let mut hops = 0;
        while let Some(seg_id) = cursor {
            if seg_id == stop_at || hops > 1024 {
                break;
            }
            hops += 1;
            let (next, frames, prompt) = {
                let Some(segment) = self.segments.get_mut(seg_id) else {
                    break;
                };
                let next = segment.caller;
                let frames = std::mem::take(&mut segment.frames);
                (next, frames, segment.handled_prompt())
            };
            cursor = next;
            if let Some(handled) = prompt {
                self.handlers.remove(&handled);
            }
            for frame in frames.into_iter().rev() {
                match frame {
                    Frame::Finally { cleanup } => cleanups.push(cleanup),
                    Frame::Return { cb } => {
                        self.callbacks.remove(&cb);
                    }
                    Frame::Catch | Frame::Stream { .. } => {}
                }
            }
        }
        cleanups
    }

    fn push_trace(&mut self, record: DispatchRecord) {
        if self.trace.len() < TRACE_LIMIT {
            self.trace.push(record);
        }
    }

    fn record_outcome(&mut self, did: DispatchId, outcome: DispatchOutcome) {
        if let Some(record) = self
            .trace
            .iter_mut()
            .rev()
            .find(|record| record.dispatch_id == did.raw())
        {
            record.outcome = outcome;
        }
    }

    fn record_delegation(&mut self, did: DispatchId, entry: &HandlerEntry) {
        let hop = crate::capture::DelegationHop {
            handler_name: entry.handler.name().to_string(),
            handler_kind: entry.handler.kind(),
        };
        if let Some(record) = self
            .trace
            .iter_mut()
            .rev()
            .find(|record| record.dispatch_id == did.raw())
        {
            record.delegation_chain.push(hop);
        }
    }

    // ------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------

    pub(crate) fn register_callback(&mut self, callback: Callback) -> CallbackId {
        let id = CallbackId::fresh();
        self.callbacks.insert(id, callback);
        id
    }

    pub(crate) fn current_segment_mut(&mut self) -> Option<&mut Segment> {
        self.current_segment
            .and_then(|id| self.segments.get_mut(id))
    }

    pub fn snapshot(&self, status: SnapshotStatus) -> ExecutionSnapshot {
        let mut k_stack = Vec::new();
        let mut cursor = self.current_segment;
        let mut hops = 0;
        while let (Some(seg_id), true) = (cursor, hops < 32) {
            let Some(segment) = self.segments.get(seg_id) else {
                break;
            };
            for frame in segment.frames.iter().rev() {
                let detail = match frame {
                    Frame::Stream { stream, .. } => stream
                        .lock()
                        .ok()
                        .map(|guard| guard.name().to_string()),
                    _ => None,
                };
                k_stack.push(FrameDescriptor {
                    kind: frame.describe().to_string(),
                    detail,
                });
            }
            cursor = segment.caller;
            hops += 1;
        }
        let current_effect = self
            .dispatch_stack
            .iter()
            .rev()
            .find(|ctx| !ctx.completed)
            .map(|ctx| ctx.effect.repr());
        ExecutionSnapshot {
            status,
            k_stack,
            current_effect,
            step_count: self.step_count,
        }
    }
}

/// Nest `handlers` around `program` structurally: `[h0, h1, h2]` becomes
/// `WithHandler(h0, WithHandler(h1, WithHandler(h2, program)))`. The drivers
/// use exactly this, so passing handlers to `run` and nesting them by hand
/// are the same program.
pub fn wrap_with_handlers(program: ProgramRef, handlers: Vec<HandlerRef>) -> ProgramRef {
    handlers.into_iter().rev().fold(program, |inner, handler| {
        let mut pending = Some((handler, inner));
        program::from_fn("with-handler", move |event, _| {
            let value = match event.try_value() {
                Ok(value) => value,
                Err(error) => return StreamStep::Throw(error),
            };
            match pending.take() {
                Some((handler, expr)) => {
                    StreamStep::Yield(Yielded::Ctl(Ctl::WithHandler { handler, expr }))
                }
                None => StreamStep::Return(value),
            }
        })
    })
}
