//! Cooperative scheduler, implemented as an ordinary handler.
//!
//! The step machine never sees tasks or promises. Every scheduler effect is
//! answered by transferring into whichever continuation should run next,
//! swapping per-task stores on the way. Callers park when they wait
//! (`Gather`/`Race`) and are woken by transfer once their items resolve;
//! spawned task bodies report completion through the `TaskCompleted` effect
//! yielded by their wrapper.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::continuation::Continuation;
use crate::ctl::{Ctl, Yielded};
use crate::effect::{Effect, EffectKind};
use crate::error::Failure;
use crate::handler::HandlerRef;
use crate::ids::{PromiseId, TaskId};
use crate::program::{self, ProgramRef, ProgramStream, StreamEvent, StreamStep};
use crate::store::Store;
use crate::value::Value;

/// Effect variants handled by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedEffect {
    Spawn {
        program: ProgramRef,
        /// Handlers to install around the task; `None` captures the handlers
        /// visible at the spawn point.
        handlers: Option<Vec<HandlerRef>>,
        store_mode: StoreMode,
    },
    Gather {
        items: Vec<Value>,
    },
    Race {
        items: Vec<Value>,
    },
    CreatePromise,
    CompletePromise {
        promise: PromiseId,
        value: Value,
    },
    FailPromise {
        promise: PromiseId,
        error: Box<Failure>,
    },
    CreateExternalPromise,
    Cancel {
        task: TaskId,
    },
    /// Yielded by the task wrapper as a task body's final act.
    TaskCompleted {
        task: TaskId,
        result: Box<Result<Value, Failure>>,
    },
}

impl SchedEffect {
    pub fn repr(&self) -> String {
        match self {
            SchedEffect::Spawn { .. } => "Spawn(<program>)".to_string(),
            SchedEffect::Gather { items } => format!("Gather(<{} items>)", items.len()),
            SchedEffect::Race { items } => format!("Race(<{} items>)", items.len()),
            SchedEffect::CreatePromise => "CreatePromise".to_string(),
            SchedEffect::CompletePromise { promise, .. } => {
                format!("CompletePromise({})", promise.raw())
            }
            SchedEffect::FailPromise { promise, .. } => format!("FailPromise({})", promise.raw()),
            SchedEffect::CreateExternalPromise => "CreateExternalPromise".to_string(),
            SchedEffect::Cancel { task } => format!("Cancel({})", task.raw()),
            SchedEffect::TaskCompleted { task, .. } => format!("TaskCompleted({})", task.raw()),
        }
    }
}

/// Store isolation for spawned tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Child reads and writes the live store of whoever is running.
    Shared,
    /// Child runs on a snapshot taken at spawn; only its writer log merges
    /// back, appended in `Gather` input order.
    Isolated,
}

/// What a waiter can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Waitable {
    Task(TaskId),
    Promise(PromiseId),
}

/// Opaque handle to a spawned task.
#[derive(Debug, Clone, Copy)]
pub struct TaskHandle {
    pub id: TaskId,
}

/// Opaque handle to an in-VM promise.
#[derive(Debug, Clone, Copy)]
pub struct PromiseHandle {
    pub id: PromiseId,
}

type CompletionMsg = (PromiseId, Result<Value, Failure>);

/// Promise completed from outside the VM, possibly from another thread.
#[derive(Debug, Clone)]
pub struct ExternalPromise {
    pub id: PromiseId,
    completions: Sender<CompletionMsg>,
    _liveness: Arc<()>,
}

impl ExternalPromise {
    pub fn complete(&self, value: Value) {
        let _ = self.completions.send((self.id, Ok(value)));
    }

    pub fn fail(&self, error: Failure) {
        let _ = self.completions.send((self.id, Err(error)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Owner {
    Root,
    Task(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    All,
    Any,
}

#[derive(Debug)]
enum TaskStoreSlot {
    Shared,
    Isolated(Store),
}

#[derive(Debug)]
struct TaskRecord {
    cont: Option<Continuation>,
    store: TaskStoreSlot,
    done: Option<Result<Value, Failure>>,
}

#[derive(Debug)]
struct WaitRequest {
    continuation: Continuation,
    items: Vec<Waitable>,
    mode: WaitMode,
    owner: Owner,
}

pub struct SchedulerState {
    ready: VecDeque<TaskId>,
    tasks: FxHashMap<TaskId, TaskRecord>,
    /// `None` = pending.
    promises: FxHashMap<PromiseId, Option<Result<Value, Failure>>>,
    /// Liveness tokens for external promises; a dead token with a pending
    /// promise means nobody can ever complete it.
    external: FxHashMap<PromiseId, Weak<()>>,
    waiters: Vec<WaitRequest>,
    cancel_requested: FxHashSet<TaskId>,
    current: Option<Owner>,
    root_store: Option<Store>,
    next_task: u64,
    next_promise: u64,
    completions_tx: Sender<CompletionMsg>,
    completions_rx: Receiver<CompletionMsg>,
}

impl std::fmt::Debug for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerState")
            .field("ready", &self.ready)
            .field("tasks", &self.tasks.len())
            .field("waiters", &self.waiters.len())
            .field("current", &self.current)
            .finish()
    }
}

impl SchedulerState {
    fn new() -> Self {
        let (completions_tx, completions_rx) = bounded(1024);
        SchedulerState {
            ready: VecDeque::new(),
            tasks: FxHashMap::default(),
            promises: FxHashMap::default(),
            external: FxHashMap::default(),
            waiters: Vec::new(),
            cancel_requested: FxHashSet::default(),
            current: Some(Owner::Root),
            root_store: None,
            next_task: 1,
            next_promise: 1,
            completions_tx,
            completions_rx,
        }
    }

    fn alloc_task_id(&mut self) -> TaskId {
        let id = TaskId::from_raw(self.next_task);
        self.next_task += 1;
        id
    }

    fn alloc_promise_id(&mut self) -> PromiseId {
        let id = PromiseId::from_raw(self.next_promise);
        self.next_promise += 1;
        id
    }

    fn settle_promise(&mut self, promise: PromiseId, result: Result<Value, Failure>) -> Result<(), Failure> {
        match self.promises.get_mut(&promise) {
            Some(slot @ None) => {
                *slot = Some(result);
                Ok(())
            }
            Some(Some(_)) => Err(Failure::raised(format!(
                "promise {} already completed",
                promise.raw()
            ))),
            None => Err(Failure::raised(format!(
                "unknown promise {}",
                promise.raw()
            ))),
        }
    }

    fn save_current_store(&mut self, store: &Store) {
        match self.current {
            Some(Owner::Root) => self.root_store = Some(store.clone()),
            Some(Owner::Task(tid)) => {
                if let Some(TaskStoreSlot::Isolated(slot)) =
                    self.tasks.get_mut(&tid).map(|record| &mut record.store)
                {
                    *slot = store.clone();
                }
            }
            None => {}
        }
    }

    fn load_store_for(&mut self, owner: Owner, store: &mut Store) {
        match owner {
            Owner::Root => {
                if let Some(saved) = self.root_store.clone() {
                    *store = saved;
                }
            }
            Owner::Task(tid) => {
                if let Some(TaskStoreSlot::Isolated(slot)) =
                    self.tasks.get(&tid).map(|record| &record.store)
                {
                    *store = slot.clone();
                }
            }
        }
    }

    fn task_result(&self, task: TaskId) -> Option<Result<Value, Failure>> {
        self.tasks.get(&task).and_then(|record| record.done.clone())
    }

    fn promise_result(&self, promise: PromiseId) -> Option<Result<Value, Failure>> {
        self.promises.get(&promise).cloned().flatten()
    }

    fn collect_all(&self, items: &[Waitable]) -> Option<Result<Value, Failure>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let resolved = match item {
                Waitable::Task(tid) => self.task_result(*tid),
                Waitable::Promise(pid) => self.promise_result(*pid),
            };
            match resolved {
                Some(Ok(value)) => results.push(value),
                Some(Err(failure)) => return Some(Err(failure)),
                None => return None,
            }
        }
        Some(Ok(Value::List(results)))
    }

    fn collect_any(&self, items: &[Waitable]) -> Option<Result<Value, Failure>> {
        for (idx, item) in items.iter().enumerate() {
            let resolved = match item {
                Waitable::Task(tid) => self.task_result(*tid),
                Waitable::Promise(pid) => self.promise_result(*pid),
            };
            match resolved {
                Some(Ok(value)) => {
                    return Some(Ok(Value::List(vec![Value::Int(idx as i64), value])))
                }
                Some(Err(failure)) => return Some(Err(failure)),
                None => {}
            }
        }
        None
    }

    fn wait_result(&self, request: &WaitRequest) -> Option<Result<Value, Failure>> {
        match request.mode {
            WaitMode::All => self.collect_all(&request.items),
            WaitMode::Any => self.collect_any(&request.items),
        }
    }

    fn merge_gather_logs(&self, items: &[Waitable], store: &mut Store) {
        for item in items {
            if let Waitable::Task(tid) = item {
                if let Some(TaskStoreSlot::Isolated(task_store)) =
                    self.tasks.get(tid).map(|record| &record.store)
                {
                    store.log.extend(task_store.log.iter().cloned());
                }
            }
        }
    }

    fn finish_task(&mut self, task: TaskId, result: Result<Value, Failure>) {
        trace!(task = task.raw(), ok = result.is_ok(), "task completed");
        if let Some(record) = self.tasks.get_mut(&task) {
            record.done = Some(result);
        }
    }

    fn take_task_cont(&mut self, task: TaskId) -> Option<Continuation> {
        self.tasks.get_mut(&task).and_then(|record| record.cont.take())
    }

    fn drain_external(&mut self) {
        while let Ok((pid, result)) = self.completions_rx.try_recv() {
            let _ = self.settle_promise(pid, result);
        }
    }

    /// An external completion can still arrive iff some pending external
    /// promise has a live handle somewhere.
    fn external_completion_possible(&self) -> bool {
        self.external.iter().any(|(pid, token)| {
            token.strong_count() > 0 && matches!(self.promises.get(pid), Some(None))
        })
    }

    fn wait_for_external(&mut self) -> Result<(), Failure> {
        match self.completions_rx.recv_timeout(Duration::from_millis(100)) {
            Ok((pid, result)) => {
                let _ = self.settle_promise(pid, result);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => Err(Failure::deadlock()),
        }
    }
}

fn transfer_into(k: Continuation, value: Value) -> StreamStep {
    StreamStep::Yield(Yielded::Ctl(Ctl::Transfer {
        continuation: k,
        value,
    }))
}

fn throw_into(k: Continuation, error: Failure) -> StreamStep {
    StreamStep::Yield(Yielded::Ctl(Ctl::TransferThrow {
        continuation: k,
        error,
    }))
}

fn parse_waitables(items: &[Value]) -> Result<Vec<Waitable>, Failure> {
    items
        .iter()
        .map(|item| match item {
            Value::Task(handle) => Ok(Waitable::Task(handle.id)),
            Value::Promise(handle) => Ok(Waitable::Promise(handle.id)),
            Value::External(handle) => Ok(Waitable::Promise(handle.id)),
            other => Err(Failure::raised(format!(
                "Gather/Race items must be tasks or promises, got {}",
                other.repr()
            ))),
        })
        .collect()
}

/// Wrap a spawned body so its completion is reported as a `TaskCompleted`
/// effect instead of falling off the end of the task's segment chain.
fn task_wrapper(task: TaskId, body: ProgramRef) -> ProgramRef {
    let mut phase = 0u8;
    let mut body = Some(body);
    program::from_fn("task", move |event, _| match phase {
        0 => match event {
            StreamEvent::Resumed(_) => {
                phase = 1;
                StreamStep::Yield(Yielded::Ctl(Ctl::Catch {
                    body: body.take().expect("task body present"),
                }))
            }
            // Cancelled before the body ever ran.
            StreamEvent::Thrown(error) => {
                phase = 2;
                StreamStep::Yield(Yielded::Effect(Effect::sched(SchedEffect::TaskCompleted {
                    task,
                    result: Box::new(Err(error)),
                })))
            }
        },
        1 => {
            phase = 2;
            let result = match event.try_value() {
                Ok(Value::Outcome(outcome)) => *outcome,
                Ok(other) => Ok(other),
                Err(error) => Err(error),
            };
            StreamStep::Yield(Yielded::Effect(Effect::sched(SchedEffect::TaskCompleted {
                task,
                result: Box::new(result),
            })))
        }
        _ => match event.try_value() {
            Ok(value) => StreamStep::Return(value),
            Err(error) => StreamStep::Throw(error),
        },
    })
}

/// The handler installed by `handler::scheduler()`. All clones share one
/// state, so a task's re-installed scheduler cooperates with its parent's.
#[derive(Clone)]
pub struct SchedulerHandler {
    state: Arc<Mutex<SchedulerState>>,
}

impl std::fmt::Debug for SchedulerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandler").finish_non_exhaustive()
    }
}

impl Default for SchedulerHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHandler {
    pub fn new() -> Self {
        SchedulerHandler {
            state: Arc::new(Mutex::new(SchedulerState::new())),
        }
    }

    pub(crate) fn stream(&self, effect: Effect, k: Continuation) -> ProgramRef {
        program::share(SchedulerStream {
            state: self.state.clone(),
            phase: SchedPhase::Start {
                effect: Some(effect),
                k: Some(k),
            },
        })
    }
}

enum SchedPhase {
    Start {
        effect: Option<Effect>,
        k: Option<Continuation>,
    },
    SpawnHandlers {
        k: Continuation,
        program: ProgramRef,
        store_mode: StoreMode,
    },
    Finished,
}

struct SchedulerStream {
    state: Arc<Mutex<SchedulerState>>,
    phase: SchedPhase,
}

impl std::fmt::Debug for SchedulerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            SchedPhase::Start { .. } => "Start",
            SchedPhase::SpawnHandlers { .. } => "SpawnHandlers",
            SchedPhase::Finished => "Finished",
        };
        f.debug_struct("SchedulerStream").field("phase", &phase).finish()
    }
}

impl SchedulerStream {
    fn begin(&mut self, effect: SchedEffect, k: Continuation, store: &mut Store) -> StreamStep {
        match effect {
            SchedEffect::Spawn {
                program,
                handlers,
                store_mode,
            } => match handlers {
                Some(handlers) => self.finish_spawn(k, program, handlers, store_mode, store),
                None => {
                    self.phase = SchedPhase::SpawnHandlers {
                        k,
                        program,
                        store_mode,
                    };
                    StreamStep::Yield(Yielded::Ctl(Ctl::GetHandlers))
                }
            },

            SchedEffect::Gather { items } => self.begin_wait(k, items, WaitMode::All, store),
            SchedEffect::Race { items } => self.begin_wait(k, items, WaitMode::Any, store),

            SchedEffect::CreatePromise => {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                let pid = state.alloc_promise_id();
                state.promises.insert(pid, None);
                transfer_into(k, Value::Promise(PromiseHandle { id: pid }))
            }

            SchedEffect::CompletePromise { promise, value } => {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                match state.settle_promise(promise, Ok(value)) {
                    Ok(()) => transfer_into(k, Value::Unit),
                    Err(failure) => throw_into(k, failure),
                }
            }

            SchedEffect::FailPromise { promise, error } => {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                match state.settle_promise(promise, Err(*error)) {
                    Ok(()) => transfer_into(k, Value::Unit),
                    Err(failure) => throw_into(k, failure),
                }
            }

            SchedEffect::CreateExternalPromise => {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                let pid = state.alloc_promise_id();
                state.promises.insert(pid, None);
                let token = Arc::new(());
                state.external.insert(pid, Arc::downgrade(&token));
                let handle = ExternalPromise {
                    id: pid,
                    completions: state.completions_tx.clone(),
                    _liveness: token,
                };
                transfer_into(k, Value::External(handle))
            }

            SchedEffect::Cancel { task } => {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                let still_running = state
                    .tasks
                    .get(&task)
                    .map(|record| record.done.is_none())
                    .unwrap_or(false);
                if still_running {
                    debug!(task = task.raw(), "cancellation requested");
                    state.cancel_requested.insert(task);
                }
                transfer_into(k, Value::Unit)
            }

            SchedEffect::TaskCompleted { task, result } => {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                state.save_current_store(store);
                state.finish_task(task, *result);
                state.current = None;
                Self::transfer_next(&mut state, store)
            }
        }
    }

    fn begin_wait(
        &mut self,
        k: Continuation,
        items: Vec<Value>,
        mode: WaitMode,
        store: &mut Store,
    ) -> StreamStep {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let waitables = match parse_waitables(&items) {
            Ok(waitables) => waitables,
            Err(failure) => return throw_into(k, failure),
        };
        state.drain_external();

        let immediate = match mode {
            WaitMode::All => state.collect_all(&waitables),
            WaitMode::Any => state.collect_any(&waitables),
        };
        if let Some(result) = immediate {
            return match result {
                Ok(value) => {
                    if mode == WaitMode::All {
                        state.merge_gather_logs(&waitables, store);
                    }
                    transfer_into(k, value)
                }
                Err(failure) => throw_into(k, failure),
            };
        }

        let owner = state.current.unwrap_or(Owner::Root);
        state.waiters.push(WaitRequest {
            continuation: k,
            items: waitables,
            mode,
            owner,
        });
        Self::transfer_next(&mut state, store)
    }

    fn finish_spawn(
        &mut self,
        k: Continuation,
        body: ProgramRef,
        handlers: Vec<HandlerRef>,
        store_mode: StoreMode,
        store: &mut Store,
    ) -> StreamStep {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let task = state.alloc_task_id();
        let cont = Continuation::create(task_wrapper(task, body), handlers);
        let slot = match store_mode {
            StoreMode::Shared => TaskStoreSlot::Shared,
            StoreMode::Isolated => TaskStoreSlot::Isolated(store.clone()),
        };
        state.tasks.insert(
            task,
            TaskRecord {
                cont: Some(cont),
                store: slot,
                done: None,
            },
        );
        state.ready.push_back(task);
        debug!(task = task.raw(), "spawned");
        transfer_into(k, Value::Task(TaskHandle { id: task }))
    }

    /// Pick the next runnable continuation: satisfied (or cancelled) waiters
    /// first, then ready tasks in FIFO order, then block on external
    /// completions. Nothing runnable anywhere is a deadlock.
    fn transfer_next(state: &mut SchedulerState, store: &mut Store) -> StreamStep {
        loop {
            state.drain_external();

            let wakeable = state.waiters.iter().position(|request| {
                state.wait_result(request).is_some()
                    || matches!(request.owner, Owner::Task(tid) if state.cancel_requested.contains(&tid))
            });
            if let Some(idx) = wakeable {
                let request = state.waiters.remove(idx);
                state.save_current_store(store);
                state.load_store_for(request.owner, store);
                state.current = Some(request.owner);
                if let Owner::Task(tid) = request.owner {
                    if state.cancel_requested.remove(&tid) {
                        return throw_into(request.continuation, Failure::cancelled());
                    }
                }
                let result = state
                    .wait_result(&request)
                    .expect("woken waiter must be satisfiable");
                return match result {
                    Ok(value) => {
                        if request.mode == WaitMode::All {
                            state.merge_gather_logs(&request.items, store);
                        }
                        transfer_into(request.continuation, value)
                    }
                    Err(failure) => throw_into(request.continuation, failure),
                };
            }

            if let Some(task) = state.ready.pop_front() {
                let Some(cont) = state.take_task_cont(task) else {
                    continue;
                };
                state.save_current_store(store);
                state.load_store_for(Owner::Task(task), store);
                state.current = Some(Owner::Task(task));
                if state.cancel_requested.remove(&task) {
                    return throw_into(cont, Failure::cancelled());
                }
                trace!(task = task.raw(), "run task");
                return transfer_into(cont, Value::Unit);
            }

            if state.external_completion_possible() {
                match state.wait_for_external() {
                    Ok(()) => continue,
                    Err(failure) => return StreamStep::Throw(failure),
                }
            }

            return StreamStep::Throw(Failure::deadlock());
        }
    }
}

impl ProgramStream for SchedulerStream {
    fn resume(&mut self, value: Value, store: &mut Store) -> StreamStep {
        match std::mem::replace(&mut self.phase, SchedPhase::Finished) {
            SchedPhase::Start { effect, k } => {
                let (Some(effect), Some(k)) = (effect, k) else {
                    return StreamStep::Throw(Failure::raised("scheduler stream restarted"));
                };
                match effect.into_kind() {
                    EffectKind::Sched(sched) => self.begin(sched, k, store),
                    other => StreamStep::Throw(Failure::raised(format!(
                        "SchedulerHandler dispatched a foreign effect: {other:?}"
                    ))),
                }
            }
            SchedPhase::SpawnHandlers {
                k,
                program,
                store_mode,
            } => match value {
                Value::Handlers(handlers) => {
                    self.finish_spawn(k, program, handlers, store_mode, store)
                }
                other => StreamStep::Throw(Failure::raised(format!(
                    "Spawn expected the visible handlers, got {}",
                    other.repr()
                ))),
            },
            SchedPhase::Finished => StreamStep::Throw(Failure::raised(
                "scheduler stream resumed after completion",
            )),
        }
    }

    fn throw(&mut self, error: Failure, _store: &mut Store) -> StreamStep {
        self.phase = SchedPhase::Finished;
        StreamStep::Throw(error)
    }

    fn name(&self) -> &str {
        "scheduler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> SchedulerState {
        SchedulerState::new()
    }

    #[test]
    fn test_promise_lifecycle() {
        let mut state = new_state();
        let pid = state.alloc_promise_id();
        state.promises.insert(pid, None);
        assert!(state.promise_result(pid).is_none());

        state.settle_promise(pid, Ok(Value::Int(5))).expect("first settle");
        assert!(matches!(state.promise_result(pid), Some(Ok(Value::Int(5)))));
        assert!(state.settle_promise(pid, Ok(Value::Int(6))).is_err());
    }

    #[test]
    fn test_collect_all_preserves_input_order() {
        let mut state = new_state();
        let p1 = state.alloc_promise_id();
        let p2 = state.alloc_promise_id();
        state.promises.insert(p1, Some(Ok(Value::Int(1))));
        state.promises.insert(p2, Some(Ok(Value::Int(2))));

        let all = state
            .collect_all(&[Waitable::Promise(p2), Waitable::Promise(p1)])
            .expect("both resolved")
            .expect("no failure");
        assert_eq!(all, Value::List(vec![Value::Int(2), Value::Int(1)]));
    }

    #[test]
    fn test_collect_all_pending_item_blocks() {
        let mut state = new_state();
        let p1 = state.alloc_promise_id();
        let p2 = state.alloc_promise_id();
        state.promises.insert(p1, Some(Ok(Value::Int(1))));
        state.promises.insert(p2, None);
        assert!(state
            .collect_all(&[Waitable::Promise(p1), Waitable::Promise(p2)])
            .is_none());
    }

    #[test]
    fn test_collect_any_reports_winner_index() {
        let mut state = new_state();
        let p1 = state.alloc_promise_id();
        let p2 = state.alloc_promise_id();
        state.promises.insert(p1, None);
        state.promises.insert(p2, Some(Ok(Value::from("fast"))));

        let any = state
            .collect_any(&[Waitable::Promise(p1), Waitable::Promise(p2)])
            .expect("one resolved")
            .expect("no failure");
        assert_eq!(
            any,
            Value::List(vec![Value::Int(1), Value::from("fast")])
        );
    }

    #[test]
    fn test_external_completion_drains_into_promise() {
        let mut state = new_state();
        let pid = state.alloc_promise_id();
        state.promises.insert(pid, None);
        let token = Arc::new(());
        state.external.insert(pid, Arc::downgrade(&token));
        let handle = ExternalPromise {
            id: pid,
            completions: state.completions_tx.clone(),
            _liveness: token,
        };

        assert!(state.external_completion_possible());
        handle.complete(Value::Int(9));
        state.drain_external();
        assert!(matches!(state.promise_result(pid), Some(Ok(Value::Int(9)))));
        assert!(!state.external_completion_possible());
    }

    #[test]
    fn test_external_liveness_drops_with_handle() {
        let mut state = new_state();
        let pid = state.alloc_promise_id();
        state.promises.insert(pid, None);
        let token = Arc::new(());
        state.external.insert(pid, Arc::downgrade(&token));
        assert!(state.external_completion_possible());
        drop(token);
        assert!(!state.external_completion_possible());
    }

    #[test]
    fn test_store_save_load_round_trip() {
        let mut state = new_state();
        let tid = state.alloc_task_id();
        state.tasks.insert(
            tid,
            TaskRecord {
                cont: None,
                store: TaskStoreSlot::Isolated(Store::new()),
                done: None,
            },
        );

        let mut live = Store::new();
        live.put("root".to_string(), Value::Int(1));
        state.save_current_store(&live); // current = Root

        state.current = Some(Owner::Task(tid));
        let mut task_view = Store::new();
        task_view.put("task".to_string(), Value::Int(2));
        state.save_current_store(&task_view);

        let mut reloaded = Store::new();
        state.load_store_for(Owner::Root, &mut reloaded);
        assert_eq!(reloaded.get("root"), Some(&Value::Int(1)));
        state.load_store_for(Owner::Task(tid), &mut reloaded);
        assert_eq!(reloaded.get("task"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_parse_waitables_rejects_plain_values() {
        let err = parse_waitables(&[Value::Int(3)]).expect_err("ints are not waitable");
        assert!(err.message.contains("tasks or promises"));
    }
}
