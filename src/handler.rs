//! Handler types and the built-in handler suite.
//!
//! A handler decides what happens to an effect: answer immediately (the
//! fast-path builtins), run a handler body as a program stream (scheduler,
//! call expansion, user handlers), or escape to the host. Built-ins are
//! installed exactly like user handlers; nothing in dispatch special-cases
//! them.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::cache::CacheHandler;
use crate::capture::HandlerKind;
use crate::continuation::Continuation;
use crate::ctl::Ctl;
use crate::effect::{Effect, EffectKind};
use crate::error::Failure;
use crate::host::{self, HostFuture};
use crate::kpc::KpcStream;
use crate::program::{share, ProgramRef, ProgramStream, StreamStep};
use crate::scheduler::SchedulerHandler;
use crate::store::Store;
use crate::value::Value;

pub enum Handler {
    State,
    Reader,
    Writer,
    Scheduler(SchedulerHandler),
    Kpc,
    Cache(CacheHandler),
    SyncAwait,
    AsyncAwait,
    Program(ProgramHandler),
}

pub type HandlerRef = Arc<Handler>;

/// A user handler: a predicate over effects plus a body factory
/// `(effect, K) -> program`.
pub struct ProgramHandler {
    name: String,
    matches: Arc<dyn Fn(&Effect) -> bool + Send + Sync>,
    body: Arc<dyn Fn(Effect, Continuation) -> ProgramRef + Send + Sync>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Debug for ProgramHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramHandler")
            .field("name", &self.name)
            .finish()
    }
}

/// Immediate answer from a handler.
#[derive(Debug)]
pub enum HandlerAction {
    Resume { k: Continuation, value: Value },
    ResumeThrow { k: Continuation, error: Failure },
    Transfer { k: Continuation, value: Value },
    Return { value: Value },
    Throw { error: Failure },
    HostEscape { k: Continuation, future: HostFuture },
}

/// What invoking a handler produced.
#[derive(Debug)]
pub enum HandlerInvocation {
    Action(HandlerAction),
    Stream(ProgramRef),
}

impl Handler {
    pub fn name(&self) -> &str {
        match self {
            Handler::State => "StateHandler",
            Handler::Reader => "ReaderHandler",
            Handler::Writer => "WriterHandler",
            Handler::Scheduler(_) => "SchedulerHandler",
            Handler::Kpc => "CallHandler",
            Handler::Cache(_) => "CacheHandler",
            Handler::SyncAwait => "SyncAwaitHandler",
            Handler::AsyncAwait => "AsyncAwaitHandler",
            Handler::Program(p) => &p.name,
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Program(_) => HandlerKind::Program,
            _ => HandlerKind::Builtin,
        }
    }

    pub fn can_handle(&self, effect: &Effect) -> bool {
        match (self, effect.kind()) {
            (Handler::State, EffectKind::Get { .. }) => true,
            (Handler::State, EffectKind::Put { .. }) => true,
            (Handler::State, EffectKind::Modify { .. }) => true,
            (Handler::Reader, EffectKind::Ask { .. }) => true,
            (Handler::Reader, EffectKind::Local { .. }) => true,
            (Handler::Writer, EffectKind::Tell { .. }) => true,
            (Handler::Writer, EffectKind::Listen { .. }) => true,
            (Handler::Scheduler(_), EffectKind::Sched(_)) => true,
            (Handler::Kpc, EffectKind::Call(_)) => true,
            (Handler::Cache(_), EffectKind::Cache(_)) => true,
            (Handler::SyncAwait, EffectKind::Await(_)) => true,
            (Handler::AsyncAwait, EffectKind::Await(_)) => true,
            (Handler::Program(p), _) => (p.matches)(effect),
            _ => false,
        }
    }

    pub fn invoke(&self, effect: Effect, k: Continuation, store: &mut Store) -> HandlerInvocation {
        match self {
            Handler::State => HandlerInvocation::Action(state_action(effect, k, store)),
            Handler::Reader => reader_invoke(effect, k, store),
            Handler::Writer => writer_invoke(effect, k, store),
            Handler::Scheduler(sched) => {
                HandlerInvocation::Stream(sched.stream(effect, k))
            }
            Handler::Kpc => match effect.into_kind() {
                EffectKind::Call(call) => {
                    HandlerInvocation::Stream(share(KpcStream::new(call, k)))
                }
                other => mismatched("CallHandler", &other),
            },
            Handler::Cache(cache) => match effect.kind() {
                EffectKind::Cache(op) => HandlerInvocation::Action(HandlerAction::Resume {
                    value: cache.answer(op),
                    k,
                }),
                other => mismatched("CacheHandler", other),
            },
            Handler::SyncAwait => match effect.into_kind() {
                EffectKind::Await(future) => HandlerInvocation::Action(sync_await_action(future, k)),
                other => mismatched("SyncAwaitHandler", &other),
            },
            Handler::AsyncAwait => match effect.into_kind() {
                EffectKind::Await(future) => {
                    HandlerInvocation::Action(HandlerAction::HostEscape { k, future })
                }
                other => mismatched("AsyncAwaitHandler", &other),
            },
            Handler::Program(p) => HandlerInvocation::Stream((p.body)(effect, k)),
        }
    }
}

fn mismatched(handler: &str, kind: &EffectKind) -> HandlerInvocation {
    HandlerInvocation::Action(HandlerAction::Throw {
        error: Failure::raised(format!("{handler} dispatched a foreign effect: {kind:?}")),
    })
}

fn state_action(effect: Effect, k: Continuation, store: &mut Store) -> HandlerAction {
    match effect.into_kind() {
        EffectKind::Get { key } => HandlerAction::Resume {
            value: store.get(&key).cloned().unwrap_or(Value::Unit),
            k,
        },
        EffectKind::Put { key, value } => {
            store.put(key, value);
            HandlerAction::Resume {
                k,
                value: Value::Unit,
            }
        }
        // Modify answers with the value stored before the modification.
        EffectKind::Modify { key, func } => {
            let old = store.get(&key).cloned().unwrap_or(Value::Unit);
            store.put(key, func.apply(old.clone()));
            HandlerAction::Resume { k, value: old }
        }
        other => HandlerAction::Throw {
            error: Failure::raised(format!("StateHandler dispatched a foreign effect: {other:?}")),
        },
    }
}

fn reader_invoke(effect: Effect, k: Continuation, store: &mut Store) -> HandlerInvocation {
    match effect.into_kind() {
        EffectKind::Ask { key } => match store.ask(&key) {
            Some(value) => HandlerInvocation::Action(HandlerAction::Resume {
                value: value.clone(),
                k,
            }),
            None => HandlerInvocation::Action(HandlerAction::ResumeThrow {
                k,
                error: Failure::raised(format!("environment key not bound: {key:?}")),
            }),
        },
        EffectKind::Local { overrides, expr } => {
            HandlerInvocation::Stream(share(LocalStream::new(overrides, expr, k)))
        }
        other => mismatched("ReaderHandler", &other),
    }
}

fn writer_invoke(effect: Effect, k: Continuation, store: &mut Store) -> HandlerInvocation {
    match effect.into_kind() {
        EffectKind::Tell { message } => {
            store.tell(message);
            HandlerInvocation::Action(HandlerAction::Resume {
                k,
                value: Value::Unit,
            })
        }
        EffectKind::Listen { expr } => HandlerInvocation::Stream(share(ListenStream::new(expr, k))),
        other => mismatched("WriterHandler", &other),
    }
}

fn sync_await_action(future: HostFuture, k: Continuation) -> HandlerAction {
    match future.take() {
        Some(fut) => match host::block_on_host(fut) {
            Ok(value) => HandlerAction::Resume { k, value },
            Err(error) => HandlerAction::ResumeThrow { k, error },
        },
        None => HandlerAction::Throw {
            error: Failure::raised("await future already consumed"),
        },
    }
}

/// Handler body for `Local`: overlay the environment for the dynamic extent
/// of the inner expression, then restore the snapshot exactly.
#[derive(Debug)]
struct LocalStream {
    phase: LocalPhase,
}

#[derive(Debug)]
enum LocalPhase {
    Start {
        overrides: Vec<(String, Value)>,
        expr: ProgramRef,
        k: Continuation,
    },
    Eval {
        k: Continuation,
        snapshot: IndexMap<String, Value>,
    },
    Done,
}

impl LocalStream {
    fn new(overrides: Vec<(String, Value)>, expr: ProgramRef, k: Continuation) -> Self {
        LocalStream {
            phase: LocalPhase::Start { overrides, expr, k },
        }
    }
}

impl ProgramStream for LocalStream {
    fn resume(&mut self, value: Value, store: &mut Store) -> StreamStep {
        match std::mem::replace(&mut self.phase, LocalPhase::Done) {
            LocalPhase::Start { overrides, expr, k } => {
                let snapshot = store.env_snapshot();
                store.apply_env_overlay(&overrides);
                self.phase = LocalPhase::Eval { k, snapshot };
                StreamStep::Yield(
                    Ctl::Eval {
                        program: expr,
                        handlers: vec![Arc::new(Handler::Reader)],
                    }
                    .into(),
                )
            }
            LocalPhase::Eval { k, snapshot } => {
                store.restore_env(snapshot);
                StreamStep::Yield(
                    Ctl::Transfer {
                        continuation: k,
                        value,
                    }
                    .into(),
                )
            }
            LocalPhase::Done => StreamStep::Throw(Failure::raised(
                "Local handler body resumed after completion",
            )),
        }
    }

    fn throw(&mut self, error: Failure, store: &mut Store) -> StreamStep {
        match std::mem::replace(&mut self.phase, LocalPhase::Done) {
            LocalPhase::Eval { k, snapshot } => {
                store.restore_env(snapshot);
                StreamStep::Yield(
                    Ctl::TransferThrow {
                        continuation: k,
                        error,
                    }
                    .into(),
                )
            }
            _ => StreamStep::Throw(error),
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Handler body for `Listen`: a private log buffer for the inner expression,
/// delivered back as `(value, log)`.
#[derive(Debug)]
struct ListenStream {
    phase: ListenPhase,
}

#[derive(Debug)]
enum ListenPhase {
    Start { expr: ProgramRef, k: Continuation },
    Eval { k: Continuation, outer_log: Vec<Value> },
    Done,
}

impl ListenStream {
    fn new(expr: ProgramRef, k: Continuation) -> Self {
        ListenStream {
            phase: ListenPhase::Start { expr, k },
        }
    }
}

impl ProgramStream for ListenStream {
    fn resume(&mut self, value: Value, store: &mut Store) -> StreamStep {
        match std::mem::replace(&mut self.phase, ListenPhase::Done) {
            ListenPhase::Start { expr, k } => {
                let outer_log = store.swap_log(Vec::new());
                self.phase = ListenPhase::Eval { k, outer_log };
                StreamStep::Yield(
                    Ctl::Eval {
                        program: expr,
                        handlers: vec![Arc::new(Handler::Writer)],
                    }
                    .into(),
                )
            }
            ListenPhase::Eval { k, outer_log } => {
                let captured = store.swap_log(outer_log);
                StreamStep::Yield(
                    Ctl::Transfer {
                        continuation: k,
                        value: Value::List(vec![value, Value::List(captured)]),
                    }
                    .into(),
                )
            }
            ListenPhase::Done => StreamStep::Throw(Failure::raised(
                "Listen handler body resumed after completion",
            )),
        }
    }

    fn throw(&mut self, error: Failure, store: &mut Store) -> StreamStep {
        match std::mem::replace(&mut self.phase, ListenPhase::Done) {
            ListenPhase::Eval { k, outer_log } => {
                let _ = store.swap_log(outer_log);
                StreamStep::Yield(
                    Ctl::TransferThrow {
                        continuation: k,
                        error,
                    }
                    .into(),
                )
            }
            _ => StreamStep::Throw(error),
        }
    }

    fn name(&self) -> &str {
        "listen"
    }
}

pub fn state() -> HandlerRef {
    Arc::new(Handler::State)
}

pub fn reader() -> HandlerRef {
    Arc::new(Handler::Reader)
}

pub fn writer() -> HandlerRef {
    Arc::new(Handler::Writer)
}

pub fn scheduler() -> HandlerRef {
    Arc::new(Handler::Scheduler(SchedulerHandler::new()))
}

pub fn kpc() -> HandlerRef {
    Arc::new(Handler::Kpc)
}

pub fn cache(backend: Arc<dyn crate::cache::CacheBackend>) -> HandlerRef {
    Arc::new(Handler::Cache(CacheHandler::new(backend)))
}

pub fn cache_in_memory() -> HandlerRef {
    Arc::new(Handler::Cache(CacheHandler::in_memory()))
}

pub fn sync_await() -> HandlerRef {
    Arc::new(Handler::SyncAwait)
}

pub fn async_await() -> HandlerRef {
    Arc::new(Handler::AsyncAwait)
}

/// Build a user handler from a match predicate and a body factory.
pub fn from_program<M, B>(name: impl Into<String>, matches: M, body: B) -> HandlerRef
where
    M: Fn(&Effect) -> bool + Send + Sync + 'static,
    B: Fn(Effect, Continuation) -> ProgramRef + Send + Sync + 'static,
{
    Arc::new(Handler::Program(ProgramHandler {
        name: name.into(),
        matches: Arc::new(matches),
        body: Arc::new(body),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SegmentId;
    use crate::segment::Segment;

    fn test_continuation() -> Continuation {
        let prompt = crate::ids::PromptId::fresh();
        let seg = Segment::body(prompt, None, vec![prompt]);
        Continuation::capture(&seg, SegmentId::new(0, 0), None)
    }

    #[test]
    fn test_state_handler_get_put() {
        let mut store = Store::new();
        let k = test_continuation();
        match state_action(Effect::put("k", Value::Int(9)), k, &mut store) {
            HandlerAction::Resume { value, .. } => assert_eq!(value, Value::Unit),
            other => panic!("expected Resume, got {other:?}"),
        }

        let k = test_continuation();
        match state_action(Effect::get("k"), k, &mut store) {
            HandlerAction::Resume { value, .. } => assert_eq!(value, Value::Int(9)),
            other => panic!("expected Resume, got {other:?}"),
        }
    }

    #[test]
    fn test_state_handler_modify_returns_old() {
        let mut store = Store::new();
        store.put("n".to_string(), Value::Int(10));
        let k = test_continuation();
        let action = state_action(
            Effect::modify("n", |v| Value::Int(v.as_int().unwrap_or(0) * 2)),
            k,
            &mut store,
        );
        match action {
            HandlerAction::Resume { value, .. } => assert_eq!(value, Value::Int(10)),
            other => panic!("expected Resume, got {other:?}"),
        }
        assert_eq!(store.get("n"), Some(&Value::Int(20)));
    }

    #[test]
    fn test_reader_ask_missing_key_throws_into_caller() {
        let mut store = Store::new();
        let k = test_continuation();
        match reader_invoke(Effect::ask("missing"), k, &mut store) {
            HandlerInvocation::Action(HandlerAction::ResumeThrow { .. }) => {}
            other => panic!("expected ResumeThrow, got {other:?}"),
        }
    }

    #[test]
    fn test_writer_tell_appends() {
        let mut store = Store::new();
        let k = test_continuation();
        let _ = writer_invoke(Effect::tell(Value::from("hi")), k, &mut store);
        assert_eq!(store.logs().len(), 1);
    }

    #[test]
    fn test_can_handle_matrix() {
        assert!(Handler::State.can_handle(&Effect::get("x")));
        assert!(Handler::State.can_handle(&Effect::modify("x", |v| v)));
        assert!(Handler::Reader.can_handle(&Effect::ask("x")));
        assert!(Handler::Writer.can_handle(&Effect::tell(Value::Unit)));
        assert!(!Handler::State.can_handle(&Effect::ask("x")));
        assert!(!Handler::Reader.can_handle(&Effect::get("x")));
        assert!(!Handler::Writer.can_handle(&Effect::user("anything")));
    }

    #[test]
    fn test_program_handler_matches_predicate() {
        let handler = from_program(
            "probe-handler",
            |e| e.as_user().is_some(),
            |_, _| crate::program::pure(Value::Unit),
        );
        assert!(handler.can_handle(&Effect::user("probe")));
        assert!(!handler.can_handle(&Effect::get("x")));
        assert_eq!(handler.name(), "probe-handler");
        assert_eq!(handler.kind(), HandlerKind::Program);
    }
}
