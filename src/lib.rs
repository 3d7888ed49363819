//! seff: a segment-based VM for algebraic effects.
//!
//! Programs are suspendable streams that yield effects; user-installed
//! handlers receive each effect together with a one-shot continuation and
//! answer it with delimited-control primitives (resume, transfer, delegate).
//!
//! # Architecture
//!
//! - **Phase-based step machine**: Deliver, Raise, Classify, Complete
//! - **Segment-based continuations**: Arc snapshots for one-shot semantics
//! - **All effects dispatch**: no bypass for the built-in handlers
//! - **One host boundary**: a single async-escape value pumped by `async_run`

pub mod arena;
pub mod cache;
pub mod capture;
pub mod continuation;
pub mod ctl;
pub mod dispatch;
pub mod driver;
pub mod effect;
pub mod error;
pub mod frame;
pub mod handler;
pub mod host;
pub mod ids;
pub mod kleisli;
mod kpc;
pub mod program;
pub mod scheduler;
pub mod segment;
pub mod store;
pub mod value;
mod vm;


// Re-exports for convenience
pub use arena::SegmentArena;
pub use cache::{CacheBackend, CacheEffect, CacheHandler, MemoryCacheBackend};
pub use capture::{
    CallSite, DelegationHop, DispatchOutcome, DispatchRecord, ExecutionSnapshot, FrameDescriptor,
    HandlerKind, SnapshotStatus,
};
pub use continuation::Continuation;
pub use ctl::{Ctl, Yielded};
pub use dispatch::{DispatchContext, HandlerEntry};
pub use driver::{async_run, run, RunConfig, RunResult, StepObserver};
pub use effect::{Effect, EffectKind, ModifyFn, UserEffect};
pub use error::{Failure, FailureKind, VmError};
pub use frame::{CallMeta, Frame};
pub use handler::{Handler, HandlerAction, HandlerInvocation, HandlerRef};
pub use host::{BoxedHostFuture, HostAsyncEscape, HostFuture};
pub use ids::{CallbackId, ContId, DispatchId, PromiseId, PromptId, RunnableId, SegmentId, TaskId};
pub use kleisli::{kleisli, CallArg, Kleisli, KleisliRef, ProgramCall};
pub use program::{IntoProgram, ProgramRef, ProgramStream, StreamEvent, StreamStep};
pub use scheduler::{
    ExternalPromise, PromiseHandle, SchedEffect, SchedulerHandler, StoreMode, TaskHandle, Waitable,
};
pub use segment::{Segment, SegmentKind};
pub use store::Store;
pub use value::{Opaque, Value};
pub use vm::{wrap_with_handlers, StepOutcome, Vm};
