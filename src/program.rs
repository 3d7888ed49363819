//! The program-stream abstraction: suspendable bodies the VM steps.
//!
//! A `ProgramStream` is the crate's generator: the VM advances it one yield
//! at a time with `resume`, injects failures with `throw`, and classifies
//! whatever it yields. Streams are written as explicit state machines or via
//! the `from_fn` closure adapter.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::ctl::Yielded;
use crate::error::Failure;
use crate::store::Store;
use crate::value::Value;

/// One step of a program stream.
#[derive(Debug)]
pub enum StreamStep {
    Yield(Yielded),
    Return(Value),
    Throw(Failure),
}

/// What woke the stream: a delivered value or an injected failure.
#[derive(Debug)]
pub enum StreamEvent {
    Resumed(Value),
    Thrown(Failure),
}

impl StreamEvent {
    /// The delivered value, or rethrow the injected failure.
    pub fn try_value(self) -> Result<Value, Failure> {
        match self {
            StreamEvent::Resumed(v) => Ok(v),
            StreamEvent::Thrown(e) => Err(e),
        }
    }
}

pub trait ProgramStream: fmt::Debug + Send {
    fn resume(&mut self, value: Value, store: &mut Store) -> StreamStep;
    fn throw(&mut self, error: Failure, store: &mut Store) -> StreamStep;

    fn name(&self) -> &str {
        "<stream>"
    }
}

/// Shared, interior-mutable reference to a stream.
///
/// Frames and continuation snapshots clone the `Arc`, never the stream, so a
/// body suspended across a capture is the same one-shot object everywhere.
pub type ProgramRef = Arc<Mutex<Box<dyn ProgramStream>>>;

pub fn share(stream: impl ProgramStream + 'static) -> ProgramRef {
    Arc::new(Mutex::new(Box::new(stream)))
}

/// Anything the drivers accept as a program.
pub trait IntoProgram {
    fn into_program(self) -> ProgramRef;
}

impl IntoProgram for ProgramRef {
    fn into_program(self) -> ProgramRef {
        self
    }
}

struct FnStream<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for FnStream<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStream").field("name", &self.name).finish()
    }
}

impl<F> ProgramStream for FnStream<F>
where
    F: FnMut(StreamEvent, &mut Store) -> StreamStep + Send,
{
    fn resume(&mut self, value: Value, store: &mut Store) -> StreamStep {
        (self.f)(StreamEvent::Resumed(value), store)
    }

    fn throw(&mut self, error: Failure, store: &mut Store) -> StreamStep {
        (self.f)(StreamEvent::Thrown(error), store)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build a program from a state-machine closure.
///
/// The closure receives every wake event; the first is `Resumed(Unit)` when
/// the body starts. A closure that does not handle `Thrown` should rethrow:
/// `let v = match event.try_value() { Ok(v) => v, Err(e) => return StreamStep::Throw(e) };`
pub fn from_fn<F>(name: impl Into<String>, f: F) -> ProgramRef
where
    F: FnMut(StreamEvent, &mut Store) -> StreamStep + Send + 'static,
{
    share(FnStream {
        name: name.into(),
        f,
    })
}

/// A program that immediately returns `value`.
pub fn pure(value: Value) -> ProgramRef {
    let mut slot = Some(value);
    from_fn("pure", move |event, _| match event {
        StreamEvent::Resumed(_) => match slot.take() {
            Some(v) => StreamStep::Return(v),
            None => StreamStep::Throw(Failure::raised("pure program resumed twice")),
        },
        StreamEvent::Thrown(e) => StreamStep::Throw(e),
    })
}

/// A program that yields each item in order and returns the value the last
/// yield resumed with (Unit for an empty list).
pub fn sequence(mut yields: Vec<Yielded>) -> ProgramRef {
    yields.reverse();
    from_fn("sequence", move |event, _| {
        let value = match event.try_value() {
            Ok(v) => v,
            Err(e) => return StreamStep::Throw(e),
        };
        match yields.pop() {
            Some(y) => StreamStep::Yield(y),
            None => StreamStep::Return(value),
        }
    })
}
