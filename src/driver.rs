//! Public run surface: `run`, `async_run`, and the result protocol.

use indexmap::IndexMap;

use crate::capture::{ExecutionSnapshot, SnapshotStatus};
use crate::error::{Failure, VmError};
use crate::handler::HandlerRef;
use crate::program::IntoProgram;
use crate::store::Store;
use crate::value::Value;
use crate::vm::{wrap_with_handlers, StepOutcome, Vm};

pub type StepObserver = Box<dyn FnMut(&ExecutionSnapshot) + Send>;

/// Everything a run starts from. `handlers` nest outermost-first, exactly as
/// if the caller had written the `WithHandler` chain by hand; there are no
/// hidden defaults. `env` seeds the reader environment, `store` the mutable
/// state.
#[derive(Default)]
pub struct RunConfig {
    handlers: Vec<HandlerRef>,
    env: IndexMap<String, Value>,
    store: IndexMap<String, Value>,
    on_step: Option<StepObserver>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: Vec<HandlerRef>) -> Self {
        Self::new().handlers(handlers)
    }

    pub fn handlers(mut self, handlers: Vec<HandlerRef>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn handler(mut self, handler: HandlerRef) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn env(mut self, env: IndexMap<String, Value>) -> Self {
        self.env = env;
        self
    }

    pub fn env_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn store(mut self, store: IndexMap<String, Value>) -> Self {
        self.store = store;
        self
    }

    pub fn store_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.store.insert(key.into(), value.into());
        self
    }

    /// The single observability seam. The VM does no I/O itself; external
    /// tracers subscribe here.
    pub fn on_step(mut self, observer: impl FnMut(&ExecutionSnapshot) + Send + 'static) -> Self {
        self.on_step = Some(Box::new(observer));
        self
    }
}

/// Immutable outcome snapshot of a run.
#[derive(Debug)]
pub struct RunResult {
    pub result: Result<Value, Failure>,
    /// State only: no environment, no writer logs.
    pub raw_store: IndexMap<String, Value>,
}

impl RunResult {
    /// Unwrap the Ok value or surface the failure.
    pub fn value(self) -> Result<Value, Failure> {
        self.result
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn prepare(program: impl IntoProgram, config: RunConfig) -> (Vm, Option<StepObserver>) {
    let RunConfig {
        handlers,
        env,
        store,
        on_step,
    } = config;
    let mut vm = Vm::new(Store::with_seed(env, store));
    vm.load_root(wrap_with_handlers(program.into_program(), handlers));
    (vm, on_step)
}

fn observe(vm: &Vm, observer: &mut Option<StepObserver>, outcome: &StepOutcome) {
    let Some(callback) = observer.as_mut() else {
        return;
    };
    let status = match outcome {
        StepOutcome::Running | StepOutcome::HostAsync(_) => {
            if vm.is_dispatching() {
                SnapshotStatus::Dispatching
            } else {
                SnapshotStatus::Running
            }
        }
        StepOutcome::Done(_) => SnapshotStatus::Done,
        StepOutcome::Failed(_) => SnapshotStatus::Failed,
    };
    callback(&vm.snapshot(status));
}

fn finish(vm: Vm, result: Result<Value, Failure>) -> RunResult {
    let result = result.map_err(|mut failure| {
        if failure.trace.is_empty() {
            failure.trace = vm.trace_records().to_vec();
        }
        failure
    });
    RunResult {
        result,
        raw_store: vm.store.state.clone(),
    }
}

/// Run a program to completion synchronously.
///
/// Fails with [`VmError::SyncEscape`] if a host-async escape surfaces: either
/// install a sync `Await` handler or use [`async_run`].
pub fn run(program: impl IntoProgram, config: RunConfig) -> Result<RunResult, VmError> {
    let (mut vm, mut observer) = prepare(program, config);
    loop {
        let outcome = vm.step();
        observe(&vm, &mut observer, &outcome);
        match outcome {
            StepOutcome::Running => {}
            StepOutcome::Done(value) => return Ok(finish(vm, Ok(value))),
            StepOutcome::Failed(failure) => return Ok(finish(vm, Err(failure))),
            StepOutcome::HostAsync(_) => return Err(VmError::SyncEscape),
        }
    }
}

/// Run a program to completion on the caller's async runtime, pumping
/// host-async escapes and yielding to the event loop between steps.
pub async fn async_run(program: impl IntoProgram, config: RunConfig) -> Result<RunResult, VmError> {
    let (mut vm, mut observer) = prepare(program, config);
    let mut outcome = vm.step();
    loop {
        observe(&vm, &mut observer, &outcome);
        match outcome {
            StepOutcome::Running => {
                tokio::task::yield_now().await;
                outcome = vm.step();
            }
            StepOutcome::Done(value) => return Ok(finish(vm, Ok(value))),
            StepOutcome::Failed(failure) => return Ok(finish(vm, Err(failure))),
            StepOutcome::HostAsync(escape) => {
                let resolved = escape.awaitable.await;
                outcome = vm.complete_host_async(resolved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctl::Yielded;
    use crate::effect::Effect;
    use crate::handler;
    use crate::program;

    #[test]
    fn test_run_returns_value_and_raw_store() {
        let result = run(
            program::sequence(vec![
                Yielded::Effect(Effect::put("c", Value::Int(3))),
                Yielded::Effect(Effect::get("c")),
            ]),
            RunConfig::with_handlers(vec![handler::state()]),
        )
        .expect("no driver error");

        assert_eq!(result.result.as_ref().ok(), Some(&Value::Int(3)));
        assert_eq!(result.raw_store.get("c"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_run_config_builder_seeds_env_and_store() {
        let result = run(
            program::sequence(vec![Yielded::Effect(Effect::ask("who"))]),
            RunConfig::new()
                .handler(handler::reader())
                .env_entry("who", "me")
                .store_entry("s", Value::Int(1)),
        )
        .expect("no driver error");

        assert_eq!(result.result.as_ref().ok(), Some(&Value::from("me")));
        assert_eq!(result.raw_store.get("s"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_on_step_observer_sees_steps() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let steps = Arc::new(AtomicU64::new(0));
        let counter = steps.clone();
        let result = run(
            program::pure(Value::Unit),
            RunConfig::new().on_step(move |snapshot| {
                counter.fetch_max(snapshot.step_count, Ordering::Relaxed);
            }),
        )
        .expect("no driver error");

        assert!(result.is_ok());
        assert!(steps.load(Ordering::Relaxed) > 0);
    }
}
