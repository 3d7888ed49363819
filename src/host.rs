//! The host-async boundary.
//!
//! Exactly one value leaves the interpreter: `HostAsyncEscape`, carrying a
//! future the host runtime must await. `async_run` pumps these; sync `run`
//! refuses them unless a sync `Await` bridge absorbed the effect first.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::error::{Failure, VmError};
use crate::value::Value;

pub type BoxedHostFuture = Pin<Box<dyn Future<Output = Result<Value, Failure>> + Send>>;

/// A host awaitable carried inside an `Await` effect.
///
/// The future is taken exactly once by whichever handler absorbs the effect;
/// the wrapper stays Clone so effects remain Clone.
#[derive(Clone)]
pub struct HostFuture(Arc<Mutex<Option<BoxedHostFuture>>>);

impl HostFuture {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, Failure>> + Send + 'static,
    {
        HostFuture(Arc::new(Mutex::new(Some(Box::pin(future)))))
    }

    /// A timer awaitable; the building block for timeouts via `Race`.
    pub fn sleep(duration: Duration) -> Self {
        HostFuture::new(async move {
            tokio::time::sleep(duration).await;
            Ok(Value::Unit)
        })
    }

    pub fn take(&self) -> Option<BoxedHostFuture> {
        self.0.lock().expect("host future lock poisoned").take()
    }
}

impl fmt::Debug for HostFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let taken = self
            .0
            .lock()
            .map(|slot| slot.is_none())
            .unwrap_or(true);
        f.debug_struct("HostFuture").field("taken", &taken).finish()
    }
}

/// The single leaf value that leaves the interpreter.
///
/// The VM parks the continuation that performed the `Await`; the driver
/// awaits `awaitable` and feeds the outcome back through
/// `Vm::complete_host_async`.
pub struct HostAsyncEscape {
    pub awaitable: BoxedHostFuture,
}

impl fmt::Debug for HostAsyncEscape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAsyncEscape").finish_non_exhaustive()
    }
}

static SYNC_BRIDGE: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

/// Drive a host future to completion on a private current-thread runtime.
///
/// Only callable from sync contexts; the sync `Await` handler uses this so
/// plain `run` never sees an escape.
pub fn block_on_host(future: BoxedHostFuture) -> Result<Value, Failure> {
    let runtime = SYNC_BRIDGE.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build sync await bridge runtime")
    });
    runtime.block_on(future)
}

/// A sync-escape failure for drivers that cannot pump.
pub fn sync_escape_failure() -> Failure {
    Failure::from_vm(VmError::SyncEscape)
}
