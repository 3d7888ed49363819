//! Creation-site capture, dispatch trace records, and snapshot types.
//!
//! The VM appends trace records as dispatches progress; external tools read
//! them through `ExecutionSnapshot` or from a `Failure`. The VM itself never
//! writes them anywhere.

use serde::Serialize;

/// Source location captured when an effect (or failure) is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSite {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl CallSite {
    #[track_caller]
    pub fn here() -> Self {
        let loc = std::panic::Location::caller();
        CallSite {
            file: loc.file().to_string(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Handler implementation kind, for trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandlerKind {
    Builtin,
    Program,
}

/// How a dispatch ended (or that it is still live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchOutcome {
    Active,
    Resumed,
    Transferred,
    Returned,
    Threw,
}

/// One delegation hop within a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelegationHop {
    pub handler_name: String,
    pub handler_kind: HandlerKind,
}

/// Lifecycle record for a single effect dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    pub dispatch_id: u64,
    pub effect_repr: String,
    pub handler_name: String,
    pub handler_kind: HandlerKind,
    pub creation_site: Option<CallSite>,
    pub delegation_chain: Vec<DelegationHop>,
    pub outcome: DispatchOutcome,
}

/// Descriptor of one frame in the current continuation stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameDescriptor {
    pub kind: String,
    pub detail: Option<String>,
}

/// VM status at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnapshotStatus {
    Running,
    Dispatching,
    Done,
    Failed,
}

/// Per-step observation handed to the `on_step` callback.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub status: SnapshotStatus,
    pub k_stack: Vec<FrameDescriptor>,
    pub current_effect: Option<String>,
    pub step_count: u64,
}
