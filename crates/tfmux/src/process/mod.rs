//! Supervised command sessions.
//!
//! A [`ProcessRecord`] models one OS process and owns its output
//! [`RingBuffer`]. The [`ProcessRegistry`] is the server-wide directory of
//! records; each record is driven by its own supervisor task (see
//! [`supervisor`]) which is the only writer of its state and output.

pub mod record;
pub mod registry;
pub mod ring;
pub mod supervisor;

use thiserror::Error;

pub use record::ProcessRecord;
pub use registry::{ProcessRegistry, RegistryConfig};
pub use ring::{RingBuffer, RingBufferError};
pub use tfmux_protocol::{ProcessInfo, ProcessState, ProcessSummary};

// ============================================================================
// ProcessId
// ============================================================================

/// Identifier of a process record, unique for the lifetime of the server.
///
/// Allocated from a monotonic counter; never derived from an OS pid, since
/// pids are recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ProcessId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// ============================================================================
// ProcessError
// ============================================================================

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process not found: {0}")]
    NotFound(ProcessId),

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("failed to start supervisor: {0}")]
    WorkerStart(String),

    #[error("process is not running")]
    NotRunning,

    #[error("process does not have stdin")]
    NoStdin,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ProcessState, to: ProcessState },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
