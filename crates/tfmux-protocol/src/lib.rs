//! Wire types shared between the tfmux server and its viewers.
//!
//! Everything here is plain serde data: process states and summaries as
//! returned by the HTTP API, the read-only terminal settings advertised to
//! frontends, and the SSE event names used by the output stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ProcessState
// ============================================================================

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Record allocated, no OS process yet.
    Created,
    /// Spawn requested, pid may not be known yet.
    Starting,
    /// Pid known and the process is alive.
    Running,
    /// Termination signal issued, exit not yet observed.
    Stopping,
    /// Exit observed after a stop request or a clean voluntary exit.
    Stopped,
    /// Launch failure or abnormal exit.
    Crashed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Created => "created",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Process views
// ============================================================================

/// Short listing entry for a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub id: u64,
    pub pid: Option<u32>,
    pub state: ProcessState,
}

/// Full view of a process record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: u64,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub command: String,
    pub argv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<i32>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

// ============================================================================
// TerminalSettings
// ============================================================================

/// Server-wide settings exposed read-only to terminal frontends.
///
/// The core never interprets most of these; they are passed through to
/// whatever speaks the terminal protocol with viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Seconds a disconnected viewer should wait before reconnecting.
    pub reconnect_seconds: u64,
    /// Value of `TERM` for spawned processes.
    pub terminal_type: String,
    /// Name of the signal sent on stop (e.g. `SIGHUP`).
    pub termination_signal: String,
    /// Numeric value of `termination_signal`.
    pub termination_signal_code: i32,
    /// Viewers may not write to the terminals.
    pub read_only: bool,
    /// Reject websocket upgrades from a different origin.
    pub check_origin: bool,
    /// Maximum concurrent viewers, 0 for unlimited.
    pub max_clients: u32,
    /// Accept a single viewer and exit when it disconnects.
    pub once: bool,
    /// Custom index.html to serve instead of the bundled one.
    pub index: Option<String>,
    /// Unix domain socket the server listens on, if any.
    pub unix_socket_path: Option<String>,
    /// Client preferences forwarded verbatim to the frontend.
    pub client_prefs: serde_json::Value,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            reconnect_seconds: 10,
            terminal_type: "xterm-256color".to_string(),
            termination_signal: "SIGHUP".to_string(),
            termination_signal_code: 1,
            read_only: false,
            check_origin: false,
            max_clients: 0,
            once: false,
            index: None,
            unix_socket_path: None,
            client_prefs: serde_json::Value::Object(Default::default()),
        }
    }
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProcessRequest {
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProcessResponse {
    pub id: u64,
    pub state: ProcessState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListProcessesResponse {
    pub processes: Vec<ProcessSummary>,
}

/// Text to write to a process's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteInputRequest {
    pub data: String,
}

// ============================================================================
// SSE
// ============================================================================

/// Event names emitted by the output stream.
pub mod sse {
    /// Retained output window, sent once on attach. Data is base64.
    pub const REPLAY: &str = "replay";
    /// Live output chunk. Data is base64.
    pub const OUTPUT: &str = "output";
    /// Viewer fell behind and missed chunks. Data is the skipped count.
    pub const LAGGED: &str = "lagged";
    /// Process reached a terminal state. Data is a `ProcessInfo`.
    pub const EXIT: &str = "exit";
}
