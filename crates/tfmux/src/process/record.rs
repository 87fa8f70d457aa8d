//! One supervised process: identity, lifecycle state and output.
//!
//! All state and output access goes through the record's own lock, never
//! the registry's, so a slow reader of one record cannot stall another.
//! Only the record's supervisor drives transitions, with the single
//! exception of [`ProcessRecord::request_stop`] (`Running -> Stopping`).

// std::sync::Mutex is correct here: the lock is never held across .await points.
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, warn};

use super::ring::RingBuffer;
use super::{ProcessError, ProcessId, ProcessInfo, ProcessState, ProcessSummary};
use crate::signal::Signal;

/// Live output chunks buffered per viewer before it is considered lagging.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Whether `from -> to` is a legal lifecycle transition.
pub fn is_legal_transition(from: ProcessState, to: ProcessState) -> bool {
    use ProcessState::*;
    matches!(
        (from, to),
        (Created, Starting)
            | (Starting, Running)
            | (Starting, Crashed)
            | (Running, Stopping)
            | (Running, Crashed)
            | (Stopping, Stopped)
    )
}

// ============================================================================
// Exit
// ============================================================================

/// How the OS process ended, as observed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Exited on its own with a status code.
    Code(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Waiting on the child failed; the process is gone either way.
    WaitFailed(String),
}

impl Exit {
    fn is_clean(&self) -> bool {
        matches!(self, Exit::Code(0))
    }

    fn describe(&self) -> String {
        match self {
            Exit::Code(code) => format!("exited with status {}", code),
            Exit::Signaled(sig) => match Signal::from_code(*sig) {
                Some(signal) => format!("killed by {}", signal),
                None => format!("killed by signal {}", sig),
            },
            Exit::WaitFailed(e) => format!("wait failed: {}", e),
        }
    }
}

// ============================================================================
// ProcessRecord
// ============================================================================

struct RecordState {
    state: ProcessState,
    pid: Option<u32>,
    running: bool,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    exited_at: Option<DateTime<Utc>>,
    output: RingBuffer,
    /// Hands the termination signal to the supervisor, which owns the child.
    stop_tx: Option<oneshot::Sender<Signal>>,
}

/// The server's model of one supervised command session.
pub struct ProcessRecord {
    id: ProcessId,
    argv: Vec<String>,
    command: String,
    created_at: DateTime<Utc>,
    inner: Mutex<RecordState>,
    /// Published by the supervisor, readable by anyone.
    last_error: RwLock<Option<String>>,
    state_tx: watch::Sender<ProcessState>,
    output_tx: broadcast::Sender<Bytes>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl ProcessRecord {
    pub fn new(id: ProcessId, argv: Vec<String>, buffer_capacity: NonZeroUsize) -> Self {
        let command = argv.join(" ");
        let (state_tx, _) = watch::channel(ProcessState::Created);
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);

        Self {
            id,
            argv,
            command,
            created_at: Utc::now(),
            inner: Mutex::new(RecordState {
                state: ProcessState::Created,
                pid: None,
                running: false,
                exit_code: None,
                exit_signal: None,
                exited_at: None,
                output: RingBuffer::with_capacity(buffer_capacity),
                stop_tx: None,
            }),
            last_error: RwLock::new(None),
            state_tx,
            output_tx,
            stdin: tokio::sync::Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Human-readable command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn last_error(&self) -> Option<String> {
        match self.last_error.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn summary(&self) -> ProcessSummary {
        let inner = self.lock();
        ProcessSummary {
            id: self.id.get(),
            pid: inner.pid,
            state: inner.state,
        }
    }

    pub fn info(&self) -> ProcessInfo {
        let (pid, state, exit_code, exit_signal, exited_at) = {
            let inner = self.lock();
            (
                inner.pid,
                inner.state,
                inner.exit_code,
                inner.exit_signal,
                inner.exited_at,
            )
        };
        ProcessInfo {
            id: self.id.get(),
            pid,
            state,
            command: self.command.clone(),
            argv: self.argv.clone(),
            last_error: self.last_error(),
            exit_code,
            exit_signal,
            created_at: self.created_at,
            exited_at,
        }
    }

    /// Most recent output, at most `max_len` bytes (0 for everything retained).
    pub fn read_output(&self, max_len: usize) -> Vec<u8> {
        self.lock().output.snapshot(max_len)
    }

    /// Live output chunks appended from now on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    /// Retained output plus a subscription starting right after it.
    ///
    /// Taken under the record lock so no chunk is missed or repeated.
    pub fn replay_and_subscribe(&self, max_len: usize) -> (Vec<u8>, broadcast::Receiver<Bytes>) {
        let inner = self.lock();
        let replay = inner.output.snapshot(max_len);
        let rx = self.output_tx.subscribe();
        (replay, rx)
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// Wait until the supervisor has recorded `Stopped` or `Crashed`.
    pub async fn wait_terminal(&self) -> ProcessState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // Sender lives as long as `self`.
            Err(_) => self.state(),
        }
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Ask the process to terminate with `signal`.
    ///
    /// No-op unless the record is `Running`. Returns whether a stop was
    /// issued. The supervisor delivers the signal and decides the final
    /// state once the exit is observed.
    pub fn request_stop(&self, signal: Signal) -> bool {
        let mut inner = self.lock();
        if inner.state != ProcessState::Running {
            return false;
        }
        self.set_state(&mut inner, ProcessState::Stopping);
        inner.running = false;
        let pid = inner.pid;
        let stop_tx = inner.stop_tx.take();
        drop(inner);

        debug!(id = %self.id, ?pid, signal = %signal, "Stop requested");
        if let Some(tx) = stop_tx
            && tx.send(signal).is_err()
        {
            debug!(id = %self.id, "Supervisor already gone, stop not delivered");
        }
        true
    }

    /// Write bytes to the process's stdin.
    pub async fn write_input(&self, data: &[u8]) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(ProcessError::NoStdin)?;
        pipe.write_all(data).await?;
        pipe.flush().await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Supervisor side
    // ------------------------------------------------------------------------

    /// `Created -> Starting`. The supervisor keeps the other end of `stop_tx`.
    pub(crate) fn begin_start(&self, stop_tx: oneshot::Sender<Signal>) -> Result<(), ProcessError> {
        let mut inner = self.lock();
        self.transition(&mut inner, ProcessState::Starting)?;
        inner.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// `Starting -> Running` once the OS process exists.
    pub(crate) async fn mark_running(
        &self,
        pid: Option<u32>,
        stdin: Option<ChildStdin>,
    ) -> Result<(), ProcessError> {
        *self.stdin.lock().await = stdin;
        let mut inner = self.lock();
        self.transition(&mut inner, ProcessState::Running)?;
        inner.pid = pid;
        inner.running = true;
        Ok(())
    }

    /// `Starting -> Crashed` after the OS refused to launch the command.
    pub(crate) fn mark_spawn_failed(&self, message: String) {
        self.publish_error(message);
        let mut inner = self.lock();
        inner.stop_tx = None;
        inner.exited_at = Some(Utc::now());
        if let Err(e) = self.transition(&mut inner, ProcessState::Crashed) {
            warn!(id = %self.id, error = %e, "Ignoring spawn failure transition");
        }
    }

    /// Append captured output and fan it out to attached viewers.
    pub(crate) fn append_output(&self, chunk: &[u8]) {
        let mut inner = self.lock();
        inner.output.append(chunk);
        // No receivers is fine: nobody is attached.
        let _ = self.output_tx.send(Bytes::copy_from_slice(chunk));
    }

    /// Record the exit and move to the final state.
    ///
    /// After a stop request the result is `Stopped`. A clean voluntary exit
    /// passes through `Stopping` to `Stopped`; anything else is `Crashed`.
    pub(crate) async fn mark_exited(&self, exit: Exit) -> ProcessState {
        self.stdin.lock().await.take();

        let mut inner = self.lock();
        if inner.state.is_terminal() {
            warn!(id = %self.id, state = %inner.state, "Exit observed for finished record");
            return inner.state;
        }
        inner.running = false;
        inner.stop_tx = None;
        inner.exited_at = Some(Utc::now());
        match exit {
            Exit::Code(code) => inner.exit_code = Some(code),
            Exit::Signaled(sig) => inner.exit_signal = Some(sig),
            Exit::WaitFailed(_) => {}
        }

        let current = inner.state;
        let result = match current {
            ProcessState::Stopping => self.transition(&mut inner, ProcessState::Stopped),
            ProcessState::Running if exit.is_clean() => self
                .transition(&mut inner, ProcessState::Stopping)
                .and_then(|_| self.transition(&mut inner, ProcessState::Stopped)),
            ProcessState::Running => self.transition(&mut inner, ProcessState::Crashed),
            from => Err(ProcessError::InvalidTransition {
                from,
                to: ProcessState::Stopped,
            }),
        };
        let final_state = inner.state;
        drop(inner);

        match result {
            Ok(()) if final_state == ProcessState::Crashed => self.publish_error(exit.describe()),
            Ok(()) => {}
            Err(e) => warn!(id = %self.id, error = %e, "Ignoring exit transition"),
        }
        final_state
    }

    pub(crate) fn publish_error(&self, message: String) {
        match self.last_error.write() {
            Ok(mut guard) => *guard = Some(message),
            Err(poisoned) => *poisoned.into_inner() = Some(message),
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        // A panic while holding the lock cannot leave RecordState half-written
        // in a way later readers care about.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, inner: &mut RecordState, to: ProcessState) -> Result<(), ProcessError> {
        if !is_legal_transition(inner.state, to) {
            return Err(ProcessError::InvalidTransition {
                from: inner.state,
                to,
            });
        }
        self.set_state(inner, to);
        Ok(())
    }

    fn set_state(&self, inner: &mut RecordState, to: ProcessState) {
        debug!(id = %self.id, from = %inner.state, to = %to, "State transition");
        inner.state = to;
        self.state_tx.send_replace(to);
    }
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ProcessState; 6] = [
        ProcessState::Created,
        ProcessState::Starting,
        ProcessState::Running,
        ProcessState::Stopping,
        ProcessState::Stopped,
        ProcessState::Crashed,
    ];

    fn record() -> ProcessRecord {
        ProcessRecord::new(
            ProcessId::new(1),
            vec!["echo".to_string(), "hi".to_string()],
            NonZeroUsize::new(64).unwrap(),
        )
    }

    async fn running_record() -> (ProcessRecord, oneshot::Receiver<Signal>) {
        let record = record();
        let (tx, rx) = oneshot::channel();
        record.begin_start(tx).unwrap();
        record.mark_running(Some(4242), None).await.unwrap();
        (record, rx)
    }

    #[test]
    fn legal_transitions_table() {
        let legal = [
            (ProcessState::Created, ProcessState::Starting),
            (ProcessState::Starting, ProcessState::Running),
            (ProcessState::Starting, ProcessState::Crashed),
            (ProcessState::Running, ProcessState::Stopping),
            (ProcessState::Running, ProcessState::Crashed),
            (ProcessState::Stopping, ProcessState::Stopped),
        ];
        for from in ALL_STATES {
            for to in ALL_STATES {
                assert_eq!(
                    is_legal_transition(from, to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in ALL_STATES {
            assert!(!is_legal_transition(ProcessState::Stopped, to));
            assert!(!is_legal_transition(ProcessState::Crashed, to));
        }
    }

    #[test]
    fn new_record_derives_command_line() {
        let record = record();
        assert_eq!(record.command(), "echo hi");
        assert_eq!(record.state(), ProcessState::Created);
        assert_eq!(record.pid(), None);
        assert!(!record.is_running());
        assert!(record.last_error().is_none());
    }

    #[test]
    fn request_stop_is_noop_unless_running() {
        let record = record();
        assert!(!record.request_stop(Signal::HUP));
        assert_eq!(record.state(), ProcessState::Created);

        let (tx, _rx) = oneshot::channel();
        record.begin_start(tx).unwrap();
        assert!(!record.request_stop(Signal::HUP));
        assert_eq!(record.state(), ProcessState::Starting);
    }

    #[tokio::test]
    async fn request_stop_hands_signal_to_supervisor_once() {
        let (record, rx) = running_record().await;
        assert!(record.is_running());

        assert!(record.request_stop(Signal::HUP));
        assert_eq!(record.state(), ProcessState::Stopping);
        assert!(!record.is_running());
        assert_eq!(rx.await.unwrap(), Signal::HUP);

        assert!(!record.request_stop(Signal::KILL));
        assert_eq!(record.state(), ProcessState::Stopping);
    }

    #[tokio::test]
    async fn exit_after_stop_is_stopped() {
        let (record, _rx) = running_record().await;
        record.request_stop(Signal::HUP);

        let state = record.mark_exited(Exit::Signaled(libc::SIGHUP)).await;
        assert_eq!(state, ProcessState::Stopped);
        assert_eq!(record.info().exit_signal, Some(libc::SIGHUP));
        assert!(record.last_error().is_none());
        assert!(!record.request_stop(Signal::HUP));
    }

    #[tokio::test]
    async fn clean_exit_is_stopped() {
        let (record, _rx) = running_record().await;
        let mut states = record.subscribe_state();

        let state = record.mark_exited(Exit::Code(0)).await;
        assert_eq!(state, ProcessState::Stopped);
        assert_eq!(*states.borrow_and_update(), ProcessState::Stopped);
        assert_eq!(record.info().exit_code, Some(0));
        assert!(record.info().exited_at.is_some());
    }

    #[tokio::test]
    async fn abnormal_exit_is_crashed_with_error() {
        let (record, _rx) = running_record().await;

        let state = record.mark_exited(Exit::Code(3)).await;
        assert_eq!(state, ProcessState::Crashed);
        assert_eq!(record.last_error().as_deref(), Some("exited with status 3"));
    }

    #[tokio::test]
    async fn killed_by_signal_is_crashed() {
        let (record, _rx) = running_record().await;

        let state = record.mark_exited(Exit::Signaled(libc::SIGKILL)).await;
        assert_eq!(state, ProcessState::Crashed);
        assert!(record.last_error().unwrap().contains("SIGKILL"));
    }

    #[test]
    fn spawn_failure_is_crashed() {
        let record = record();
        let (tx, _rx) = oneshot::channel();
        record.begin_start(tx).unwrap();

        record.mark_spawn_failed("No such file or directory".to_string());
        assert_eq!(record.state(), ProcessState::Crashed);
        assert_eq!(
            record.last_error().as_deref(),
            Some("No such file or directory")
        );
    }

    #[tokio::test]
    async fn terminal_state_is_final() {
        let (record, _rx) = running_record().await;
        record.mark_exited(Exit::Code(1)).await;

        let state = record.mark_exited(Exit::Code(0)).await;
        assert_eq!(state, ProcessState::Crashed);
        let (tx, _rx) = oneshot::channel();
        assert!(record.begin_start(tx).is_err());
    }

    #[test]
    fn begin_start_twice_is_rejected() {
        let record = record();
        let (tx, _rx) = oneshot::channel();
        record.begin_start(tx).unwrap();

        let (tx, _rx) = oneshot::channel();
        let err = record.begin_start(tx).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::InvalidTransition {
                from: ProcessState::Starting,
                to: ProcessState::Starting
            }
        ));
    }

    #[tokio::test]
    async fn output_is_buffered_and_broadcast() {
        let record = record();
        record.append_output(b"before ");
        let (replay, mut rx) = record.replay_and_subscribe(0);
        assert_eq!(replay, b"before ");

        record.append_output(b"after");
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"after"));
        assert_eq!(record.read_output(0), b"before after");
        assert_eq!(record.read_output(5), b"after");
    }

    #[tokio::test]
    async fn wait_terminal_resolves_on_exit() {
        let (record, _rx) = running_record().await;
        let record = std::sync::Arc::new(record);

        let waiter = {
            let record = record.clone();
            tokio::spawn(async move { record.wait_terminal().await })
        };
        tokio::task::yield_now().await;
        record.mark_exited(Exit::Code(0)).await;

        assert_eq!(waiter.await.unwrap(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn write_input_requires_running() {
        let record = record();
        assert!(matches!(
            record.write_input(b"ls\n").await,
            Err(ProcessError::NotRunning)
        ));

        let (record, _rx) = running_record().await;
        assert!(matches!(
            record.write_input(b"ls\n").await,
            Err(ProcessError::NoStdin)
        ));
    }
}
