//! Server-wide directory of process records.

// std::sync::Mutex is correct here: the lock is never held across .await points.
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tfmux_protocol::TerminalSettings;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ring::RingBufferError;
use super::supervisor::{SupervisorConfig, SupervisorControl, spawn_supervisor};
use super::{ProcessError, ProcessId, ProcessInfo, ProcessRecord, ProcessSummary};
use crate::signal::Signal;

/// How long `drain` waits for supervisors to reap force-killed processes
/// before aborting them.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything a registry needs to create and supervise processes.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Output bytes retained per process.
    pub buffer_capacity: usize,
    pub supervisor: SupervisorConfig,
    /// Read-only settings handed to the terminal protocol layer.
    pub settings: TerminalSettings,
    /// Base64 `user:pass` the protocol layer checks viewers against.
    pub credential: Option<String>,
}

struct Entry {
    record: Arc<ProcessRecord>,
    /// Taken by the first `remove`; a second caller sees `NotFound`.
    worker: Option<JoinHandle<()>>,
    control: SupervisorControl,
}

/// A supervisor handle taken out of its entry by `remove`.
///
/// If the removing future is dropped before the supervisor finished, the
/// handle goes back into the entry so a later `remove` or `drain` can
/// still join it.
struct ClaimedWorker<'a> {
    registry: &'a ProcessRegistry,
    id: ProcessId,
    worker: Option<JoinHandle<()>>,
}

impl Drop for ClaimedWorker<'_> {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        debug!(id = %self.id, "Removal abandoned, releasing supervisor");
        if let Some(entry) = self.registry.lock().map.get_mut(&self.id) {
            entry.worker = Some(worker);
        }
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<ProcessId, Entry>,
    closed: bool,
}

struct Shared {
    entries: Mutex<Entries>,
    next_id: AtomicU64,
    buffer_capacity: NonZeroUsize,
    supervisor: SupervisorConfig,
    settings: Arc<TerminalSettings>,
    credential: Option<String>,
    /// Cancelled when the registry closes; observed by every supervisor.
    shutdown: CancellationToken,
}

/// Concurrency-safe registry of supervised processes.
///
/// Cheap to clone; all clones share the same directory. The membership
/// lock only guards the map itself: record state and output live behind
/// each record's own lock.
#[derive(Clone)]
pub struct ProcessRegistry {
    shared: Arc<Shared>,
}

impl ProcessRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, RingBufferError> {
        let buffer_capacity =
            NonZeroUsize::new(config.buffer_capacity).ok_or(RingBufferError::ZeroCapacity)?;
        Ok(Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Entries::default()),
                next_id: AtomicU64::new(1),
                buffer_capacity,
                supervisor: config.supervisor,
                settings: Arc::new(config.settings),
                credential: config.credential,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Create a record for `argv` and start supervising it.
    ///
    /// The record only becomes visible once its supervisor is running.
    /// Spawn failures are not errors here: the record ends up `Crashed`
    /// with the reason in its last error.
    pub fn create_process(&self, argv: Vec<String>) -> Result<ProcessId, ProcessError> {
        if argv.is_empty() || argv[0].is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        let mut entries = self.lock();
        if entries.closed {
            return Err(ProcessError::ShuttingDown);
        }

        let id = ProcessId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(ProcessRecord::new(id, argv, self.shared.buffer_capacity));
        let control = SupervisorControl::new(self.shared.shutdown.child_token());
        let worker = spawn_supervisor(
            record.clone(),
            self.shared.supervisor.clone(),
            control.clone(),
        )?;

        debug!(id = %id, command = %record.command(), "Process registered");
        entries.map.insert(
            id,
            Entry {
                record,
                worker: Some(worker),
                control,
            },
        );
        Ok(id)
    }

    pub fn lookup_by_id(&self, id: ProcessId) -> Option<Arc<ProcessRecord>> {
        self.lock().map.get(&id).map(|e| e.record.clone())
    }

    /// Find the record owning OS process `pid`.
    ///
    /// Pids are recycled, so with `only_running` set exited records are
    /// skipped.
    pub fn lookup_by_pid(&self, pid: u32, only_running: bool) -> Option<Arc<ProcessRecord>> {
        self.lock()
            .map
            .values()
            .map(|e| &e.record)
            .find(|r| r.pid() == Some(pid) && (!only_running || r.is_running()))
            .cloned()
    }

    /// Remove a record after its supervisor has finished.
    ///
    /// Waits for the process to exit; call [`Self::stop_process`] first to
    /// make that prompt. Cancel-safe: dropping the future leaves the record
    /// registered and removable again.
    pub async fn remove(&self, id: ProcessId) -> Result<(), ProcessError> {
        let mut claim = {
            let mut entries = self.lock();
            let worker = entries
                .map
                .get_mut(&id)
                .and_then(|e| e.worker.take())
                .ok_or(ProcessError::NotFound(id))?;
            ClaimedWorker {
                registry: self,
                id,
                worker: Some(worker),
            }
        };

        let joined = match claim.worker.as_mut() {
            Some(worker) => worker.await,
            None => Ok(()),
        };
        claim.worker = None;
        if let Err(e) = joined {
            if e.is_cancelled() {
                debug!(id = %id, "Supervisor was aborted");
            } else {
                warn!(id = %id, error = %e, "Supervisor task failed");
            }
        }

        self.lock().map.remove(&id);
        debug!(id = %id, "Process removed");
        Ok(())
    }

    /// Ask every running process to terminate. Returns how many were asked.
    pub fn for_each_stop(&self) -> usize {
        let signal = self.termination_signal();
        let entries = self.lock();
        entries
            .map
            .values()
            .filter(|e| e.record.request_stop(signal))
            .count()
    }

    /// Reject further creations. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let mut entries = self.lock();
        !std::mem::replace(&mut entries.closed, true)
    }

    /// Tell every supervisor to stop its process, including ones still
    /// starting up.
    pub fn cancel_supervisors(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait for every process to exit, then remove them all.
    ///
    /// Processes still alive after `timeout` are killed by their
    /// supervisors, which reap them and record the exit. A supervisor that
    /// has not finished `KILL_GRACE` after that is aborted.
    pub async fn drain(&self, timeout: Duration) {
        let records: Vec<Arc<ProcessRecord>> =
            self.lock().map.values().map(|e| e.record.clone()).collect();
        if records.is_empty() {
            return;
        }
        info!(count = records.len(), "Waiting for processes to exit");

        let all_exited = join_all(records.iter().map(|r| r.wait_terminal()));
        if tokio::time::timeout(timeout, all_exited).await.is_err() {
            let stragglers: Vec<Arc<ProcessRecord>> = {
                let entries = self.lock();
                entries
                    .map
                    .values()
                    .filter(|e| !e.record.state().is_terminal())
                    .map(|e| {
                        let (id, pid) = (e.record.id(), e.record.pid());
                        warn!(id = %id, ?pid, "Process did not exit in time, killing");
                        e.control.kill.cancel();
                        e.record.clone()
                    })
                    .collect()
            };

            let killed = join_all(stragglers.iter().map(|r| r.wait_terminal()));
            if tokio::time::timeout(KILL_GRACE, killed).await.is_err() {
                let entries = self.lock();
                let unfinished = entries
                    .map
                    .values()
                    .filter(|e| !e.record.state().is_terminal());
                for entry in unfinished {
                    if let Some(worker) = &entry.worker {
                        warn!(id = %entry.record.id(), "Supervisor did not finish, aborting");
                        worker.abort();
                    }
                }
            }
        }

        let ids: Vec<ProcessId> = self.lock().map.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.remove(id).await {
                debug!(id = %id, error = %e, "Already removed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Operations by id
    // ========================================================================

    /// Request termination with the configured signal. Idempotent.
    ///
    /// A process that is still starting is stopped as soon as it runs.
    pub fn stop_process(&self, id: ProcessId) -> Result<(), ProcessError> {
        let (record, stop) = {
            let entries = self.lock();
            let entry = entries.map.get(&id).ok_or(ProcessError::NotFound(id))?;
            (entry.record.clone(), entry.control.stop.clone())
        };
        if record.request_stop(self.termination_signal()) {
            info!(id = %id, "Stopping process");
        }
        stop.cancel();
        Ok(())
    }

    pub fn get_state(&self, id: ProcessId) -> Result<ProcessInfo, ProcessError> {
        Ok(self.record(id)?.info())
    }

    pub fn read_output(&self, id: ProcessId, max_bytes: usize) -> Result<Vec<u8>, ProcessError> {
        Ok(self.record(id)?.read_output(max_bytes))
    }

    pub async fn write_input(&self, id: ProcessId, data: &[u8]) -> Result<(), ProcessError> {
        self.record(id)?.write_input(data).await
    }

    /// Summaries of every registered process, ordered by id.
    pub fn list_processes(&self) -> Vec<ProcessSummary> {
        let records: Vec<Arc<ProcessRecord>> =
            self.lock().map.values().map(|e| e.record.clone()).collect();
        let mut summaries: Vec<ProcessSummary> = records.iter().map(|r| r.summary()).collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn settings(&self) -> Arc<TerminalSettings> {
        self.shared.settings.clone()
    }

    pub fn credential(&self) -> Option<&str> {
        self.shared.credential.as_deref()
    }

    pub fn termination_signal(&self) -> Signal {
        self.shared.supervisor.termination_signal
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn record(&self, id: ProcessId) -> Result<Arc<ProcessRecord>, ProcessError> {
        self.lookup_by_id(id).ok_or(ProcessError::NotFound(id))
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::process::ProcessState;

    fn test_config() -> RegistryConfig {
        RegistryConfig {
            buffer_capacity: 4096,
            supervisor: SupervisorConfig {
                terminal_type: "xterm-256color".to_string(),
                termination_signal: Signal::HUP,
                kill_timeout: Some(Duration::from_secs(5)),
            },
            settings: TerminalSettings::default(),
            credential: None,
        }
    }

    fn registry() -> ProcessRegistry {
        ProcessRegistry::new(test_config()).unwrap()
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_running(registry: &ProcessRegistry, id: ProcessId) {
        let record = registry.lookup_by_id(id).unwrap();
        let mut states = record.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(10),
            states.wait_for(|s| *s == ProcessState::Running),
        )
        .await
        .expect("process never started")
        .unwrap();
    }

    async fn wait_terminal(registry: &ProcessRegistry, id: ProcessId) -> ProcessState {
        let record = registry.lookup_by_id(id).unwrap();
        tokio::time::timeout(Duration::from_secs(10), record.wait_terminal())
            .await
            .expect("process never exited")
    }

    #[test]
    fn zero_buffer_capacity_is_rejected() {
        let mut config = test_config();
        config.buffer_capacity = 0;
        assert_eq!(
            ProcessRegistry::new(config).unwrap_err(),
            RingBufferError::ZeroCapacity
        );
    }

    #[test]
    fn create_without_runtime_is_not_registered() {
        let registry = registry();
        let err = registry.create_process(argv(&["true"])).unwrap_err();
        assert!(matches!(err, ProcessError::WorkerStart(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn echo_runs_to_completion() {
        let registry = registry();
        let id = registry.create_process(argv(&["echo", "hi"])).unwrap();

        assert_eq!(wait_terminal(&registry, id).await, ProcessState::Stopped);
        let info = registry.get_state(id).unwrap();
        assert_eq!(info.command, "echo hi");
        assert!(info.pid.is_some());
        assert!(info.last_error.is_none());

        registry.remove(id).await.unwrap();
        assert_eq!(registry.read_output(id, 0).unwrap_err().to_string(), "process not found: 1");
    }

    #[tokio::test]
    async fn output_is_readable_after_exit() {
        let registry = registry();
        let id = registry.create_process(argv(&["echo", "hi"])).unwrap();
        wait_terminal(&registry, id).await;
        // Supervisor finishes draining pipes before recording the exit.
        assert_eq!(registry.read_output(id, 0).unwrap(), b"hi\n");
        assert_eq!(registry.read_output(id, 1).unwrap(), b"\n");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.create_process(Vec::new()),
            Err(ProcessError::EmptyCommand)
        ));
        assert!(matches!(
            registry.create_process(argv(&[""])),
            Err(ProcessError::EmptyCommand)
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = registry();
        let id = ProcessId::new(42);
        assert!(matches!(registry.stop_process(id), Err(ProcessError::NotFound(_))));
        assert!(matches!(registry.get_state(id), Err(ProcessError::NotFound(_))));
        assert!(matches!(registry.read_output(id, 0), Err(ProcessError::NotFound(_))));
        assert!(matches!(registry.remove(id).await, Err(ProcessError::NotFound(_))));
        assert!(registry.lookup_by_id(id).is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_visible_on_record() {
        let registry = registry();
        let id = registry
            .create_process(argv(&["/nonexistent/tfmux-test-binary"]))
            .unwrap();
        assert_eq!(wait_terminal(&registry, id).await, ProcessState::Crashed);
        assert!(registry.get_state(id).unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn stop_process_leads_to_stopped() {
        let registry = registry();
        let id = registry.create_process(argv(&["sleep", "30"])).unwrap();
        wait_running(&registry, id).await;

        registry.stop_process(id).unwrap();
        registry.stop_process(id).unwrap();
        assert_eq!(wait_terminal(&registry, id).await, ProcessState::Stopped);
        assert_eq!(registry.get_state(id).unwrap().exit_signal, Some(libc::SIGHUP));
        registry.remove(id).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn lookup_by_pid_respects_only_running() {
        let registry = registry();
        let id = registry.create_process(argv(&["sleep", "30"])).unwrap();
        wait_running(&registry, id).await;
        let pid = registry.get_state(id).unwrap().pid.unwrap();

        assert_eq!(registry.lookup_by_pid(pid, true).unwrap().id(), id);

        registry.stop_process(id).unwrap();
        wait_terminal(&registry, id).await;
        assert!(registry.lookup_by_pid(pid, true).is_none());
        assert_eq!(registry.lookup_by_pid(pid, false).unwrap().id(), id);
    }

    #[tokio::test]
    async fn list_is_sorted_by_id() {
        let registry = registry();
        let ids: Vec<ProcessId> = (0..5)
            .map(|_| registry.create_process(argv(&["true"])).unwrap())
            .collect();

        let listed: Vec<u64> = registry.list_processes().iter().map(|s| s.id).collect();
        let expected: Vec<u64> = ids.iter().map(|id| id.get()).collect();
        assert_eq!(listed, expected);
        registry.drain(Duration::from_secs(10)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_get_unique_ids() {
        let registry = registry();
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.create_process(argv(&["true"])).unwrap() })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            assert!(ids.insert(task.await.unwrap()));
        }
        assert_eq!(registry.len(), 32);

        registry.drain(Duration::from_secs(10)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_create_stop_remove() {
        let registry = registry();
        let done = CancellationToken::new();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    while !done.is_cancelled() {
                        for summary in registry.list_processes() {
                            // Entries may vanish between the listing and the lookup.
                            let id = ProcessId::new(summary.id);
                            if let Some(record) = registry.lookup_by_id(id) {
                                assert_eq!(record.id(), id);
                            }
                            if let Some(pid) = summary.pid
                                && let Some(record) = registry.lookup_by_pid(pid, false)
                            {
                                assert_eq!(record.pid(), Some(pid));
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let id = registry.create_process(argv(&["sleep", "30"])).unwrap();
                    wait_running(&registry, id).await;
                    if i % 2 == 0 {
                        registry.stop_process(id).unwrap();
                        registry.remove(id).await.unwrap();
                        assert!(registry.lookup_by_id(id).is_none());
                        None
                    } else {
                        Some(id)
                    }
                })
            })
            .collect();

        let mut kept = Vec::new();
        for writer in writers {
            kept.extend(writer.await.unwrap());
        }
        done.cancel();
        for reader in readers {
            reader.await.unwrap();
        }

        assert_eq!(kept.len(), 8);
        assert_eq!(registry.len(), kept.len());
        for id in &kept {
            assert!(registry.lookup_by_id(*id).is_some());
        }

        assert_eq!(registry.for_each_stop(), kept.len());
        registry.drain(Duration::from_secs(10)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn second_remove_is_not_found() {
        let registry = registry();
        let id = registry.create_process(argv(&["sleep", "30"])).unwrap();
        wait_running(&registry, id).await;
        registry.stop_process(id).unwrap();

        let (first, second) = tokio::join!(registry.remove(id), registry.remove(id));
        assert!(first.is_ok() != second.is_ok());
        assert!(matches!(
            first.err().or(second.err()),
            Some(ProcessError::NotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn for_each_stop_signals_running_once() {
        let registry = registry();
        let ids: Vec<ProcessId> = (0..3)
            .map(|_| registry.create_process(argv(&["sleep", "30"])).unwrap())
            .collect();
        for id in &ids {
            wait_running(&registry, *id).await;
        }

        assert_eq!(registry.for_each_stop(), 3);
        assert_eq!(registry.for_each_stop(), 0);
        for id in ids {
            assert_eq!(wait_terminal(&registry, id).await, ProcessState::Stopped);
        }
    }

    #[tokio::test]
    async fn closed_registry_rejects_creation() {
        let registry = registry();
        assert!(registry.close());
        assert!(!registry.close());
        assert!(registry.is_closed());
        assert!(matches!(
            registry.create_process(argv(&["true"])),
            Err(ProcessError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn cancel_supervisors_stops_processes() {
        let registry = registry();
        let id = registry.create_process(argv(&["sleep", "30"])).unwrap();
        wait_running(&registry, id).await;

        registry.cancel_supervisors();
        assert_eq!(wait_terminal(&registry, id).await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn drain_kills_processes_ignoring_stop() {
        let mut config = test_config();
        config.supervisor.kill_timeout = None;
        let registry = ProcessRegistry::new(config).unwrap();
        let id = registry
            .create_process(argv(&["sh", "-c", "trap '' HUP; echo ready; exec sleep 30"]))
            .unwrap();
        let record = registry.lookup_by_id(id).unwrap();
        let mut output = record.subscribe_output();
        while !record.read_output(0).starts_with(b"ready") {
            let _ = output.recv().await;
        }

        assert_eq!(registry.for_each_stop(), 1);
        tokio::time::timeout(
            Duration::from_secs(10),
            registry.drain(Duration::from_millis(200)),
        )
        .await
        .expect("drain hung");
        assert!(registry.is_empty());
        // Killed and reaped by its supervisor, so the exit is recorded.
        assert_eq!(record.state(), ProcessState::Stopped);
        assert_eq!(record.info().exit_signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn dropped_remove_keeps_record_removable() {
        let registry = registry();
        let id = registry.create_process(argv(&["sleep", "30"])).unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(300), registry.remove(id)).await;
        assert!(pending.is_err());
        assert!(registry.lookup_by_id(id).is_some());
        assert_eq!(registry.len(), 1);

        registry.stop_process(id).unwrap();
        tokio::time::timeout(Duration::from_secs(10), registry.remove(id))
            .await
            .expect("remove hung")
            .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drain_empties_registry_after_dropped_remove() {
        let registry = registry();
        let id = registry.create_process(argv(&["sleep", "30"])).unwrap();
        wait_running(&registry, id).await;
        let record = registry.lookup_by_id(id).unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(100), registry.remove(id)).await;
        assert!(pending.is_err());

        tokio::time::timeout(
            Duration::from_secs(10),
            registry.drain(Duration::from_millis(200)),
        )
        .await
        .expect("drain hung");
        assert!(registry.is_empty());
        assert_eq!(record.state(), ProcessState::Stopped);
        assert_eq!(record.info().exit_signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn stop_before_running_takes_effect() {
        let registry = registry();
        let id = registry.create_process(argv(&["sleep", "30"])).unwrap();
        registry.stop_process(id).unwrap();

        assert_eq!(wait_terminal(&registry, id).await, ProcessState::Stopped);
        assert_eq!(registry.get_state(id).unwrap().exit_signal, Some(libc::SIGHUP));
        registry.remove(id).await.unwrap();
        assert!(registry.is_empty());
    }
}
