//! Per-process supervisor tasks.
//!
//! Each record gets a dedicated tokio task that spawns the command, pumps
//! its output into the record, delivers stop signals and waits for exit.
//! The task owns the `Child`, so the process is reaped exactly once and a
//! stop signal can never reach a recycled pid.

use std::pin::pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::record::Exit;
use super::{ProcessError, ProcessRecord};
use crate::signal::Signal;

/// Read size for stdout/stderr pumps.
const READ_CHUNK: usize = 8 * 1024;

/// How long to keep draining pipes after the child exited.
///
/// Grandchildren may inherit the pipes and keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Spawn parameters shared by every supervisor of a registry.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Value of `TERM` in the child environment.
    pub terminal_type: String,
    /// Signal sent when the registry is shutting down.
    pub termination_signal: Signal,
    /// Escalate to SIGKILL this long after a stop signal. `None` waits forever.
    pub kill_timeout: Option<Duration>,
}

/// Requests the registry can make of a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorControl {
    /// Stop with the configured termination signal. Honoured even when
    /// cancelled before the process finished starting.
    pub stop: CancellationToken,
    /// SIGKILL the process. The supervisor still reaps it and records the exit.
    pub kill: CancellationToken,
}

impl SupervisorControl {
    pub fn new(stop: CancellationToken) -> Self {
        Self {
            stop,
            kill: CancellationToken::new(),
        }
    }
}

/// Start the supervisor task for `record`.
///
/// Fails only when there is no tokio runtime to run the task on; the
/// record is left untouched in that case.
pub fn spawn_supervisor(
    record: Arc<ProcessRecord>,
    config: SupervisorConfig,
    control: SupervisorControl,
) -> Result<JoinHandle<()>, ProcessError> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| ProcessError::WorkerStart(e.to_string()))?;
    Ok(runtime.spawn(supervise(record, config, control)))
}

async fn supervise(
    record: Arc<ProcessRecord>,
    config: SupervisorConfig,
    control: SupervisorControl,
) {
    let id = record.id();
    let (stop_tx, stop_rx) = oneshot::channel();
    if let Err(e) = record.begin_start(stop_tx) {
        warn!(id = %id, error = %e, "Supervisor started on a used record");
        return;
    }

    let mut child = match build_command(&record, &config).spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(id = %id, command = %record.command(), error = %e, "Failed to spawn process");
            record.mark_spawn_failed(format!("failed to spawn '{}': {}", record.argv()[0], e));
            return;
        }
    };

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    if let Err(e) = record.mark_running(pid, stdin).await {
        warn!(id = %id, error = %e, "Could not mark process running");
    }
    info!(id = %id, ?pid, command = %record.command(), "Process started");

    let capture = async {
        tokio::join!(pump(record.clone(), stdout), pump(record.clone(), stderr));
    };
    let mut capture = pin!(capture);
    let mut capture_done = false;

    let mut stop_rx = stop_rx;
    let mut stop_pending = true;
    let mut stop_seen = false;
    let mut kill_seen = false;
    let mut kill_deadline: Option<Instant> = None;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut capture, if !capture_done => {
                capture_done = true;
            }
            signal = &mut stop_rx, if stop_pending => {
                stop_pending = false;
                if let Ok(signal) = signal {
                    deliver(&record, &child, signal);
                    kill_deadline = config.kill_timeout.map(|t| Instant::now() + t);
                }
            }
            _ = control.stop.cancelled(), if !stop_seen => {
                stop_seen = true;
                // Lands on `stop_rx` if the record is still running.
                record.request_stop(config.termination_signal);
            }
            _ = control.kill.cancelled(), if !kill_seen => {
                kill_seen = true;
                kill_deadline = None;
                // Moves a running record to `Stopping` so the kill is recorded as a stop.
                record.request_stop(Signal::KILL);
                warn!(id = %id, ?pid, "Killing process");
                force_kill(&record, &mut child);
            }
            _ = sleep_until(kill_deadline), if kill_deadline.is_some() => {
                kill_deadline = None;
                warn!(id = %id, ?pid, "Process ignored stop signal, sending SIGKILL");
                force_kill(&record, &mut child);
            }
        }
    };

    // Child is reaped; collect whatever is still in the pipes.
    if !capture_done && tokio::time::timeout(DRAIN_TIMEOUT, &mut capture).await.is_err() {
        debug!(id = %id, "Output pipes still open after exit, detaching");
    }

    let exit = match status {
        Ok(status) => exit_from_status(status),
        Err(e) => Exit::WaitFailed(e.to_string()),
    };
    let state = record.mark_exited(exit.clone()).await;
    info!(id = %id, ?pid, exit = ?exit, state = %state, "Process exited");
}

/// Send `signal` to the child if it has not been reaped.
fn deliver(record: &ProcessRecord, child: &Child, signal: Signal) {
    // `Child::id` is `None` once the child was reaped, so the pid is never stale.
    let Some(pid) = child.id() else {
        return;
    };
    debug!(id = %record.id(), pid, signal = %signal, "Sending stop signal");
    if let Err(e) = signal.send(pid) {
        warn!(id = %record.id(), pid, error = %e, "Failed to signal process");
    }
}

fn force_kill(record: &ProcessRecord, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(id = %record.id(), error = %e, "Failed to kill process");
    }
}

/// Sleep until `deadline`, or forever without one.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn exit_from_status(status: ExitStatus) -> Exit {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => Exit::Code(code),
        (None, Some(signal)) => Exit::Signaled(signal),
        (None, None) => Exit::Code(-1),
    }
}

fn build_command(record: &ProcessRecord, config: &SupervisorConfig) -> Command {
    let argv = record.argv();
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env("TERM", &config.terminal_type);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Aborting the supervisor task kills the child instead of leaking it.
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs in the forked child before exec. PR_SET_PDEATHSIG
    // configures the child to receive SIGTERM when the parent dies. This is safe
    // because we're in the pre-exec callback with no shared mutable state.
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd
}

/// Copy a pipe into the record until EOF or a read error.
async fn pump<R>(record: Arc<ProcessRecord>, pipe: Option<R>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => record.append_output(&buf[..n]),
            Err(e) => {
                debug!(id = %record.id(), error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}
