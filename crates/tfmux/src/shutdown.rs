//! Signal-driven shutdown.
//!
//! The first SIGINT/SIGTERM stops every supervised process and releases the
//! HTTP event loop. A second signal while that is in progress exits at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::ProcessRegistry;

/// Outcome of [`ShutdownOrchestrator::shutdown_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// This call began shutdown and asked `signalled` processes to stop.
    Started { signalled: usize },
    /// Shutdown was already under way; nothing was done.
    AlreadyShuttingDown,
}

struct Inner {
    shutting_down: AtomicBool,
    registry: ProcessRegistry,
    event_loop: CancellationToken,
}

/// Coordinates a single shutdown episode across the registry and server.
#[derive(Clone)]
pub struct ShutdownOrchestrator {
    inner: Arc<Inner>,
}

impl ShutdownOrchestrator {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                shutting_down: AtomicBool::new(false),
                registry,
                event_loop: CancellationToken::new(),
            }),
        }
    }

    /// Stop every running process and release the event loop.
    ///
    /// Only the first call does anything, so no process is signalled twice.
    pub fn shutdown_all(&self) -> ShutdownPhase {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownPhase::AlreadyShuttingDown;
        }

        let registry = &self.inner.registry;
        registry.close();
        let signalled = registry.for_each_stop();
        // Catches records that were still starting when we walked the map.
        registry.cancel_supervisors();
        self.inner.event_loop.cancel();

        info!(signalled, "Shutdown started");
        ShutdownPhase::Started { signalled }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Token cancelled once shutdown starts; bind the server's graceful
    /// shutdown to it.
    pub fn event_loop_token(&self) -> CancellationToken {
        self.inner.event_loop.clone()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    /// Drive shutdown from OS signals. Meant to be spawned as its own task.
    pub async fn listen(self) {
        let name = wait_for_signal().await;
        info!(signal = name, "Received signal, shutting down...");
        self.shutdown_all();

        let name = wait_for_signal().await;
        warn!(signal = name, "Received second signal, exiting immediately");
        std::process::exit(1);
    }
}

impl std::fmt::Debug for ShutdownOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownOrchestrator")
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Resolve on the next SIGINT or SIGTERM, returning its name.
async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
