//! Common test utilities.

#![allow(dead_code)]

use std::time::Duration;

use axum::Router;

use tfmux::process::supervisor::SupervisorConfig;
use tfmux::process::{ProcessId, ProcessRegistry, ProcessState, RegistryConfig};
use tfmux::server::{self, AppState};
use tfmux::shutdown::ShutdownOrchestrator;
use tfmux::signal::Signal;
use tfmux_protocol::TerminalSettings;

/// Create a test app with an empty registry.
pub fn test_app() -> (Router, AppState) {
    test_app_with(TerminalSettings::default())
}

/// Create a test app whose registry exposes `settings`.
pub fn test_app_with(settings: TerminalSettings) -> (Router, AppState) {
    let registry = ProcessRegistry::new(RegistryConfig {
        buffer_capacity: 4096,
        supervisor: SupervisorConfig {
            terminal_type: settings.terminal_type.clone(),
            termination_signal: Signal::HUP,
            kill_timeout: Some(Duration::from_secs(5)),
        },
        settings,
        credential: None,
    })
    .unwrap();
    let state = AppState::new(ShutdownOrchestrator::new(registry));
    (server::build_app(state.clone(), 30), state)
}

/// Wait until process `id` reaches `Stopped` or `Crashed`.
pub async fn wait_terminal(state: &AppState, id: u64) -> ProcessState {
    let record = state.registry.lookup_by_id(ProcessId::new(id)).unwrap();
    tokio::time::timeout(Duration::from_secs(10), record.wait_terminal())
        .await
        .expect("process never exited")
}

/// Wait until process `id` is running.
pub async fn wait_running(state: &AppState, id: u64) {
    let record = state.registry.lookup_by_id(ProcessId::new(id)).unwrap();
    let mut states = record.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|s| *s == ProcessState::Running),
    )
    .await
    .expect("process never started")
    .unwrap();
}

/// Parse SSE events from a response body.
pub fn parse_sse_events(body: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in body.lines() {
        if let Some(event_name) = line.strip_prefix("event:") {
            current_event = event_name.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            current_data = data.trim().to_string();
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((current_event.clone(), current_data.clone()));
            current_event.clear();
            current_data.clear();
        }
    }

    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}
