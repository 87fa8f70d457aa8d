//! Process management HTTP handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use tfmux_protocol::{
    CreateProcessRequest, CreateProcessResponse, ListProcessesResponse, WriteInputRequest, sse,
};
use tokio::sync::{OwnedSemaphorePermit, broadcast, watch};
use tracing::{debug, info};

use crate::handlers::problem_details;
use crate::process::{ProcessError, ProcessId, ProcessRecord, ProcessState};
use crate::server::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    /// Most recent bytes to return; 0 or absent for the whole buffer.
    #[serde(default)]
    max_bytes: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/processes
pub async fn list_processes(State(state): State<AppState>) -> Json<ListProcessesResponse> {
    Json(ListProcessesResponse {
        processes: state.registry.list_processes(),
    })
}

/// POST /api/v1/processes
pub async fn create_process(
    State(state): State<AppState>,
    Json(req): Json<CreateProcessRequest>,
) -> Response {
    let id = match state.registry.create_process(req.argv) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    info!(id = %id, "Process created");

    let process_state = state
        .registry
        .lookup_by_id(id)
        .map(|r| r.state())
        .unwrap_or(ProcessState::Created);
    (
        StatusCode::CREATED,
        Json(CreateProcessResponse {
            id: id.get(),
            state: process_state,
        }),
    )
        .into_response()
}

/// GET /api/v1/processes/{id}
pub async fn get_process(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.registry.get_state(ProcessId::new(id)) {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/v1/processes/{id}
///
/// Stops the process, waits for it to exit and forgets it.
pub async fn delete_process(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    let id = ProcessId::new(id);
    if let Err(e) = state.registry.stop_process(id) {
        return error_response(e);
    }
    match state.registry.remove(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/v1/processes/{id}/stop
pub async fn stop_process(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    let id = ProcessId::new(id);
    if let Err(e) = state.registry.stop_process(id) {
        return error_response(e);
    }
    match state.registry.get_state(id) {
        Ok(info) => (StatusCode::ACCEPTED, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/v1/processes/{id}/output?max_bytes=N
pub async fn read_output(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<OutputQuery>,
) -> Response {
    match state.registry.read_output(ProcessId::new(id), query.max_bytes) {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Bytes::from(bytes),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/v1/processes/{id}/input
pub async fn write_input(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<WriteInputRequest>,
) -> Response {
    if state.registry.settings().read_only {
        return problem_details::forbidden("terminals are read-only").into_response();
    }
    match state
        .registry
        .write_input(ProcessId::new(id), req.data.as_bytes())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/v1/processes/{id}/stream
///
/// Server-Sent Events:
/// - `replay`: the retained output, base64
/// - `output`: each new chunk, base64
/// - `lagged`: number of chunks this viewer missed
/// - `exit`: final `ProcessInfo`, after which the stream ends
///
/// With `max_clients` set, viewers beyond the cap get 503 until a stream ends.
pub async fn stream_output(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    let id = ProcessId::new(id);
    let Some(record) = state.registry.lookup_by_id(id) else {
        return error_response(ProcessError::NotFound(id));
    };
    let permit = match state.viewers {
        Some(viewers) => match viewers.try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                debug!(id = %id, "Viewer limit reached");
                return problem_details::service_unavailable("too many viewers attached")
                    .into_response();
            }
        },
        None => None,
    };
    debug!(id = %id, "Viewer attached");

    Sse::new(output_events(record, permit))
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ============================================================================
// SSE
// ============================================================================

struct Viewer {
    record: Arc<ProcessRecord>,
    output: broadcast::Receiver<Bytes>,
    states: watch::Receiver<ProcessState>,
    done: bool,
    /// Released when the stream ends or the client goes away.
    _permit: Option<OwnedSemaphorePermit>,
}

fn output_events(
    record: Arc<ProcessRecord>,
    permit: Option<OwnedSemaphorePermit>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (replay, output) = record.replay_and_subscribe(0);
    let states = record.subscribe_state();
    let viewer = Viewer {
        record,
        output,
        states,
        done: false,
        _permit: permit,
    };

    let replay = Event::default()
        .event(sse::REPLAY)
        .data(STANDARD.encode(&replay));

    stream::once(async move { replay })
        .chain(stream::unfold(viewer, next_event))
        .map(Ok)
}

async fn next_event(mut viewer: Viewer) -> Option<(Event, Viewer)> {
    if viewer.done {
        return None;
    }

    // Output is flushed before the exit is recorded, so once the output
    // channel is idle and the state is final nothing more can arrive.
    let event = tokio::select! {
        biased;
        chunk = viewer.output.recv() => match chunk {
            Ok(chunk) => Event::default().event(sse::OUTPUT).data(STANDARD.encode(&chunk)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Event::default().event(sse::LAGGED).data(missed.to_string())
            }
            Err(broadcast::error::RecvError::Closed) => {
                viewer.done = true;
                exit_event(&viewer.record)
            }
        },
        _ = viewer.states.wait_for(|s| s.is_terminal()) => {
            viewer.done = true;
            exit_event(&viewer.record)
        }
    };
    Some((event, viewer))
}

fn exit_event(record: &ProcessRecord) -> Event {
    match Event::default().event(sse::EXIT).json_data(record.info()) {
        Ok(event) => event,
        Err(_) => Event::default()
            .event(sse::EXIT)
            .data(record.state().as_str()),
    }
}

// ============================================================================
// Errors
// ============================================================================

fn error_response(err: ProcessError) -> Response {
    match err {
        ProcessError::NotFound(_) => problem_details::not_found(err.to_string()),
        ProcessError::EmptyCommand => problem_details::bad_request(err.to_string()),
        ProcessError::ShuttingDown => problem_details::service_unavailable(err.to_string()),
        ProcessError::NotRunning | ProcessError::NoStdin => {
            problem_details::conflict(err.to_string())
        }
        ProcessError::WorkerStart(_)
        | ProcessError::InvalidTransition { .. }
        | ProcessError::Io(_) => problem_details::internal_error(err.to_string()),
    }
    .into_response()
}
