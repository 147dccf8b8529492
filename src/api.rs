//! HTTP and WebSocket surface: trigger runs, poll their status, and tap in
//! to a live progress stream.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::jobs::ScheduledJob;
use crate::normalize::normalize_error;
use crate::stream::ProgressEvent;
use crate::workflow::Orchestrator;

const DEFAULT_RUN_LIMIT: u32 = 20;
const MAX_RUN_LIMIT: u32 = 200;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Frames sent to a stream subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Event { event: ProgressEvent },
    /// The channel ended; no more events will follow.
    End,
    /// Nothing live or stored under this stream id.
    Unavailable { stream_id: String },
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    /// Run to completion before responding.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
}

/// Build the Axum router for the job API.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{job_id}", get(get_job))
        .route("/api/jobs/{job_id}/run", post(run_job))
        .route("/api/jobs/{job_id}/runs", get(list_runs))
        .route("/api/runs/{run_id}", get(get_run))
        .route("/api/runs/{run_id}/notifications", get(list_notifications))
        .route("/ws/streams/{stream_id}", get(ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_job(
    State(state): State<ApiState>,
    Json(body): Json<CreateJobRequest>,
) -> impl IntoResponse {
    if body.name.trim().is_empty() || body.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "name and prompt are required"})),
        );
    }

    let mut job = ScheduledJob::new(
        body.user_id.unwrap_or_else(|| "default".to_string()),
        body.name.trim(),
        body.prompt,
    );
    if let Some(schedule) = body.schedule.filter(|s| !s.trim().is_empty()) {
        job = match job.with_schedule(schedule.trim()) {
            Ok(job) => job,
            Err(e) => return error_response(&e.into()),
        };
    }
    if let Some(notes) = body.notes {
        job = job.with_notes(notes);
    }
    job.enabled = body.enabled.unwrap_or(true);

    match state.orchestrator.db().create_job(&job).await {
        Ok(()) => {
            info!(job_id = %job.id, name = %job.name, "Job created via API");
            (StatusCode::CREATED, Json(serde_json::json!(job)))
        }
        Err(e) => error_response(&e.into()),
    }
}

async fn list_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    match state.orchestrator.db().list_jobs().await {
        Ok(jobs) => (StatusCode::OK, Json(serde_json::json!(jobs))),
        Err(e) => error_response(&e.into()),
    }
}

async fn get_job(State(state): State<ApiState>, Path(job_id): Path<Uuid>) -> impl IntoResponse {
    match state.orchestrator.db().get_job(job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(serde_json::json!(job))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Job not found", "code": "not_found"})),
        ),
        Err(e) => error_response(&e.into()),
    }
}

async fn run_job(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<RunQuery>,
) -> impl IntoResponse {
    if query.wait {
        return match state.orchestrator.run_job(job_id).await {
            Ok(result) => (StatusCode::OK, Json(serde_json::json!(result))),
            Err(e) => error_response(&e),
        };
    }

    // Reject unknown jobs up front; everything else surfaces on the run record.
    match state.orchestrator.db().get_job(job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "Job not found", "code": "not_found"})),
            );
        }
        Err(e) => return error_response(&e.into()),
    }

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run_job(job_id).await {
            warn!(job_id = %job_id, error = %e, "Manual run failed");
        }
    });
    info!(job_id = %job_id, "Manual run accepted");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted", "job_id": job_id})),
    )
}

async fn list_runs(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match state.orchestrator.list_runs(job_id, limit).await {
        Ok(runs) => (StatusCode::OK, Json(serde_json::json!(runs))),
        Err(e) => error_response(&e),
    }
}

async fn get_run(State(state): State<ApiState>, Path(run_id): Path<Uuid>) -> impl IntoResponse {
    match state.orchestrator.get_run_status(run_id).await {
        Ok(view) => (StatusCode::OK, Json(serde_json::json!(view))),
        Err(e) => error_response(&e),
    }
}

async fn list_notifications(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.orchestrator.activities().runs().notifications(run_id).await {
        Ok(notifications) => (StatusCode::OK, Json(serde_json::json!(notifications))),
        Err(e) => error_response(&e),
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err.code() {
        "not_found" => StatusCode::NOT_FOUND,
        "job_disabled" | "stream_conflict" | "invalid_transition" => StatusCode::CONFLICT,
        "invalid_schedule" | "config_invalid" | "database_constraint" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let detail = normalize_error(err);
    (
        status_for(err),
        Json(serde_json::json!({"error": detail.message, "code": err.code()})),
    )
}

// ── Stream tap-in ───────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(stream_id): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    info!(stream_id = %stream_id, "Stream subscriber connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, stream_id))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState, stream_id: String) {
    let mut reader = match state.orchestrator.streams().attach(&stream_id).await {
        Ok(reader) => reader,
        Err(e) => {
            debug!(stream_id = %stream_id, error = %e, "Stream unavailable");
            let _ = send_frame(&mut socket, &StreamFrame::Unavailable { stream_id }).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            event = reader.next() => {
                let frame = match event {
                    Some(event) => StreamFrame::Event { event },
                    None => {
                        let _ = send_frame(&mut socket, &StreamFrame::End).await;
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                };
                if send_frame(&mut socket, &frame).await.is_err() {
                    debug!(stream_id = %stream_id, "Subscriber disconnected during send");
                    break;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(stream_id = %stream_id, "Subscriber disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(stream_id = %stream_id, error = %e, "Stream WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(stream_id = %stream_id, "Stream subscriber closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}
