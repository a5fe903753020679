//! API handlers.
//!
//! Sync and status handlers go through the `SyncRegistry`; exec handlers
//! through the `ExecRouter`. Every response uses the same JSON envelope.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crm_core::{CloudletKey, ExecRequest, ObjectKind};
use crm_orchestrator::{ExecSession, OrchestratorError};
use crm_state::{StateError, SyncMessage};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotAccepted(_) => StatusCode::FORBIDDEN,
        StateError::UnknownKind(_) | StateError::Deserialize(_) => StatusCode::BAD_REQUEST,
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Sync ───────────────────────────────────────────────────────

/// A single message or an ordered batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SyncBody {
    Batch(Vec<SyncMessage>),
    One(SyncMessage),
}

#[derive(Serialize)]
struct Applied {
    applied: usize,
}

/// POST /api/v1/sync
pub async fn sync(State(state): State<ApiState>, Json(body): Json<SyncBody>) -> Response {
    let msgs = match body {
        SyncBody::Batch(msgs) => msgs,
        SyncBody::One(msg) => vec![msg],
    };
    match state.registry.apply_all(msgs) {
        Ok(applied) => {
            debug!(applied, "sync batch applied");
            ApiResponse::ok(Applied { applied }).into_response()
        }
        Err(e) => {
            warn!(error = %e, "sync rejected");
            state_error(&e)
        }
    }
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status/{kind}
pub async fn status(State(state): State<ApiState>, Path(kind): Path<ObjectKind>) -> Response {
    match state.registry.snapshot(kind) {
        Ok(objects) => ApiResponse::ok(objects).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/counts
pub async fn counts(State(state): State<ApiState>) -> impl IntoResponse {
    let counts: BTreeMap<String, usize> = state
        .registry
        .counts()
        .into_iter()
        .map(|(kind, n)| (kind.to_string(), n))
        .collect();
    ApiResponse::ok(counts)
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CloudletCounts {
    pub app_insts: usize,
    pub cluster_insts: usize,
}

/// GET /api/v1/cloudlets/{org}/{name}/counts
pub async fn cloudlet_counts(
    State(state): State<ApiState>,
    Path((org, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = CloudletKey::new(&org, &name);
    ApiResponse::ok(CloudletCounts {
        app_insts: state.caches.app_insts.count_for_cloudlet(&key),
        cluster_insts: state.caches.cluster_insts.count_for_cloudlet(&key),
    })
}

// ── Exec ───────────────────────────────────────────────────────

/// Output of an exec session, filled in once the session ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecOutput {
    pub finished: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Outputs = Arc<Mutex<HashMap<String, ExecOutput>>>;

/// POST /api/v1/exec
///
/// The session gets no stdin; its output is collected in the background
/// and read back with `GET /api/v1/exec/{id}`.
pub async fn start_exec(State(state): State<ApiState>, Json(req): Json<ExecRequest>) -> Response {
    match state.exec.handle(req).await {
        Ok((answered, session)) => {
            state
                .outputs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session.id.clone(), ExecOutput::default());
            tokio::spawn(collect(state.outputs.clone(), session));
            (StatusCode::CREATED, ApiResponse::ok(answered)).into_response()
        }
        Err(e) => {
            let status = match &e {
                OrchestratorError::Inactive => StatusCode::SERVICE_UNAVAILABLE,
                OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                OrchestratorError::Platform(_) | OrchestratorError::Invalid(_) | OrchestratorError::Unsupported(_) => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(&e.to_string(), status).into_response()
        }
    }
}

async fn collect(outputs: Outputs, session: ExecSession) {
    let ExecSession {
        id,
        mut stdin,
        mut stdout,
        mut stderr,
        finished,
    } = session;
    let _ = stdin.shutdown().await;
    let (mut out, mut err) = (Vec::new(), Vec::new());
    let _ = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
    let error = match finished.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) if e.is_cancelled() => Some("session closed".to_string()),
        Err(e) => Some(e.to_string()),
    };
    info!(session = %id, failed = error.is_some(), "exec output collected");
    outputs.lock().unwrap_or_else(PoisonError::into_inner).insert(
        id,
        ExecOutput {
            finished: true,
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            error,
        },
    );
}

/// GET /api/v1/exec/{id}
pub async fn exec_output(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let output = state
        .outputs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned();
    match output {
        Some(output) => ApiResponse::ok(output).into_response(),
        None => error_response("exec session not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// DELETE /api/v1/exec/{id}
pub async fn close_exec(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if state.exec.close(&id) {
        return ApiResponse::ok("closed").into_response();
    }
    let known = state
        .outputs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
        .is_some();
    if known {
        ApiResponse::ok("already finished").into_response()
    } else {
        error_response("exec session not found", StatusCode::NOT_FOUND).into_response()
    }
}
