//! crm-api — the CRM's HTTP surface.
//!
//! The controller pushes desired state in, reads status back, and opens
//! exec sessions into AppInsts.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/sync` | Apply one `SyncMessage` or a batch |
//! | GET | `/api/v1/status/{kind}` | Snapshot of any registered cache |
//! | GET | `/api/v1/counts` | Object counts per kind |
//! | GET | `/api/v1/cloudlets/{org}/{name}/counts` | AppInst and ClusterInst counts for one cloudlet |
//! | POST | `/api/v1/exec` | Start an exec session, returns its answer |
//! | GET | `/api/v1/exec/{id}` | Collected output of a session |
//! | DELETE | `/api/v1/exec/{id}` | Close a running session |
//! | GET | `/healthz` | Liveness |
//!
//! With an access key configured, every `/api/v1` route requires a
//! matching `x-access-key` header.

pub mod handlers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use crm_orchestrator::ExecRouter;
use crm_state::{CacheSet, SyncRegistry};

pub use handlers::{ExecOutput, SyncBody};

pub const ACCESS_KEY_HEADER: &str = "x-access-key";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub caches: CacheSet,
    pub registry: SyncRegistry,
    pub exec: ExecRouter,
    pub access_key: Option<String>,
    pub(crate) outputs: Arc<Mutex<HashMap<String, ExecOutput>>>,
}

impl ApiState {
    pub fn new(caches: CacheSet, exec: ExecRouter) -> Self {
        Self {
            registry: caches.registry(),
            caches,
            exec,
            access_key: None,
            outputs: Arc::default(),
        }
    }

    pub fn with_access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/sync", post(handlers::sync))
        .route("/status/{kind}", get(handlers::status))
        .route("/counts", get(handlers::counts))
        .route("/cloudlets/{org}/{name}/counts", get(handlers::cloudlet_counts))
        .route("/exec", post(handlers::start_exec))
        .route("/exec/{id}", get(handlers::exec_output).delete(handlers::close_exec))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_access_key))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(|| async { "ok" }))
}

async fn require_access_key(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.access_key {
        let given = req
            .headers()
            .get(ACCESS_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected.as_str()) {
            return handlers::error_response("invalid access key", StatusCode::UNAUTHORIZED).into_response();
        }
    }
    next.run(req).await
}
