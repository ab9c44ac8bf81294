use crate::agents::artifacts::ArtifactManager;
use crate::agents::cycle::CycleContext;
use crate::agents::mailbox::MailboxStore;
use crate::agents::runner::RunnerShared;
use crate::models::{TradingError, TradingResult};
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// HTTP surface of the learning-loop runner. Reads are open; override
/// endpoints require the shared `x-api-key` header.
pub struct AgentApiServer {
    state: Arc<AgentApiState>,
    host: String,
    port: u16,
}

pub struct AgentApiState {
    pub shared: Arc<RunnerShared>,
    pub artifacts: Arc<ArtifactManager>,
    pub mailboxes: Arc<MailboxStore>,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
struct InjectRequest {
    note: String,
}

impl AgentApiServer {
    pub fn new(state: AgentApiState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            host: host.into(),
            port,
        }
    }

    pub fn router(state: Arc<AgentApiState>) -> Router {
        let overrides = Router::new()
            .route("/override/pause", post(override_pause))
            .route("/override/abort", post(override_abort))
            .route("/override/force-cycle", post(override_force_cycle))
            .route("/override/inject", post(override_inject))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                require_api_key,
            ));

        Router::new()
            .route("/status", get(get_status))
            .route("/cycles", get(get_cycles))
            .route("/cycles/:id", get(get_cycle))
            .route("/errors", get(get_errors))
            .route("/mailboxes", get(get_mailboxes))
            .merge(overrides)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
    }

    pub async fn serve(self) -> TradingResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TradingError::NetworkError(format!("bind {}: {}", addr, e)))?;
        info!("🌐 Agent-runner API listening on http://{}", addr);
        axum::serve(listener, Self::router(self.state))
            .await
            .map_err(|e| TradingError::NetworkError(format!("agent API server: {}", e)))?;
        Ok(())
    }
}

async fn require_api_key(
    State(state): State<Arc<AgentApiState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.api_key.is_empty() {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(state.api_key.as_str()) {
            warn!("Rejected override call without valid x-api-key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(request).await
}

async fn get_status(State(state): State<Arc<AgentApiState>>) -> impl IntoResponse {
    let current = state.shared.current.read().await.clone();
    let last_completed = *state.shared.last_completed_at.read().await;
    Json(serde_json::json!({
        "state": current.as_ref().map(|c| c.current_state.to_string()).unwrap_or_else(|| "idle".to_string()),
        "cycle_id": current.as_ref().map(|c| c.cycle_id.clone()),
        "paused": current.as_ref().map(|c| c.paused).unwrap_or(false),
        "restart_count": current.as_ref().map(|c| c.restart_count).unwrap_or(0),
        "is_stalled": current.as_ref().map(|c| c.is_stalled).unwrap_or(false),
        "last_completed_at": last_completed,
    }))
}

async fn get_cycles(State(state): State<Arc<AgentApiState>>) -> impl IntoResponse {
    let cycles: Vec<serde_json::Value> = state
        .artifacts
        .list_cycles()
        .into_iter()
        .map(|id| {
            let completed = state
                .artifacts
                .read_artifact(&id, "strategy.json")
                .is_some();
            serde_json::json!({ "cycle_id": id, "completed": completed })
        })
        .collect();
    Json(cycles)
}

async fn get_cycle(
    State(state): State<Arc<AgentApiState>>,
    Path(id): Path<String>,
) -> Response {
    if id.contains('/') || id.contains("..") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let dir = state.artifacts.cycle_dir(&id);
    if !dir.exists() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let context = CycleContext::load(&dir).ok().flatten();
    let artifacts: Vec<String> = ["plan.md", "research.md", "analysis.md", "strategy.json", "evaluation.md"]
        .iter()
        .filter(|name| state.artifacts.read_artifact(&id, name).is_some())
        .map(|s| s.to_string())
        .collect();
    Json(serde_json::json!({
        "cycle_id": id,
        "context": context,
        "artifacts": artifacts,
    }))
    .into_response()
}

async fn get_errors(State(state): State<Arc<AgentApiState>>) -> impl IntoResponse {
    Json(state.shared.errors.read().await.clone())
}

async fn get_mailboxes(State(state): State<Arc<AgentApiState>>) -> impl IntoResponse {
    Json(state.mailboxes.read_all())
}

async fn override_pause(State(state): State<Arc<AgentApiState>>) -> impl IntoResponse {
    info!("⏸️ Pause requested via API");
    state.shared.pause_requested.store(true, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn override_abort(State(state): State<Arc<AgentApiState>>) -> impl IntoResponse {
    warn!("⛔ Abort requested via API");
    state.shared.abort_requested.store(true, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn override_force_cycle(State(state): State<Arc<AgentApiState>>) -> impl IntoResponse {
    info!("⚡ Force-cycle requested via API");
    state.shared.force_cycle.notify_one();
    StatusCode::NO_CONTENT
}

async fn override_inject(
    State(state): State<Arc<AgentApiState>>,
    Json(body): Json<InjectRequest>,
) -> Response {
    if body.note.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "note must not be empty").into_response();
    }
    info!("💬 Operator note injected");
    state.shared.injected_notes.write().await.push(body.note);
    StatusCode::NO_CONTENT.into_response()
}
