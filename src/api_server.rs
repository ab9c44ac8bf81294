use crate::execution::{OperationModeController, PositionRegistry, SafeModeController};
use crate::models::{TradingError, TradingResult};
use crate::strategy::StrategyService;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Operator HTTP surface for the execution engine.
///
/// Reads are open; mutating endpoints require the shared `x-api-key`
/// header. GETs always succeed and report safe_mode, strategy_state, and
/// strategy_id even during incidents.
pub struct ApiServer {
    state: Arc<OperatorState>,
    host: String,
    port: u16,
}

pub struct OperatorState {
    pub strategy: Arc<StrategyService>,
    pub registry: Arc<PositionRegistry>,
    pub safe_mode: Arc<SafeModeController>,
    pub mode: Arc<OperationModeController>,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
struct SafeModeRequest {
    reason: String,
}

#[derive(Debug, Deserialize, Default)]
struct ModeRequest {
    #[serde(default)]
    note: Option<String>,
}

impl ApiServer {
    pub fn new(state: OperatorState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            host: host.into(),
            port,
        }
    }

    pub fn router(state: Arc<OperatorState>) -> Router {
        let protected = Router::new()
            .route("/safe-mode/activate", post(activate_safe_mode))
            .route("/safe-mode/clear", post(clear_safe_mode))
            .route("/mode/live", post(mode_live))
            .route("/mode/paper", post(mode_paper))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                require_api_key,
            ));

        Router::new()
            .route("/status", get(get_status))
            .route("/strategy", get(get_strategy))
            .route("/positions", get(get_positions))
            .merge(protected)
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
        info!("🌐 Operator API listening on http://{}", addr);

        axum::serve(listener, Self::router(self.state))
            .await
            .map_err(|e| TradingError::NetworkError(format!("operator API server: {}", e)))?;
        Ok(())
    }
}

/// Shared-secret check for mutating endpoints. An empty configured key
/// disables the check (paper/dev default).
async fn require_api_key(
    State(state): State<Arc<OperatorState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.api_key.is_empty() {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(state.api_key.as_str()) {
            warn!("Rejected operator call without valid x-api-key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(request).await
}

async fn get_status(State(state): State<Arc<OperatorState>>) -> impl IntoResponse {
    let snapshot = state.strategy.snapshot().await;
    Json(serde_json::json!({
        "mode": state.mode.mode().to_string(),
        "safe_mode": state.safe_mode.is_active(),
        "strategy_state": snapshot.state.to_string(),
        "strategy_id": snapshot.document.as_ref().map(|d| d.id.clone()),
    }))
}

async fn get_strategy(State(state): State<Arc<OperatorState>>) -> Response {
    match state.strategy.snapshot().await.document {
        Some(document) => Json(document.as_ref().clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_positions(State(state): State<Arc<OperatorState>>) -> impl IntoResponse {
    Json(state.registry.open_positions().await)
}

async fn activate_safe_mode(
    State(state): State<Arc<OperatorState>>,
    Json(body): Json<SafeModeRequest>,
) -> Response {
    if body.reason.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "reason must not be empty").into_response();
    }
    state.safe_mode.activate(&body.reason);
    StatusCode::NO_CONTENT.into_response()
}

async fn clear_safe_mode(State(state): State<Arc<OperatorState>>) -> impl IntoResponse {
    state.safe_mode.clear();
    StatusCode::NO_CONTENT
}

async fn mode_live(
    State(state): State<Arc<OperatorState>>,
    body: Option<Json<ModeRequest>>,
) -> impl IntoResponse {
    let note = body.and_then(|Json(b)| b.note);
    state.mode.set_live(note.as_deref());
    StatusCode::NO_CONTENT
}

async fn mode_paper(
    State(state): State<Arc<OperatorState>>,
    body: Option<Json<ModeRequest>>,
) -> impl IntoResponse {
    let note = body.and_then(|Json(b)| b.note);
    state.mode.set_paper(note.as_deref());
    StatusCode::NO_CONTENT
}
