// =============================================================================
// Admin REST surface
// =============================================================================
//
// The small surface the external control plane calls: strategy start/stop,
// state listing, emergency halt, health. Authentication lives in the control
// plane, not here.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::errors::EngineError;
use crate::lifecycle::Engine;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/strategies", get(list_strategies))
        .route("/strategies/:id/start", post(start_strategy))
        .route("/strategies/:id/stop", post(stop_strategy))
        .route("/halt", post(halt))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

async fn health(State(engine): State<Arc<Engine>>) -> Response {
    let health = engine.health();
    let status = if health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn list_strategies(State(engine): State<Arc<Engine>>) -> Response {
    let defs = engine.registry.all();
    let out: Vec<serde_json::Value> = defs
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "tenant_id": d.tenant_id,
                "name": d.name,
                "state": d.state.to_string(),
                "state_reason": d.state_reason,
                "error_count": d.error_count,
                "symbols": d.symbols,
                "timeframes": d.timeframes,
                "last_eval_at": d.last_eval_at,
            })
        })
        .collect();
    Json(out).into_response()
}

async fn start_strategy(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Response {
    match engine.scheduler.start_strategy(&id).await {
        Ok(()) => Json(json!({"status": "starting"})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_strategy(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Response {
    match engine.scheduler.stop_strategy(&id).await {
        Ok(()) => Json(json!({"status": "stopped"})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn halt(State(engine): State<Arc<Engine>>) -> Response {
    match engine.scheduler.emergency_halt().await {
        Ok(halted) => {
            info!(halted, "halt requested via admin surface");
            Json(json!({"status": "halted", "stopped": halted})).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn error_response(e: EngineError) -> Response {
    let status = match &e {
        EngineError::QuotaExceeded(_) | EngineError::Config(_) => StatusCode::BAD_REQUEST,
        EngineError::Storage(msg) if msg.contains("not found") => StatusCode::NOT_FOUND,
        EngineError::TransientExternal(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}
