// src/api_server.rs
//
// HTTP surface: ROI configuration, reload, alarm history and status.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::analysis::roi_config::{write_roi_config, RoiArea, RoiConfigError, RoiConfigUpdate, RoiGroup};
use crate::analysis::RoiEngine;
use crate::pipeline::{AlarmHistory, AlarmHistoryView, PipelineMetrics};

const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_QUERY: &str = "api_key";

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<RoiEngine>,
    pub history: Arc<AlarmHistory>,
    pub metrics: PipelineMetrics,
    /// Requests must present this key when set.
    pub api_key: Option<String>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct RoiConfigView {
    pub detection_threshold: f32,
    pub roi_areas: Vec<RoiArea>,
    pub roi_groups: Vec<RoiGroup>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/roi/config", get(get_roi_config).post(update_roi_config))
        .route("/api/roi/reload", post(reload_roi_config))
        .route("/api/alarm/history", get(alarm_history))
        .route("/api/system/status", get(status))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

pub async fn serve(
    bind: &str,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind API server to {}", bind))?;
    info!("🌐 API server listening on {}", bind);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server failed")?;

    info!("API server stopped");
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": message.into() }))).into_response()
}

pub fn is_authorized(
    expected: Option<&str>,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> bool {
    let Some(expected) = expected.filter(|k| !k.is_empty()) else {
        return true;
    };

    let header_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    let query_key = query.get(API_KEY_QUERY).map(String::as_str);
    header_key == Some(expected) || query_key == Some(expected)
}

async fn require_api_key(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if !is_authorized(state.api_key.as_deref(), &headers, &query) {
        warn!("Rejected unauthorized request to {}", request.uri().path());
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    next.run(request).await
}

// ============================================================================
// HANDLERS
// ============================================================================

pub async fn get_roi_config(State(state): State<ApiState>) -> Json<RoiConfigView> {
    let graph = state.engine.graph();
    Json(RoiConfigView {
        detection_threshold: graph.detection_threshold,
        roi_areas: graph.roi_areas.clone(),
        roi_groups: graph.roi_groups.clone(),
    })
}

pub async fn update_roi_config(State(state): State<ApiState>, body: Bytes) -> Response {
    let update: RoiConfigUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Rejected ROI config update: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "Invalid request format");
        }
    };
    if update.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request format");
    }

    // Saving touches the filesystem; keep it off the async workers.
    let engine = state.engine.clone();
    let outcome = tokio::task::spawn_blocking(move || apply_update(&engine, &update)).await;

    let reloaded = match outcome {
        Ok(Ok(reloaded)) => reloaded,
        Ok(Err(e)) => {
            error!("Failed to write ROI configuration: {:#}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save configuration");
        }
        Err(e) => {
            error!("ROI config update task failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save configuration");
        }
    };

    match reloaded {
        Ok(()) => {
            state.metrics.inc(&state.metrics.config_reloads);
            Json(json!({ "success": true, "message": "ROI configuration updated" })).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Configuration updated but failed to reload: {}", e),
        ),
    }
}

/// Write and save the edits, then reload. The outer error is a save
/// failure, the inner one a reload failure.
fn apply_update(engine: &RoiEngine, update: &RoiConfigUpdate) -> Result<Result<(), RoiConfigError>> {
    write_roi_config(engine.store().as_ref(), update)?;
    Ok(engine.reload_config())
}

pub async fn reload_roi_config(State(state): State<ApiState>) -> Response {
    match state.engine.reload_config() {
        Ok(()) => {
            state.metrics.inc(&state.metrics.config_reloads);
            Json(json!({ "success": true, "message": "ROI configuration reloaded" })).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to reload ROI configuration: {}", e),
        ),
    }
}

pub async fn alarm_history(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let history: Vec<AlarmHistoryView> = state
        .history
        .query()
        .iter()
        .map(AlarmHistoryView::from)
        .collect();
    Json(json!({ "history": history }))
}

pub async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let engine = &state.engine;
    let (active_tracks, held_tracks) = engine.track_counts();
    Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "alarm_count": state.history.len(),
        "roi_enabled": engine.is_active(),
        "roi_count": engine.roi_areas().len(),
        "group_count": engine.roi_groups().len(),
        "detection_threshold": engine.detection_threshold(),
        "tracked_objects": state.engine.tracked_objects().len(),
        "active_tracks": active_tracks,
        "held_tracks": held_tracks,
        "metrics": state.metrics.summary(),
    }))
}
