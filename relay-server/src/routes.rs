//! HTTP routes
//!
//! ```text
//! POST /process/  {"prompt": "..."}  ──▶  text/event-stream, one `data:` frame per line
//! GET  /health                       ──▶  {"status": "ok", "observers": N}
//! ```
//!
//! Once the response headers are out, failures are reported in-band as
//! frames; the status line always says 200.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use relay_core::driver::StreamDriver;
use relay_core::task::TaskFactory;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// ============================================================================
// SERVER STATE
// ============================================================================

/// Shared by every request
#[derive(Clone)]
pub struct AppState {
    driver: StreamDriver,
    factory: Arc<dyn TaskFactory>,
}

impl AppState {
    /// Serve streams with `driver`, creating tasks from `factory`
    pub fn new(driver: StreamDriver, factory: Arc<dyn TaskFactory>) -> Self {
        Self { driver, factory }
    }

    /// Stream driver
    pub fn driver(&self) -> &StreamDriver {
        &self.driver
    }
}

/// Body of `POST /process/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Prompt handed to the background task
    pub prompt: String,
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/process/", post(process))
        .route("/process", post(process))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ============================================================================
// /process/ ENDPOINT
// ============================================================================

async fn process(State(state): State<AppState>, Json(request): Json<PromptRequest>) -> Response {
    let frames = state
        .driver
        .spawn(request.prompt, Arc::clone(&state.factory))
        .map(|frame| Ok::<_, Infallible>(frame.encode()));

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

// ============================================================================
// /health ENDPOINT
// ============================================================================

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.driver.registry().stats();
    Json(json!({
        "status": "ok",
        "observers": stats.active,
        "delivered": stats.delivered,
        "observer_failures": stats.failures,
    }))
}
