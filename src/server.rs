//! HTTP JSON API.
//!
//! Exposes the search, tracking, and segment surfaces for the storefront
//! frontend. Search is strictly fail-soft: a pipeline failure returns a
//! valid (possibly empty or less-personalized) response, never an error
//! page. Tracking is fire-and-forget through the background event writer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Run the predictive query pipeline |
//! | `POST` | `/track` | Queue a behavior event (fire-and-forget) |
//! | `GET`  | `/segments/{actor_id}` | Current segment assignment |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::behavior::{self, TrackRequest};
use crate::config::Config;
use crate::models::{EventKind, MatchedSegment, SearchResponse};
use crate::oracle::SuggestionOracle;
use crate::query;
use crate::segments::{self, SegmentDef};
use crate::{db, maintenance};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pool: sqlx::SqlitePool,
    config: Arc<Config>,
    oracle: Arc<dyn SuggestionOracle>,
    segments: Arc<Vec<SegmentDef>>,
    tracker: mpsc::Sender<TrackRequest>,
}

/// Start the HTTP server with the background event writer and the
/// scheduled maintenance jobs. Runs until the process is terminated.
pub async fn run_server(config: &Config, oracle: Arc<dyn SuggestionOracle>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());
    let pool = db::connect(&config).await?;
    let defs = Arc::new(segments::resolve_segments(&config.segments));

    let tracker = behavior::spawn_event_writer(pool.clone(), defs.clone(), 1024);
    let _jobs = maintenance::spawn_jobs(pool.clone(), config.clone(), defs.clone());

    let state = AppState {
        pool,
        config,
        oracle,
        segments: defs,
        tracker,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", post(handle_search))
        .route("/track", post(handle_track))
        .route("/segments/{actor_id}", get(handle_segments))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(target: "csx::server", bind = %bind_addr, "server listening");
    println!("csx server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    actor_id: Option<String>,
}

/// Search never surfaces pipeline failures; only a store-level fault can
/// produce an error response here.
async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    let response = query::process_query(
        &state.pool,
        &state.config,
        state.oracle.as_ref(),
        &body.query,
        body.actor_id.as_deref(),
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    Ok(Json(response))
}

// ============ POST /track ============

#[derive(Deserialize)]
struct TrackBody {
    actor_id: String,
    action: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Serialize)]
struct TrackResponse {
    accepted: bool,
}

/// Queue a behavior event. The write happens on the background writer;
/// a full queue drops the event (tracking is best-effort and must never
/// block the storefront).
async fn handle_track(
    State(state): State<AppState>,
    Json(body): Json<TrackBody>,
) -> Result<Json<TrackResponse>, AppError> {
    if body.actor_id.trim().is_empty() {
        return Err(bad_request("actor_id must not be empty"));
    }
    if EventKind::parse(&body.action).is_none() {
        return Err(bad_request(format!("unknown action type: {}", body.action)));
    }

    let accepted = state
        .tracker
        .try_send(TrackRequest {
            actor_id: body.actor_id,
            action: body.action,
            data: body.data,
            device: body.device,
        })
        .is_ok();

    if !accepted {
        tracing::warn!(target: "csx::server", "tracking queue full, event dropped");
    }

    Ok(Json(TrackResponse { accepted }))
}

// ============ GET /segments/{actor_id} ============

#[derive(Serialize)]
struct SegmentsResponse {
    segments: Vec<MatchedSegment>,
    primary_segment: String,
}

async fn handle_segments(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
) -> Result<Json<SegmentsResponse>, AppError> {
    if actor_id.trim().is_empty() {
        return Err(bad_request("actor_id must not be empty"));
    }

    let (matched, primary) = segments::load_or_compute(&state.pool, &state.segments, &actor_id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(SegmentsResponse {
        segments: matched,
        primary_segment: primary,
    }))
}
