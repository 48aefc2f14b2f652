use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::events::types::{IncomingEvent, IngestSummary, LineDefects, MachineStats};
use crate::events::{BatchIngestor, StatsService, DEFAULT_TOP_LINES_LIMIT};
use crate::store::EventStore;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HttpState {
    pub ingestor: BatchIngestor,
    pub stats: StatsService,
    pub max_batch_size: usize,
    pub max_body_bytes: usize,
}

impl HttpState {
    pub fn new(store: Arc<dyn EventStore>, config: &Config) -> Self {
        Self {
            ingestor: BatchIngestor::new(store.clone()),
            stats: StatsService::new(store),
            max_batch_size: config.max_batch_size,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsQuery {
    machine_id: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopLinesQuery {
    factory_id: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn post_batch(
    State(state): State<HttpState>,
    Json(events): Json<Vec<IncomingEvent>>,
) -> AppResult<Json<IngestSummary>> {
    if events.len() > state.max_batch_size {
        return Err(AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Batch of {} events exceeds the maximum of {}",
                events.len(),
                state.max_batch_size
            ),
        ));
    }
    tracing::debug!(events = events.len(), "received event batch");
    let summary = state.ingestor.ingest_batch(events).await?;
    Ok(Json(summary))
}

async fn get_stats(
    State(state): State<HttpState>,
    Query(query): Query<StatsQuery>,
) -> AppResult<Json<MachineStats>> {
    let stats = state
        .stats
        .machine_stats(&query.machine_id, query.start, query.end)
        .await?;
    Ok(Json(stats))
}

async fn get_top_defect_lines(
    State(state): State<HttpState>,
    Query(query): Query<TopLinesQuery>,
) -> AppResult<Json<Vec<LineDefects>>> {
    let limit = match query.limit {
        None => DEFAULT_TOP_LINES_LIMIT,
        Some(limit) if limit >= 1 => usize::try_from(limit).unwrap_or(usize::MAX),
        Some(_) => return Err(AppError::bad_request("limit must be >= 1")),
    };
    let lines = state
        .stats
        .top_defect_lines(&query.factory_id, query.from, query.to, limit)
        .await?;
    Ok(Json(lines))
}

pub fn router(state: HttpState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/events/batch", post(post_batch))
        .route("/stats", get(get_stats))
        .route("/stats/top-defect-lines", get(get_top_defect_lines))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
