//! JSON HTTP surface over the trend service.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use vtrend_core::{AcquisitionParams, DuplicatePolicy, StoredRow};
use vtrend_storage::DEFAULT_TOP_CHANNELS;
use vtrend_sync::{AppConfig, CycleError, ExportError, SchedulerError, TrendService};

pub const CRATE_NAME: &str = "vtrend-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TrendService>,
}

impl AppState {
    pub fn new(service: Arc<TrendService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Serialize)]
struct VideoView {
    #[serde(flatten)]
    row: StoredRow,
    watch_url: String,
}

impl From<StoredRow> for VideoView {
    fn from(row: StoredRow) -> Self {
        Self {
            watch_url: row.watch_url(),
            row,
        }
    }
}

/// Parameters as exposed over HTTP; the key itself is never echoed back.
#[derive(Debug, Serialize)]
struct ParamsView {
    country: String,
    max_results: u32,
    policy: DuplicatePolicy,
    api_key_set: bool,
}

impl From<AcquisitionParams> for ParamsView {
    fn from(params: AcquisitionParams) -> Self {
        Self {
            api_key_set: !params.api_key.trim().is_empty(),
            country: params.country,
            max_results: params.max_results,
            policy: params.policy,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TopChannelsQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    interval_minutes: u32,
}

/// `path` is relative to the service's export directory.
#[derive(Debug, Deserialize)]
struct ExportRequest {
    path: PathBuf,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/videos", get(videos_handler))
        .route("/stats/top-channels", get(top_channels_handler))
        .route("/stats/countries", get(countries_handler))
        .route("/stats/views-by-date", get(views_by_date_handler))
        .route("/scrape", post(scrape_handler))
        .route("/schedules", get(list_schedules_handler).post(add_schedule_handler))
        .route("/export", post(export_handler))
        .route("/params", get(get_params_handler).put(put_params_handler))
        .route("/log", get(log_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let service = Arc::new(TrendService::from_config(&config).await?);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving HTTP API");
    axum::serve(listener, app(AppState::new(Arc::clone(&service))))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    service.shutdown().await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn videos_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.list_rows().await {
        Ok(rows) => Json(rows.into_iter().map(VideoView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err),
    }
}

async fn top_channels_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopChannelsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_TOP_CHANNELS);
    match state.service.store().top_channels_by_views(limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn countries_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.counts_by_country().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn views_by_date_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.views_by_date().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.start_scraping().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            let status = match &err {
                CycleError::Validation(_) => StatusCode::BAD_REQUEST,
                CycleError::Fetch(_) => StatusCode::BAD_GATEWAY,
                CycleError::Storage(_) | CycleError::Aborted(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            error_json(status, err)
        }
    }
}

async fn list_schedules_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.service.schedules()).into_response()
}

async fn add_schedule_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScheduleRequest>,
) -> Response {
    match state.service.schedule_every(request.interval_minutes).await {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err @ SchedulerError::Validation(_)) => error_json(StatusCode::BAD_REQUEST, err),
        Err(err) => server_error(err),
    }
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExportRequest>,
) -> Response {
    match state.service.export_named(&request.path).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err @ ExportError::UnsafePath(_)) => error_json(StatusCode::BAD_REQUEST, err),
        Err(err) => server_error(err),
    }
}

async fn get_params_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(ParamsView::from(state.service.params())).into_response()
}

async fn put_params_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<vtrend_sync::ParamsUpdate>,
) -> Response {
    Json(ParamsView::from(state.service.update_params(update))).into_response()
}

async fn log_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.service.recent_log()).into_response()
}

fn error_json(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    error_json(StatusCode::INTERNAL_SERVER_ERROR, err)
}
