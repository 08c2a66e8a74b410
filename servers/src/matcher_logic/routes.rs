//! # Control API
//!
//! HTTP front end over [`MatchService`]. Every handler is a thin translation
//! between JSON and a service call; errors become JSON bodies through
//! [`ApiError`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;

use lib_common::core::{filter, FilterConfig, ServiceError, StartOutcome, StoreError, TaskId, TaskView};

use crate::matcher_logic::model::{
    CountriesRequest, CredentialRequest, DedupRequest, FeedUrlRequest, FeedUrlResponse, FilterUpdate,
    HealthResponse, HistoryQuery, HistoryResponse, RemovedResponse, StartResponse, StopResponse,
};
use crate::matcher_logic::state::AppState;

/// Errors returned by the control API.
#[derive(Debug)]
pub enum ApiError {
    /// A service-level failure.
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError::Service(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Service(ServiceError::Store(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Service(e) = self;
        let (status, error_type) = match &e {
            ServiceError::FeedUrlMissing => (StatusCode::CONFLICT, "FeedUrlMissing"),
            ServiceError::InvalidFeedUrl(_) => (StatusCode::BAD_REQUEST, "InvalidFeedUrl"),
            ServiceError::EmptyCredential => (StatusCode::BAD_REQUEST, "EmptyCredential"),
            ServiceError::NoCredentials(_) => (StatusCode::NOT_FOUND, "NoCredentials"),
            ServiceError::Store(store) => {
                tracing::error!(error = %store, "store failure while serving request");
                (StatusCode::SERVICE_UNAVAILABLE, "StoreError")
            }
        };
        (
            status,
            Json(json!({
                "error_type": error_type,
                "message": e.to_string(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/feed-url", get(get_feed_url).put(set_feed_url))
        .route("/owners/{owner}/credentials", post(submit_credential))
        .route("/owners/{owner}/start", post(start_all))
        .route("/owners/{owner}/tasks", get(list_tasks))
        .route("/owners/{owner}/filter", get(get_filter).put(update_filter))
        .route(
            "/owners/{owner}/filter/countries",
            post(add_countries).delete(clear_countries),
        )
        .route("/owners/{owner}/dedup", put(set_dedup))
        .route("/owners/{owner}/history", get(history).delete(clear_history))
        .route("/history", delete(wipe_history))
        .route("/tasks/{task_id}/stop", post(stop_task))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_tasks: state.service().active_count(),
    })
}

async fn get_feed_url(State(state): State<AppState>) -> ApiResult<Json<FeedUrlResponse>> {
    let feed_url = state.service().feed_url().await?;
    Ok(Json(FeedUrlResponse { feed_url }))
}

async fn set_feed_url(
    State(state): State<AppState>,
    Json(req): Json<FeedUrlRequest>,
) -> ApiResult<Json<FeedUrlResponse>> {
    state.service().set_feed_url(&req.url).await?;
    let feed_url = state.service().feed_url().await?;
    Ok(Json(FeedUrlResponse { feed_url }))
}

async fn submit_credential(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(req): Json<CredentialRequest>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let outcome = state.service().submit_credential(&owner, &req.credential).await?;
    let status = match outcome {
        StartOutcome::Started(_) => StatusCode::CREATED,
        StartOutcome::AlreadyRunning(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome.into())))
}

async fn start_all(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<Vec<StartResponse>>> {
    let outcomes = state.service().start_all(&owner).await?;
    Ok(Json(outcomes.into_iter().map(StartResponse::from).collect()))
}

async fn list_tasks(State(state): State<AppState>, Path(owner): Path<String>) -> Json<Vec<TaskView>> {
    Json(state.service().tasks(&owner))
}

async fn stop_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Json<StopResponse> {
    let task_id = TaskId::from(task_id.as_str());
    let outcome = state.service().request_stop(&task_id);
    Json(StopResponse::new(task_id, outcome))
}

async fn get_filter(State(state): State<AppState>, Path(owner): Path<String>) -> ApiResult<Json<FilterConfig>> {
    Ok(Json(FilterConfig::load(state.service().settings(), &owner).await?))
}

async fn update_filter(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(update): Json<FilterUpdate>,
) -> ApiResult<Json<FilterConfig>> {
    let settings = state.service().settings();
    if let Some(mode) = update.mode {
        filter::set_mode(settings, &owner, mode).await?;
    }
    if let Some(enabled) = update.enabled {
        filter::set_enabled(settings, &owner, enabled).await?;
    }
    Ok(Json(FilterConfig::load(settings, &owner).await?))
}

async fn add_countries(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(req): Json<CountriesRequest>,
) -> ApiResult<Json<FilterConfig>> {
    let settings = state.service().settings();
    filter::add_countries(settings, &owner, &req.split_codes()).await?;
    Ok(Json(FilterConfig::load(settings, &owner).await?))
}

async fn clear_countries(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<FilterConfig>> {
    let settings = state.service().settings();
    filter::clear(settings, &owner).await?;
    Ok(Json(FilterConfig::load(settings, &owner).await?))
}

async fn set_dedup(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(req): Json<DedupRequest>,
) -> ApiResult<Json<FilterConfig>> {
    let settings = state.service().settings();
    filter::set_dedup(settings, &owner, req.enabled).await?;
    Ok(Json(FilterConfig::load(settings, &owner).await?))
}

async fn history(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let ledger = state.service().reservations();
    let total = ledger.count_for_owner(&owner).await?;
    let recent = ledger.recent_for_owner(&owner, query.effective_limit()).await?;
    Ok(Json(HistoryResponse { owner, total, recent }))
}

async fn clear_history(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Json<RemovedResponse>> {
    let removed = state.service().reservations().clear_owner(&owner).await?;
    tracing::info!(owner = %owner, removed, "owner history cleared");
    Ok(Json(RemovedResponse { removed }))
}

async fn wipe_history(State(state): State<AppState>) -> ApiResult<Json<RemovedResponse>> {
    let removed = state.service().reservations().wipe().await?;
    tracing::warn!(removed, "match history wiped");
    Ok(Json(RemovedResponse { removed }))
}
