use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, CommandResponse};
use crate::error::SubscriptionError;
use crate::models::{
    BillingEvent, CreateSubscription, ListSubscriptionsFilter, PlanId, SubscriptionStatus,
    SubscriptionView,
};
use crate::services::ProrationQuote;
use crate::startup::AppState;
use service_core::error::AppError;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: PlanId,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Deserialize)]
pub struct TrialExtensionRequest {
    pub days: u32,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ListSubscriptionsQuery {
    pub user_id: Option<Uuid>,
    pub status: Option<String>,
    pub plan_id: Option<PlanId>,
    pub page_size: Option<usize>,
    pub page_token: Option<Uuid>,
}

#[tracing::instrument(skip(state, request), fields(user_id = %request.user_id))]
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<CreateSubscription>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let outcome = state.engine.subscribe(request).await?;
    let response = CommandResponse::from_outcome(&state.engine, outcome)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubscriptionView>, ApiError> {
    Ok(Json(state.engine.view(id).await?))
}

pub async fn get_user_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<SubscriptionView>, ApiError> {
    state
        .engine
        .current_for_user(user_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "User {} has no current subscription",
                user_id
            ))
            .into()
        })
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<ListSubscriptionsQuery>,
) -> Result<Json<Vec<SubscriptionView>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            SubscriptionStatus::from_string(s).ok_or_else(|| {
                SubscriptionError::InvalidRequest(format!("unknown status '{}'", s))
            })
        })
        .transpose()?;

    let filter = ListSubscriptionsFilter {
        user_id: query.user_id,
        status,
        plan_id: query.plan_id,
        page_size: query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        page_token: query.page_token,
    };
    Ok(Json(state.engine.list(&filter).await?))
}

#[tracing::instrument(skip(state, request), fields(target = %request.plan_id))]
pub async fn request_upgrade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PlanChangeRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = state.engine.request_upgrade(id, request.plan_id).await?;
    Ok(Json(CommandResponse::from_outcome(&state.engine, outcome)?))
}

pub async fn preview_upgrade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(request): Query<PlanChangeRequest>,
) -> Result<Json<ProrationQuote>, ApiError> {
    Ok(Json(state.engine.preview_upgrade(id, &request.plan_id).await?))
}

#[tracing::instrument(skip(state, request), fields(target = %request.plan_id))]
pub async fn request_downgrade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PlanChangeRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = state.engine.request_downgrade(id, request.plan_id).await?;
    Ok(Json(CommandResponse::from_outcome(&state.engine, outcome)?))
}

pub async fn cancel_pending_change(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = state.engine.cancel_pending_change(id).await?;
    Ok(Json(CommandResponse::from_outcome(&state.engine, outcome)?))
}

#[tracing::instrument(skip(state, request), fields(immediate = request.immediate))]
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = state.engine.cancel(id, request.immediate).await?;
    Ok(Json(CommandResponse::from_outcome(&state.engine, outcome)?))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = state.engine.resume(id).await?;
    Ok(Json(CommandResponse::from_outcome(&state.engine, outcome)?))
}

pub async fn extend_trial(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TrialExtensionRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = state.engine.extend_trial(id, request.days).await?;
    Ok(Json(CommandResponse::from_outcome(&state.engine, outcome)?))
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<BillingEvent>>, ApiError> {
    // 404 for unknown subscriptions rather than an empty list
    state.engine.get(id).await?;
    let events = state.engine.events_for(id, query.since).collect().await?;
    Ok(Json(events))
}
