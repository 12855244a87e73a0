use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::ApiError;
use crate::services::{AnalyticsReport, AnalyticsWindow};
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub async fn get_analytics(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsReport>, ApiError> {
    let window = AnalyticsWindow::new(query.from, query.to)?;
    Ok(Json(state.engine.analytics(window).await?))
}
