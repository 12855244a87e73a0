use axum::{extract::State, Json};
use serde::Serialize;

use super::ApiError;
use crate::models::Plan;
use crate::services::CatalogError;
use crate::startup::AppState;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct CatalogReloadResponse {
    pub plans: usize,
}

/// Plans open to new subscriptions.
pub async fn list_plans(State(state): State<AppState>) -> Json<Vec<Plan>> {
    let catalog = state.catalog.snapshot();
    Json(catalog.subscribable().cloned().collect())
}

/// Re-read the catalog file. A file that fails to load or validate leaves the
/// current catalog in place.
#[tracing::instrument(skip(state))]
pub async fn reload_catalog(
    State(state): State<AppState>,
) -> Result<Json<CatalogReloadResponse>, ApiError> {
    match state.catalog.reload() {
        Ok(plans) => Ok(Json(CatalogReloadResponse { plans })),
        Err(CatalogError::NoSource) => Err(AppError::BadRequest(anyhow::anyhow!(
            "Catalog was not loaded from a file"
        ))
        .into()),
        Err(e) => {
            tracing::error!(error = %e, "Plan catalog reload rejected");
            Err(AppError::BadRequest(anyhow::Error::new(e)).into())
        }
    }
}
