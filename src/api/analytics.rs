use axum::{extract::State, routing::get, Json, Router};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentOwner;
use crate::core::state::AppState;
use crate::repositories;
use crate::schemas::sheet::AnalyticsResponse;

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/", get(get_analytics))
}

async fn get_analytics(
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<AnalyticsResponse>, ApiError> {
    let snapshot = repositories::analytics::find_by_owner(state.db(), &owner_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch analytics"))?;

    Ok(Json(snapshot.map(AnalyticsResponse::from).unwrap_or_else(AnalyticsResponse::empty)))
}
