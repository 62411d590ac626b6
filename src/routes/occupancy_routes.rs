// src/routes/occupancy_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    scheduling::occupancy::{HoldKind, OccupancySnapshot},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clinics/{clinic_id}/occupancy", get(list_occupancy))
        .route("/clinics/{clinic_id}/occupancy/reconcile", post(reconcile_occupancy))
        .route("/resources/{resource_id}/occupancy", get(get_occupancy))
        .route("/resources/{resource_id}/hold", put(place_hold).delete(clear_hold))
}

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub kind: HoldKind,
    pub reason: Option<String>,
}

pub async fn list_occupancy(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<OccupancySnapshot>>>, ApiError> {
    auth.ensure_staff()?;
    let rows = state.core.occupancy.list(clinic_id).await?;
    Ok(Json(ApiOk::new(rows)))
}

pub async fn get_occupancy(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(resource_id): Path<Uuid>,
) -> Result<Json<ApiOk<OccupancySnapshot>>, ApiError> {
    auth.ensure_staff()?;
    let row = state.core.occupancy.get(resource_id).await?;
    Ok(Json(ApiOk::new(row)))
}

pub async fn place_hold(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(resource_id): Path<Uuid>,
    Json(body): Json<HoldRequest>,
) -> Result<Json<ApiOk<OccupancySnapshot>>, ApiError> {
    auth.ensure_manage()?;
    let row = state
        .core
        .occupancy
        .place_hold(resource_id, body.kind, body.reason)
        .await?;
    Ok(Json(ApiOk::new(row)))
}

pub async fn clear_hold(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(resource_id): Path<Uuid>,
) -> Result<Json<ApiOk<OccupancySnapshot>>, ApiError> {
    auth.ensure_manage()?;
    let row = state.core.occupancy.clear_hold(resource_id).await?;
    Ok(Json(ApiOk::new(row)))
}

/// Rebuilds the clinic's projection from seated flows.
pub async fn reconcile_occupancy(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<OccupancySnapshot>>>, ApiError> {
    auth.ensure_manage()?;
    let rows = state.core.occupancy.reconcile(clinic_id).await?;
    Ok(Json(ApiOk::new(rows)))
}
