// src/routes/flow_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    routes::appointment_routes::parse_date,
    scheduling::flow::{FlowEvent, FlowStageHistory},
    scheduling::patient_flow::FlowView,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/flow-board", get(get_flow_board))
        .route("/appointments/{appointment_id}/flow", get(get_flow).post(open_flow))
        .route("/appointments/{appointment_id}/flow/events", post(post_flow_event))
        .route("/appointments/{appointment_id}/flow/history", get(get_flow_history))
}

#[derive(Debug, Deserialize)]
pub struct BoardQuery {
    pub clinic_id: Uuid,
    pub date: String,
}

/* ============================================================
   GET /flow-board?clinic_id=..&date=..
   ============================================================ */

pub async fn get_flow_board(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<BoardQuery>,
) -> Result<Json<ApiOk<Vec<FlowView>>>, ApiError> {
    auth.ensure_staff()?;
    let date = parse_date(&q.date, "date")?;
    let flows = state.core.flows.list_flows(q.clinic_id, date).await?;
    Ok(Json(ApiOk::new(flows)))
}

/* ============================================================
   /appointments/{appointment_id}/flow
   ============================================================ */

pub async fn open_flow(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<FlowView>>, ApiError> {
    auth.ensure_flow_actor()?;
    let view = state.core.flows.open_flow(appointment_id, Some(auth.user_id)).await?;
    Ok(Json(ApiOk::new(view)))
}

pub async fn get_flow(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<FlowView>>, ApiError> {
    auth.ensure_staff()?;
    let view = state.core.flows.get(appointment_id).await?;
    Ok(Json(ApiOk::new(view)))
}

/// Body is the event, e.g. `{"event":"CALL","chair_id":"..."}`.
pub async fn post_flow_event(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(event): Json<FlowEvent>,
) -> Result<Json<ApiOk<FlowView>>, ApiError> {
    auth.ensure_flow_actor()?;
    debug!(
        appointment_id = %appointment_id,
        session = %auth.session_token_id,
        event = %event.kind(),
        "flow event"
    );
    let view = state
        .core
        .flows
        .transition(appointment_id, event, Some(auth.user_id))
        .await?;
    Ok(Json(ApiOk::new(view)))
}

pub async fn get_flow_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<FlowStageHistory>>>, ApiError> {
    auth.ensure_staff()?;
    let rows = state.core.flows.history(appointment_id).await?;
    Ok(Json(ApiOk::new(rows)))
}
