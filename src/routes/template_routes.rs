// src/routes/template_routes.rs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    scheduling::allocation::{ApplicationReport, ApplyTemplateRequest, TemplateApplication},
    scheduling::template::{CreateTemplateRequest, ScheduleTemplate, TemplateSlotInput},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/templates", post(create_template))
        .route("/templates/{template_id}", get(get_template))
        .route("/templates/{template_id}/activate", post(activate_template))
        .route("/templates/{template_id}/slots", put(revise_template))
        .route("/templates/{template_id}/apply", post(apply_template))
        .route("/template-applications/{application_id}", get(get_application))
        .route("/template-applications/{application_id}/continue", post(continue_application))
        .route("/template-applications/{application_id}/pause", post(pause_application))
        .route("/template-applications/{application_id}/resume", post(resume_application))
        .route("/template-applications/{application_id}/cancel", post(cancel_application))
}

#[derive(Debug, Deserialize)]
pub struct ReviseTemplateRequest {
    pub slots: Vec<TemplateSlotInput>,
}

/* ============================================================
   Templates
   ============================================================ */

pub async fn create_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<ApiOk<ScheduleTemplate>>), ApiError> {
    auth.ensure_manage()?;
    let template = state.core.templates.create(body).await?;
    Ok((StatusCode::CREATED, Json(ApiOk::new(template))))
}

pub async fn get_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
) -> Result<Json<ApiOk<ScheduleTemplate>>, ApiError> {
    auth.ensure_staff()?;
    let template = state.core.templates.get(template_id).await?;
    Ok(Json(ApiOk::new(template)))
}

pub async fn activate_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
) -> Result<Json<ApiOk<ScheduleTemplate>>, ApiError> {
    auth.ensure_manage()?;
    let template = state.core.templates.activate(template_id).await?;
    Ok(Json(ApiOk::new(template)))
}

/// Drafts are edited in place; an active template yields a new version.
pub async fn revise_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
    Json(body): Json<ReviseTemplateRequest>,
) -> Result<Json<ApiOk<ScheduleTemplate>>, ApiError> {
    auth.ensure_manage()?;
    let template = state.core.templates.revise(template_id, body.slots).await?;
    Ok(Json(ApiOk::new(template)))
}

/* ============================================================
   Applications
   ============================================================ */

pub async fn apply_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
    Json(body): Json<ApplyTemplateRequest>,
) -> Result<(StatusCode, Json<ApiOk<ApplicationReport>>), ApiError> {
    auth.ensure_manage()?;
    let report = state
        .core
        .allocation
        .apply_template(template_id, body, Some(auth.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(ApiOk::new(report))))
}

pub async fn get_application(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(application_id): Path<Uuid>,
) -> Result<Json<ApiOk<TemplateApplication>>, ApiError> {
    auth.ensure_staff()?;
    let application = state.core.allocation.get_application(application_id).await?;
    Ok(Json(ApiOk::new(application)))
}

pub async fn continue_application(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(application_id): Path<Uuid>,
) -> Result<Json<ApiOk<ApplicationReport>>, ApiError> {
    auth.ensure_manage()?;
    let report = state.core.allocation.continue_application(application_id).await?;
    Ok(Json(ApiOk::new(report)))
}

pub async fn pause_application(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(application_id): Path<Uuid>,
) -> Result<Json<ApiOk<TemplateApplication>>, ApiError> {
    auth.ensure_manage()?;
    let application = state.core.allocation.pause_application(application_id).await?;
    Ok(Json(ApiOk::new(application)))
}

pub async fn resume_application(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(application_id): Path<Uuid>,
) -> Result<Json<ApiOk<TemplateApplication>>, ApiError> {
    auth.ensure_manage()?;
    let application = state.core.allocation.resume_application(application_id).await?;
    Ok(Json(ApiOk::new(application)))
}

pub async fn cancel_application(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(application_id): Path<Uuid>,
) -> Result<Json<ApiOk<TemplateApplication>>, ApiError> {
    auth.ensure_manage()?;
    let application = state.core.allocation.cancel_application(application_id).await?;
    Ok(Json(ApiOk::new(application)))
}
