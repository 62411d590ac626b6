// src/routes/appointment_routes.rs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    scheduling::allocation::RescheduleRequest,
    scheduling::appointment::{Appointment, BookingCandidate},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list_appointments_day).post(book_appointment))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment)
                .patch(reschedule_appointment)
                .delete(delete_appointment),
        )
        .route("/appointments/{appointment_id}/confirm", post(confirm_appointment))
        .route("/appointments/{appointment_id}/cancel", post(cancel_appointment))
}

/* ============================================================
   Query params / DTOs
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    pub clinic_id: Uuid,
    // YYYY-MM-DD in clinic-local time
    pub date: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedData {
    pub appointment_id: Uuid,
    pub deleted: bool,
}

pub(crate) fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest("VALIDATION_ERROR", format!("{field} must be YYYY-MM-DD")))
}

/* ============================================================
   GET /appointments?clinic_id=..&date=..
   ============================================================ */

pub async fn list_appointments_day(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DayQuery>,
) -> Result<Json<ApiOk<Vec<Appointment>>>, ApiError> {
    auth.ensure_staff()?;
    let date = parse_date(&q.date, "date")?;
    let rows = state.core.allocation.list_day(q.clinic_id, date).await?;
    Ok(Json(ApiOk::new(rows)))
}

/* ============================================================
   POST /appointments
   ============================================================ */

pub async fn book_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<BookingCandidate>,
) -> Result<(StatusCode, Json<ApiOk<Appointment>>), ApiError> {
    auth.ensure_manage()?;
    let appointment = state.core.allocation.book(body).await?;
    Ok((StatusCode::CREATED, Json(ApiOk::new(appointment))))
}

/* ============================================================
   GET /appointments/{appointment_id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.ensure_staff()?;
    let appointment = state.core.allocation.get(appointment_id).await?;
    Ok(Json(ApiOk::new(appointment)))
}

/* ============================================================
   PATCH /appointments/{appointment_id}
   ============================================================ */

pub async fn reschedule_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(body): Json<RescheduleRequest>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.ensure_manage()?;
    let appointment = state.core.allocation.reschedule(appointment_id, body).await?;
    Ok(Json(ApiOk::new(appointment)))
}

/* ============================================================
   POST /appointments/{appointment_id}/confirm | /cancel
   ============================================================ */

pub async fn confirm_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.ensure_manage()?;
    let appointment = state.core.allocation.confirm(appointment_id).await?;
    Ok(Json(ApiOk::new(appointment)))
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Appointment>>, ApiError> {
    auth.ensure_manage()?;
    let appointment = state.core.allocation.cancel(appointment_id).await?;
    Ok(Json(ApiOk::new(appointment)))
}

/* ============================================================
   DELETE /appointments/{appointment_id}
   ============================================================ */

pub async fn delete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<DeletedData>>, ApiError> {
    auth.ensure_manage()?;
    state.core.allocation.delete(appointment_id).await?;
    Ok(Json(ApiOk::new(DeletedData {
        appointment_id,
        deleted: true,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_dates_only() {
        assert_eq!(
            parse_date(" 2025-03-10 ", "date").unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
        );
        assert!(parse_date("10/03/2025", "date").is_err());
        assert!(parse_date("", "date").is_err());
    }
}
