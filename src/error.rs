use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::scheduling::SchedulingError;
use crate::scheduling::appointment::ConflictDetail;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictDetail>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    /// A booking or seating collided with an existing claim on a resource.
    ResourceConflict(ConflictDetail),
    Internal(String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    fn to_error_response(code: &str, message: &str, conflict: Option<ConflictDetail>) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
                conflict,
            },
        })
    }
}

impl From<SchedulingError> for ApiError {
    fn from(e: SchedulingError) -> Self {
        let message = e.to_string();
        match e {
            SchedulingError::Conflict(detail) => ApiError::ResourceConflict(detail),
            SchedulingError::InvalidTransition { .. } => ApiError::Conflict("INVALID_TRANSITION", message),
            SchedulingError::ResourceInactive { .. } => ApiError::BadRequest("RESOURCE_INACTIVE", message),
            SchedulingError::Validation(_) => ApiError::BadRequest("VALIDATION_ERROR", message),
            SchedulingError::NotFound { .. } => ApiError::NotFound("NOT_FOUND", message),
            SchedulingError::Storage(_) => {
                tracing::error!(error = %message, "storage failure");
                ApiError::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => {
                (StatusCode::UNAUTHORIZED, ApiError::to_error_response(code, &msg, None)).into_response()
            }
            ApiError::Forbidden(code, msg) => {
                (StatusCode::FORBIDDEN, ApiError::to_error_response(code, &msg, None)).into_response()
            }
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg, None)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg, None)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg, None)).into_response()
            }
            ApiError::ResourceConflict(detail) => {
                let msg = detail.to_string();
                (
                    StatusCode::CONFLICT,
                    ApiError::to_error_response("CONFLICT", &msg, Some(detail)),
                )
                    .into_response()
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::to_error_response("INTERNAL", &msg, None),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::appointment::ResourceDimension;
    use crate::scheduling::flow::{FlowEventKind, FlowStage};
    use uuid::Uuid;

    #[test]
    fn maps_scheduling_errors_to_status_codes() {
        let conflict = ApiError::from(SchedulingError::Conflict(ConflictDetail {
            dimension: ResourceDimension::Chair,
            resource_id: Uuid::new_v4(),
            existing_appointment_id: None,
        }));
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let invalid = ApiError::from(SchedulingError::InvalidTransition {
            current: FlowStage::Departed,
            attempted: FlowEventKind::CheckIn,
        });
        assert_eq!(invalid.into_response().status(), StatusCode::CONFLICT);

        let missing = ApiError::from(SchedulingError::NotFound {
            entity: "appointment",
            id: Uuid::new_v4(),
        });
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let bad = ApiError::from(SchedulingError::Validation("end before start".into()));
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
