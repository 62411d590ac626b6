use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::error::ApiError;
use crate::models::{AppState, ROLE_ADMIN, ROLE_DOCTOR, ROLE_MANAGER, ROLE_PATIENT, ROLE_RECEPTIONIST, role_to_string};

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: i16,
    pub session_token_id: Uuid,
}

impl AuthContext {
    fn forbidden(&self, what: &str) -> ApiError {
        ApiError::Forbidden(
            "FORBIDDEN",
            format!("role {} cannot {what}", role_to_string(self.role)),
        )
    }

    /// Booking, templates and resource holds.
    pub fn ensure_manage(&self) -> Result<(), ApiError> {
        match self.role {
            ROLE_ADMIN | ROLE_MANAGER | ROLE_RECEPTIONIST => Ok(()),
            _ => Err(self.forbidden("manage the schedule")),
        }
    }

    /// Moving patients through the clinic.
    pub fn ensure_flow_actor(&self) -> Result<(), ApiError> {
        match self.role {
            ROLE_ADMIN | ROLE_MANAGER | ROLE_DOCTOR | ROLE_RECEPTIONIST => Ok(()),
            _ => Err(self.forbidden("update patient flow")),
        }
    }

    pub fn ensure_staff(&self) -> Result<(), ApiError> {
        if self.role == ROLE_PATIENT {
            return Err(self.forbidden("view clinic schedules"));
        }
        Ok(())
    }
}

/// Who a presented session token belongs to.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionIdentity {
    pub session_token_id: Uuid,
    pub user_id: Uuid,
    pub roles: i16,
}

/// Looks up a live session by the SHA-256 hash of its bearer token.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token_hash: &str) -> Result<Option<SessionIdentity>, ApiError>;
}

/// Sessions from the shared DCMS `session_token` table.
pub struct PgSessions {
    pool: PgPool,
}

impl PgSessions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionResolver for PgSessions {
    async fn resolve(&self, token_hash: &str) -> Result<Option<SessionIdentity>, ApiError> {
        let row = sqlx::query_as::<_, SessionIdentity>(
            r#"
            SELECT st.session_token_id, st.user_id, u.roles
            FROM session_token st
            JOIN "dcms_user" u ON u.user_id = st.user_id
            WHERE st.session_token_hash = $1
              AND st.revoked_at IS NULL
              AND st.expires_at > now()
              AND u.is_active = true
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

        if let Some(row) = &row {
            // Touch last_seen_at (best-effort)
            let _ = sqlx::query(
                r#"
                UPDATE session_token
                SET last_seen_at = now()
                WHERE session_token_id = $1
                "#,
            )
            .bind(row.session_token_id)
            .execute(&self.pool)
            .await;
        }
        Ok(row)
    }
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            // Extract Authorization: Bearer <token>
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let token_hash = hash_access_token(authz.token());
            let row = state
                .sessions
                .resolve(&token_hash)
                .await?
                .ok_or_else(ApiError::session_expired)?;

            Ok(AuthContext {
                user_id: row.user_id,
                role: row.roles,
                session_token_id: row.session_token_id,
            })
        }
    }
}
