use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::error::ApiError;
use crate::models::{AppState, Capability, Role};

/// The authenticated staff member behind a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: Role,
    pub session_token_id: Uuid,
}

impl AuthContext {
    pub fn can(&self, cap: Capability) -> bool {
        self.role.allows(cap)
    }

    pub fn require(&self, cap: Capability) -> Result<(), ApiError> {
        if self.can(cap) {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.user_id, role = self.role.as_str(), ?cap, "permission denied");
            Err(ApiError::Forbidden(
                "FORBIDDEN",
                format!("role {} may not {}", self.role.as_str(), cap.describe()),
            ))
        }
    }

    pub fn is_dentist(&self) -> bool {
        self.role == Role::Dentist
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionLookupRow {
    session_token_id: Uuid,
    user_id: Uuid,
    role: i16,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let token_hash = hash_access_token(authz.token());

            let row: SessionLookupRow = sqlx::query_as::<_, SessionLookupRow>(
                r#"
                SELECT st.session_token_id, st.user_id, u.role
                FROM session_token st
                JOIN staff_user u ON u.user_id = st.user_id
                WHERE st.session_token_hash = $1
                  AND st.revoked_at IS NULL
                  AND st.expires_at > now()
                  AND u.is_active = true
                "#,
            )
            .bind(&token_hash)
            .fetch_optional(&state.db)
            .await
            .map_err(ApiError::db)?
            .ok_or_else(ApiError::session_expired)?;

            let role = Role::from_code(row.role).ok_or_else(|| {
                ApiError::Internal(format!("unknown role code {} on user {}", row.role, row.user_id))
            })?;

            // best-effort
            let _ = sqlx::query(
                r#"
                UPDATE session_token
                SET last_seen_at = now()
                WHERE session_token_id = $1
                "#,
            )
            .bind(row.session_token_id)
            .execute(&state.db)
            .await;

            Ok(AuthContext {
                user_id: row.user_id,
                role,
                session_token_id: row.session_token_id,
            })
        }
    }
}
