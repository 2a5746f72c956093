// src/routes/auth_routes.rs

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::{
    auth::{
        generate_access_token, hash_access_token, hash_password, validate_new_password,
        verify_password,
    },
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/logout", post(logout))
        // Rotate the token of the current session; the old token stops working immediately
        .route("/refresh", post(refresh))
        .route("/change_password", post(change_password))
}

pub async fn load_clinic_profile(state: &AppState) -> Result<ClinicProfile, ApiError> {
    let row: Option<(String, String)> = sqlx::query_as(
        r#"
        SELECT clinic_name, currency
        FROM clinic_settings
        WHERE singleton_id = TRUE
        "#,
    )
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let (clinic_name, currency) = row.unwrap_or_else(|| ("Clinic".to_string(), "USD".to_string()));
    Ok(ClinicProfile {
        clinic_name,
        currency,
    })
}

async fn load_user(state: &AppState, user_id: uuid::Uuid) -> Result<UserRow, ApiError> {
    sqlx::query_as::<_, UserRow>(
        r#"
        SELECT user_id, username, display_name, password_hash, role, is_active
        FROM staff_user
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::session_expired)
}

fn profile(user: &UserRow) -> Result<UserProfile, ApiError> {
    let role = Role::from_code(user.role)
        .ok_or_else(|| ApiError::Internal(format!("unknown role code {}", user.role)))?;
    Ok(UserProfile {
        user_id: user.user_id,
        username: user.username.clone(),
        display_name: user.display_name.clone(),
        role,
    })
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiOk<LoginResponseData>>, ApiError> {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("username and password are required"));
    }

    let user: UserRow = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT user_id, username, display_name, password_hash, role, is_active
        FROM staff_user
        WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::invalid_credentials)?;

    if !verify_password(&req.password, &user.password_hash) {
        tracing::warn!(username, "failed login");
        return Err(ApiError::invalid_credentials());
    }
    if !user.is_active {
        return Err(ApiError::Forbidden("ACCOUNT_DISABLED", "Account is disabled".into()));
    }

    let clinic = load_clinic_profile(&state).await?;

    let access_token = generate_access_token();
    let expires_at = Utc::now() + Duration::hours(state.session_ttl_hours);

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        INSERT INTO session_token (user_id, session_token_hash, device_name, expires_at)
        VALUES ($1, $2, $3, $4)
        RETURNING session_token_id, expires_at
        "#,
    )
    .bind(user.user_id)
    .bind(hash_access_token(&access_token))
    .bind(clean_opt(req.device_name))
    .bind(expires_at)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(user_id = %user.user_id, session = %session.session_token_id, "login");

    Ok(Json(ApiOk::new(LoginResponseData {
        access_token,
        expires_at: session.expires_at,
        user: profile(&user)?,
        clinic,
    })))
}

pub async fn me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<MeResponseData>>, ApiError> {
    let user = load_user(&state, auth.user_id).await?;
    let clinic = load_clinic_profile(&state).await?;

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        SELECT session_token_id, expires_at
        FROM session_token
        WHERE session_token_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
        "#,
    )
    .bind(auth.session_token_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::session_expired)?;

    Ok(Json(ApiOk::new(MeResponseData {
        user: profile(&user)?,
        clinic,
        session: SessionInfo {
            session_token_id: session.session_token_id,
            expires_at: session.expires_at,
        },
    })))
}

pub async fn logout(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    let rows = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE session_token_id = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(auth.session_token_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if rows.rows_affected() == 0 {
        return Err(ApiError::session_expired());
    }

    tracing::info!(user_id = %auth.user_id, "logout");
    Ok(Json(ApiOk::new(OkData { ok: true })))
}

#[derive(Debug, serde::Serialize)]
pub struct RefreshData {
    pub access_token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

pub async fn refresh(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<RefreshData>>, ApiError> {
    let access_token = generate_access_token();
    let expires_at = Utc::now() + Duration::hours(state.session_ttl_hours);

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        UPDATE session_token
        SET session_token_hash = $2,
            expires_at = $3,
            last_seen_at = now()
        WHERE session_token_id = $1
          AND revoked_at IS NULL
        RETURNING session_token_id, expires_at
        "#,
    )
    .bind(auth.session_token_id)
    .bind(hash_access_token(&access_token))
    .bind(expires_at)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::session_expired)?;

    Ok(Json(ApiOk::new(RefreshData {
        access_token,
        expires_at: session.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Changes the caller's password and revokes every other session.
pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    validate_new_password(&req.new_password)?;

    let user = load_user(&state, auth.user_id).await?;
    if !verify_password(&req.current_password, &user.password_hash) {
        return Err(ApiError::invalid_credentials());
    }
    if req.current_password == req.new_password {
        return Err(ApiError::validation("new password must differ from the current one"));
    }

    let new_hash = hash_password(&req.new_password)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    sqlx::query(
        r#"
        UPDATE staff_user
        SET password_hash = $2, updated_at = now()
        WHERE user_id = $1
        "#,
    )
    .bind(auth.user_id)
    .bind(new_hash)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND session_token_id <> $2
          AND revoked_at IS NULL
        "#,
    )
    .bind(auth.user_id)
    .bind(auth.session_token_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(user_id = %auth.user_id, "password changed");
    Ok(Json(ApiOk::new(OkData { ok: true })))
}
