// src/routes/staff_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{hash_password, validate_new_password},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Capability, Role},
};

#[derive(Debug, sqlx::FromRow)]
struct StaffRow {
    user_id: Uuid,
    username: String,
    display_name: String,
    role: i16,
    is_active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct StaffDto {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<StaffRow> for StaffDto {
    type Error = ApiError;

    fn try_from(r: StaffRow) -> Result<Self, Self::Error> {
        let role = Role::from_code(r.role)
            .ok_or_else(|| ApiError::Internal(format!("unknown role code {}", r.role)))?;
        Ok(StaffDto {
            user_id: r.user_id,
            username: r.username,
            display_name: r.display_name,
            role,
            is_active: r.is_active,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DentistBrief {
    pub user_id: Uuid,
    pub display_name: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/staff
        .route("/", get(list_staff).post(create_staff))
        .route("/dentists", get(list_dentists))
        .route("/{user_id}", get(get_staff).patch(update_staff))
        .route("/{user_id}/disable", post(disable_staff))
        .route("/{user_id}/enable", post(enable_staff))
}

const STAFF_COLUMNS: &str = "user_id, username, display_name, role, is_active, created_at";

fn validate_username(username: &str) -> Result<String, ApiError> {
    let u = username.trim();
    if u.chars().count() < 3 {
        return Err(ApiError::validation("username must be at least 3 characters"));
    }
    if u.chars().any(char::is_whitespace) {
        return Err(ApiError::validation("username must not contain spaces"));
    }
    Ok(u.to_lowercase())
}

fn validate_display_name(display_name: &str) -> Result<String, ApiError> {
    let d = display_name.trim();
    if d.is_empty() {
        return Err(ApiError::validation("display_name is required"));
    }
    Ok(d.to_string())
}

#[derive(Debug, Deserialize)]
pub struct ListStaffQuery {
    pub role: Option<Role>,
}

pub async fn list_staff(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListStaffQuery>,
) -> Result<Json<ApiOk<Vec<StaffDto>>>, ApiError> {
    auth.require(Capability::StaffAdmin)?;

    let rows: Vec<StaffRow> = sqlx::query_as::<_, StaffRow>(&format!(
        r#"
        SELECT {STAFF_COLUMNS}
        FROM staff_user
        WHERE ($1::smallint IS NULL OR role = $1)
        ORDER BY is_active DESC, display_name ASC
        LIMIT 500
        "#
    ))
    .bind(q.role.map(Role::code))
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let staff = rows
        .into_iter()
        .map(StaffDto::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiOk::new(staff)))
}

/// Active dentists, for calendar and consultation pickers.
pub async fn list_dentists(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<DentistBrief>>>, ApiError> {
    let rows: Vec<DentistBrief> = sqlx::query_as::<_, DentistBrief>(
        r#"
        SELECT user_id, display_name
        FROM staff_user
        WHERE role = $1 AND is_active = true
        ORDER BY display_name ASC
        "#,
    )
    .bind(Role::Dentist.code())
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(rows)))
}

async fn fetch_staff(state: &AppState, user_id: Uuid) -> Result<StaffDto, ApiError> {
    sqlx::query_as::<_, StaffRow>(&format!(
        "SELECT {STAFF_COLUMNS} FROM staff_user WHERE user_id = $1"
    ))
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("staff member"))?
    .try_into()
}

pub async fn get_staff(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<StaffDto>>, ApiError> {
    if auth.user_id != user_id {
        auth.require(Capability::StaffAdmin)?;
    }
    Ok(Json(ApiOk::new(fetch_staff(&state, user_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct CreateStaffRequest {
    pub username: String,
    pub display_name: String,
    pub password: String,
    pub role: Role,
}

pub async fn create_staff(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateStaffRequest>,
) -> Result<Json<ApiOk<StaffDto>>, ApiError> {
    auth.require(Capability::StaffAdmin)?;

    let username = validate_username(&req.username)?;
    let display_name = validate_display_name(&req.display_name)?;
    validate_new_password(&req.password)?;
    let password_hash = hash_password(&req.password)?;

    let row: StaffRow = sqlx::query_as::<_, StaffRow>(&format!(
        r#"
        INSERT INTO staff_user (username, display_name, password_hash, role)
        VALUES ($1, $2, $3, $4)
        RETURNING {STAFF_COLUMNS}
        "#
    ))
    .bind(&username)
    .bind(&display_name)
    .bind(password_hash)
    .bind(req.role.code())
    .fetch_one(&state.db)
    .await
    .map_err(|e| match ApiError::db(e) {
        ApiError::Conflict(..) => ApiError::Conflict(
            "USERNAME_TAKEN",
            format!("username {username} is already in use"),
        ),
        other => other,
    })?;

    tracing::info!(user_id = %row.user_id, by = %auth.user_id, role = req.role.as_str(), "staff created");
    Ok(Json(ApiOk::new(row.try_into()?)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStaffRequest {
    pub display_name: Option<String>,
    pub role: Option<Role>,
}

pub async fn update_staff(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateStaffRequest>,
) -> Result<Json<ApiOk<StaffDto>>, ApiError> {
    auth.require(Capability::StaffAdmin)?;

    let display_name = req
        .display_name
        .as_deref()
        .map(validate_display_name)
        .transpose()?;

    if user_id == auth.user_id && req.role.is_some_and(|r| r != Role::Admin) {
        return Err(ApiError::Conflict(
            "SELF_DEMOTION",
            "admins cannot remove their own admin role".into(),
        ));
    }

    let row: StaffRow = sqlx::query_as::<_, StaffRow>(&format!(
        r#"
        UPDATE staff_user
        SET display_name = COALESCE($2, display_name),
            role = COALESCE($3, role),
            updated_at = now()
        WHERE user_id = $1
        RETURNING {STAFF_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(display_name)
    .bind(req.role.map(Role::code))
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("staff member"))?;

    tracing::info!(%user_id, by = %auth.user_id, "staff updated");
    Ok(Json(ApiOk::new(row.try_into()?)))
}

async fn set_active(
    state: &AppState,
    auth: &AuthContext,
    user_id: Uuid,
    active: bool,
) -> Result<StaffDto, ApiError> {
    auth.require(Capability::StaffAdmin)?;
    if !active && user_id == auth.user_id {
        return Err(ApiError::Conflict(
            "SELF_DISABLE",
            "you cannot disable your own account".into(),
        ));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row: StaffRow = sqlx::query_as::<_, StaffRow>(&format!(
        r#"
        UPDATE staff_user
        SET is_active = $2, updated_at = now()
        WHERE user_id = $1
        RETURNING {STAFF_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(active)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("staff member"))?;

    if !active {
        sqlx::query(
            r#"
            UPDATE session_token
            SET revoked_at = now()
            WHERE user_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%user_id, by = %auth.user_id, active, "staff activation changed");
    row.try_into()
}

pub async fn disable_staff(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<StaffDto>>, ApiError> {
    Ok(Json(ApiOk::new(set_active(&state, &auth, user_id, false).await?)))
}

pub async fn enable_staff(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<StaffDto>>, ApiError> {
    Ok(Json(ApiOk::new(set_active(&state, &auth, user_id, true).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_normalized() {
        assert_eq!(validate_username("  DrRuiz ").unwrap(), "drruiz");
        assert!(validate_username("ab").is_err());
        assert!(validate_username("dr ruiz").is_err());
    }

    #[test]
    fn display_name_is_required() {
        assert!(validate_display_name("   ").is_err());
        assert_eq!(validate_display_name(" Dr. Ruiz ").unwrap(), "Dr. Ruiz");
    }
}
