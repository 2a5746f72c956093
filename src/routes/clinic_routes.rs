// src/routes/clinic_routes.rs

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{deserialize_double_option, patch_opt_text, ApiOk, AppState, Capability},
};

pub fn router() -> Router<AppState> {
    Router::new().route("/clinic", get(get_clinic).patch(update_clinic))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ClinicSettings {
    pub clinic_name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub currency: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

async fn load_settings(state: &AppState) -> Result<ClinicSettings, ApiError> {
    sqlx::query_as::<_, ClinicSettings>(
        r#"
        SELECT clinic_name, address, phone, currency, updated_at
        FROM clinic_settings
        WHERE singleton_id = TRUE
        "#,
    )
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::Internal("clinic_settings row is missing".into()))
}

pub async fn get_clinic(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<ClinicSettings>>, ApiError> {
    Ok(Json(ApiOk::new(load_settings(&state).await?)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClinicRequest {
    pub clinic_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub address: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    pub currency: Option<String>,
}

fn validate_clinic_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("clinic_name is required"));
    }
    if name.chars().count() > 128 {
        return Err(ApiError::validation("clinic_name is too long (max 128)"));
    }
    Ok(name.to_string())
}

/// ISO 4217 style: three ASCII letters, stored upper-case.
fn validate_currency(raw: &str) -> Result<String, ApiError> {
    let c = raw.trim().to_ascii_uppercase();
    if c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_uppercase()) {
        return Err(ApiError::validation("currency must be a 3-letter code"));
    }
    Ok(c)
}

pub async fn update_clinic(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdateClinicRequest>,
) -> Result<Json<ApiOk<ClinicSettings>>, ApiError> {
    auth.require(Capability::StaffAdmin)?;

    let existing = load_settings(&state).await?;

    let clinic_name = match req.clinic_name.as_deref() {
        Some(n) => validate_clinic_name(n)?,
        None => existing.clinic_name,
    };
    let currency = match req.currency.as_deref() {
        Some(c) => validate_currency(c)?,
        None => existing.currency,
    };
    let address = patch_opt_text(req.address, existing.address);
    let phone = patch_opt_text(req.phone, existing.phone);

    let updated: ClinicSettings = sqlx::query_as::<_, ClinicSettings>(
        r#"
        UPDATE clinic_settings
        SET clinic_name = $1, address = $2, phone = $3, currency = $4, updated_at = now()
        WHERE singleton_id = TRUE
        RETURNING clinic_name, address, phone, currency, updated_at
        "#,
    )
    .bind(clinic_name)
    .bind(address)
    .bind(phone)
    .bind(currency)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(by = %auth.user_id, "clinic settings updated");
    Ok(Json(ApiOk::new(updated)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clinic_name_bounds() {
        assert!(validate_clinic_name("  ").is_err());
        assert!(validate_clinic_name(&"x".repeat(129)).is_err());
        assert_eq!(validate_clinic_name(" Sonrisas ").unwrap(), "Sonrisas");
    }

    #[test]
    fn currency_codes() {
        assert_eq!(validate_currency("eur").unwrap(), "EUR");
        assert!(validate_currency("EURO").is_err());
        assert!(validate_currency("U$D").is_err());
    }
}
