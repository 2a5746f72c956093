// src/routes/treatment_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean_opt, deserialize_double_option, patch_opt_text, ApiOk, AppState, Capability},
    odontogram::{Face, Tooth},
    routes::patient_routes::ensure_patient,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/treatments", get(list_catalog).post(create_catalog_item))
        .route("/treatments/{treatment_id}", patch(update_catalog_item))
        .route(
            "/patients/{patient_id}/treatments",
            get(list_patient_treatments).post(create_patient_treatment),
        )
        .route(
            "/patient_treatments/{patient_treatment_id}",
            patch(update_patient_treatment),
        )
}

/* ============================================================
   Catalog
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TreatmentRow {
    pub treatment_id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub default_price_cents: i64,
    pub per_tooth: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CATALOG_COLUMNS: &str =
    "treatment_id, code, name, description, default_price_cents, per_tooth, is_active, created_at, updated_at";

fn validate_code(raw: &str) -> Result<String, ApiError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() || code.len() > 16 {
        return Err(ApiError::validation("code must be 1 to 16 characters"));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ApiError::validation("code may only contain letters, digits, '-' and '_'"));
    }
    Ok(code)
}

fn validate_price(cents: i64) -> Result<i64, ApiError> {
    if cents < 0 {
        return Err(ApiError::validation("price must not be negative"));
    }
    Ok(cents)
}

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    pub include_inactive: Option<bool>,
}

pub async fn list_catalog(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(q): Query<CatalogQuery>,
) -> Result<Json<ApiOk<Vec<TreatmentRow>>>, ApiError> {
    let rows: Vec<TreatmentRow> = sqlx::query_as::<_, TreatmentRow>(&format!(
        r#"
        SELECT {CATALOG_COLUMNS}
        FROM treatment_catalog
        WHERE ($1 OR is_active)
        ORDER BY code ASC
        "#
    ))
    .bind(q.include_inactive.unwrap_or(false))
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreateCatalogRequest {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub default_price_cents: i64,
    #[serde(default)]
    pub per_tooth: bool,
}

pub async fn create_catalog_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCatalogRequest>,
) -> Result<Json<ApiOk<TreatmentRow>>, ApiError> {
    auth.require(Capability::CatalogWrite)?;

    let code = validate_code(&req.code)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let price = validate_price(req.default_price_cents)?;

    let row: TreatmentRow = sqlx::query_as::<_, TreatmentRow>(&format!(
        r#"
        INSERT INTO treatment_catalog (code, name, description, default_price_cents, per_tooth)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {CATALOG_COLUMNS}
        "#
    ))
    .bind(&code)
    .bind(name)
    .bind(clean_opt(req.description))
    .bind(price)
    .bind(req.per_tooth)
    .fetch_one(&state.db)
    .await
    .map_err(|e| match ApiError::db(e) {
        ApiError::Conflict(..) => {
            ApiError::Conflict("CODE_TAKEN", format!("treatment code {code} already exists"))
        }
        other => other,
    })?;

    tracing::info!(treatment_id = %row.treatment_id, code = %row.code, by = %auth.user_id, "treatment created");
    Ok(Json(ApiOk::new(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCatalogRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub description: Option<Option<String>>,
    pub default_price_cents: Option<i64>,
    pub per_tooth: Option<bool>,
    pub is_active: Option<bool>,
}

pub async fn update_catalog_item(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(treatment_id): Path<Uuid>,
    Json(req): Json<UpdateCatalogRequest>,
) -> Result<Json<ApiOk<TreatmentRow>>, ApiError> {
    auth.require(Capability::CatalogWrite)?;

    let existing: TreatmentRow = sqlx::query_as::<_, TreatmentRow>(&format!(
        "SELECT {CATALOG_COLUMNS} FROM treatment_catalog WHERE treatment_id = $1"
    ))
    .bind(treatment_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("treatment"))?;

    let name = match req.name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::validation("name is required")),
        Some(n) => n.to_string(),
        None => existing.name,
    };
    let price = req
        .default_price_cents
        .map(validate_price)
        .transpose()?
        .unwrap_or(existing.default_price_cents);

    let row: TreatmentRow = sqlx::query_as::<_, TreatmentRow>(&format!(
        r#"
        UPDATE treatment_catalog
        SET name = $2,
            description = $3,
            default_price_cents = $4,
            per_tooth = $5,
            is_active = $6,
            updated_at = now()
        WHERE treatment_id = $1
        RETURNING {CATALOG_COLUMNS}
        "#
    ))
    .bind(treatment_id)
    .bind(name)
    .bind(patch_opt_text(req.description, existing.description))
    .bind(price)
    .bind(req.per_tooth.unwrap_or(existing.per_tooth))
    .bind(req.is_active.unwrap_or(existing.is_active))
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(%treatment_id, by = %auth.user_id, "treatment updated");
    Ok(Json(ApiOk::new(row)))
}

/* ============================================================
   Patient treatments
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreatmentStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

impl TreatmentStatus {
    pub fn code(self) -> i16 {
        match self {
            TreatmentStatus::Planned => 0,
            TreatmentStatus::InProgress => 1,
            TreatmentStatus::Completed => 2,
            TreatmentStatus::Cancelled => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(TreatmentStatus::Planned),
            1 => Some(TreatmentStatus::InProgress),
            2 => Some(TreatmentStatus::Completed),
            3 => Some(TreatmentStatus::Cancelled),
            _ => None,
        }
    }

    fn is_closed(self) -> bool {
        matches!(self, TreatmentStatus::Completed | TreatmentStatus::Cancelled)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct PatientTreatmentRow {
    pub patient_treatment_id: Uuid,
    pub patient_id: Uuid,
    pub treatment_id: Uuid,
    pub treatment_code: String,
    pub treatment_name: String,
    pub consultation_id: Option<Uuid>,
    pub tooth: Option<i16>,
    pub faces: Vec<i16>,
    pub status: i16,
    pub price_cents: i64,
    pub performed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PatientTreatmentDto {
    pub patient_treatment_id: Uuid,
    pub patient_id: Uuid,
    pub treatment_id: Uuid,
    pub treatment_code: String,
    pub treatment_name: String,
    pub consultation_id: Option<Uuid>,
    pub tooth: Option<i16>,
    pub faces: Vec<Face>,
    pub status: TreatmentStatus,
    pub price_cents: i64,
    pub performed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PatientTreatmentRow> for PatientTreatmentDto {
    type Error = ApiError;

    fn try_from(r: PatientTreatmentRow) -> Result<Self, Self::Error> {
        let status = TreatmentStatus::from_code(r.status)
            .ok_or_else(|| ApiError::Internal(format!("unknown treatment status {}", r.status)))?;
        let faces = r
            .faces
            .iter()
            .map(|&f| Face::from_code(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PatientTreatmentDto {
            patient_treatment_id: r.patient_treatment_id,
            patient_id: r.patient_id,
            treatment_id: r.treatment_id,
            treatment_code: r.treatment_code,
            treatment_name: r.treatment_name,
            consultation_id: r.consultation_id,
            tooth: r.tooth,
            faces,
            status,
            price_cents: r.price_cents,
            performed_at: r.performed_at,
            notes: r.notes,
            created_at: r.created_at,
        })
    }
}

/// Patient treatment joined with its catalog entry.
pub(crate) const PATIENT_TREATMENT_SELECT: &str = r#"
    SELECT pt.patient_treatment_id, pt.patient_id, pt.treatment_id,
           tc.code AS treatment_code, tc.name AS treatment_name,
           pt.consultation_id, pt.tooth, pt.faces, pt.status, pt.price_cents,
           pt.performed_at, pt.notes, pt.created_at
    FROM patient_treatment pt
    JOIN treatment_catalog tc ON tc.treatment_id = pt.treatment_id
"#;

pub(crate) fn into_dtos(rows: Vec<PatientTreatmentRow>) -> Result<Vec<PatientTreatmentDto>, ApiError> {
    rows.into_iter().map(PatientTreatmentDto::try_from).collect()
}

/// Tooth and faces for a treatment line. Faces need a tooth; per-tooth
/// catalog items need a tooth.
fn resolve_site(
    per_tooth: bool,
    tooth: Option<i16>,
    faces: &[Face],
) -> Result<(Option<i16>, Vec<i16>), ApiError> {
    let tooth = tooth.map(Tooth::new).transpose()?;
    if per_tooth && tooth.is_none() {
        return Err(ApiError::validation("this treatment is applied per tooth; tooth is required"));
    }
    if tooth.is_none() && !faces.is_empty() {
        return Err(ApiError::validation("faces require a tooth"));
    }
    let mut codes: Vec<i16> = faces.iter().map(|f| f.code()).collect();
    codes.sort_unstable();
    codes.dedup();
    Ok((tooth.map(Tooth::number), codes))
}

async fn fetch_patient_treatment(
    state: &AppState,
    patient_treatment_id: Uuid,
) -> Result<PatientTreatmentDto, ApiError> {
    sqlx::query_as::<_, PatientTreatmentRow>(&format!(
        "{PATIENT_TREATMENT_SELECT} WHERE pt.patient_treatment_id = $1"
    ))
    .bind(patient_treatment_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("patient treatment"))?
    .try_into()
}

pub async fn list_patient_treatments(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<PatientTreatmentDto>>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;
    ensure_patient(&state, patient_id).await?;

    let rows: Vec<PatientTreatmentRow> = sqlx::query_as::<_, PatientTreatmentRow>(&format!(
        r#"
        {PATIENT_TREATMENT_SELECT}
        WHERE pt.patient_id = $1
        ORDER BY pt.created_at DESC
        "#
    ))
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(into_dtos(rows)?)))
}

#[derive(Debug, Deserialize)]
pub struct CreatePatientTreatmentRequest {
    pub treatment_id: Uuid,
    pub consultation_id: Option<Uuid>,
    pub tooth: Option<i16>,
    #[serde(default)]
    pub faces: Vec<Face>,
    pub price_cents: Option<i64>,
    pub status: Option<TreatmentStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogBrief {
    default_price_cents: i64,
    per_tooth: bool,
    is_active: bool,
}

pub async fn create_patient_treatment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<CreatePatientTreatmentRequest>,
) -> Result<Json<ApiOk<PatientTreatmentDto>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;
    ensure_patient(&state, patient_id).await?;

    let catalog: CatalogBrief = sqlx::query_as::<_, CatalogBrief>(
        "SELECT default_price_cents, per_tooth, is_active FROM treatment_catalog WHERE treatment_id = $1",
    )
    .bind(req.treatment_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("treatment"))?;

    if !catalog.is_active {
        return Err(ApiError::validation("treatment is no longer offered"));
    }

    let (tooth, faces) = resolve_site(catalog.per_tooth, req.tooth, &req.faces)?;
    let price = validate_price(req.price_cents.unwrap_or(catalog.default_price_cents))?;
    let status = req.status.unwrap_or(TreatmentStatus::Planned);

    if let Some(consultation_id) = req.consultation_id {
        let belongs: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM consultation WHERE consultation_id = $1 AND patient_id = $2)",
        )
        .bind(consultation_id)
        .bind(patient_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;
        if !belongs {
            return Err(ApiError::validation("consultation does not belong to this patient"));
        }
    }

    let patient_treatment_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO patient_treatment (
            patient_id, treatment_id, consultation_id, tooth, faces, status,
            price_cents, performed_at, notes, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7,
                CASE WHEN $6 = 2 THEN now() END,
                $8, $9)
        RETURNING patient_treatment_id
        "#,
    )
    .bind(patient_id)
    .bind(req.treatment_id)
    .bind(req.consultation_id)
    .bind(tooth)
    .bind(faces)
    .bind(status.code())
    .bind(price)
    .bind(clean_opt(req.notes))
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(%patient_treatment_id, %patient_id, by = %auth.user_id, "patient treatment recorded");
    Ok(Json(ApiOk::new(fetch_patient_treatment(&state, patient_treatment_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatientTreatmentRequest {
    pub status: Option<TreatmentStatus>,
    pub price_cents: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

pub async fn update_patient_treatment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_treatment_id): Path<Uuid>,
    Json(req): Json<UpdatePatientTreatmentRequest>,
) -> Result<Json<ApiOk<PatientTreatmentDto>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;

    let existing = fetch_patient_treatment(&state, patient_treatment_id).await?;

    if let Some(next) = req.status {
        if existing.status.is_closed() && next != existing.status {
            return Err(ApiError::Conflict(
                "TREATMENT_CLOSED",
                "completed or cancelled treatments cannot change status".into(),
            ));
        }
    }
    let status = req.status.unwrap_or(existing.status);
    let price = req
        .price_cents
        .map(validate_price)
        .transpose()?
        .unwrap_or(existing.price_cents);

    sqlx::query(
        r#"
        UPDATE patient_treatment
        SET status = $2,
            price_cents = $3,
            notes = $4,
            performed_at = CASE
                WHEN $2 = 2 THEN COALESCE(performed_at, now())
                ELSE NULL
            END,
            updated_at = now()
        WHERE patient_treatment_id = $1
        "#,
    )
    .bind(patient_treatment_id)
    .bind(status.code())
    .bind(price)
    .bind(patch_opt_text(req.notes, existing.notes))
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(%patient_treatment_id, status = ?status, by = %auth.user_id, "patient treatment updated");
    Ok(Json(ApiOk::new(fetch_patient_treatment(&state, patient_treatment_id).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_codes_are_normalized() {
        assert_eq!(validate_code(" fill ").unwrap(), "FILL");
        assert_eq!(validate_code("rct-2").unwrap(), "RCT-2");
        assert!(validate_code("").is_err());
        assert!(validate_code("with space").is_err());
        assert!(validate_code(&"X".repeat(17)).is_err());
    }

    #[test]
    fn prices_cannot_be_negative() {
        assert_eq!(validate_price(0).unwrap(), 0);
        assert!(validate_price(-1).is_err());
    }

    #[test]
    fn per_tooth_items_need_a_tooth() {
        assert!(resolve_site(true, None, &[]).is_err());
        assert_eq!(resolve_site(true, Some(36), &[]).unwrap(), (Some(36), vec![]));
        assert_eq!(resolve_site(false, None, &[]).unwrap(), (None, vec![]));
    }

    #[test]
    fn faces_are_deduplicated_and_need_a_tooth() {
        let faces = [Face::Occlusal, Face::Mesial, Face::Occlusal];
        assert_eq!(resolve_site(false, Some(16), &faces).unwrap(), (Some(16), vec![2, 4]));
        assert!(resolve_site(false, None, &faces).is_err());
    }

    #[test]
    fn invalid_tooth_is_rejected() {
        assert!(resolve_site(false, Some(19), &[]).is_err());
        assert!(resolve_site(false, Some(56), &[]).is_err());
        assert!(resolve_site(false, Some(55), &[]).is_ok());
    }

    #[test]
    fn status_codes_match_storage() {
        for s in [
            TreatmentStatus::Planned,
            TreatmentStatus::InProgress,
            TreatmentStatus::Completed,
            TreatmentStatus::Cancelled,
        ] {
            assert_eq!(TreatmentStatus::from_code(s.code()), Some(s));
        }
        assert!(TreatmentStatus::Completed.is_closed());
        assert!(!TreatmentStatus::InProgress.is_closed());
    }
}
