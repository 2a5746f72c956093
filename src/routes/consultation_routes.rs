// src/routes/consultation_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean_opt, deserialize_double_option, patch_opt_text, ApiOk, AppState, Capability, Paging, Role},
    odontogram::ChartEntry,
    routes::{
        odontogram_routes::ENTRY_SELECT,
        patient_routes::ensure_patient,
        radiography_routes::{RadiographDto, RadiographRow, RADIOGRAPH_COLUMNS},
        treatment_routes::{into_dtos, PatientTreatmentDto, PatientTreatmentRow, PATIENT_TREATMENT_SELECT},
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/patients/{patient_id}/consultations",
            get(list_consultations).post(create_consultation),
        )
        .route(
            "/consultations/{consultation_id}",
            get(get_consultation).patch(update_consultation),
        )
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConsultationRow {
    pub consultation_id: Uuid,
    pub patient_id: Uuid,
    pub dentist_id: Uuid,
    pub dentist_name: String,
    pub appointment_id: Option<Uuid>,
    pub consulted_at: DateTime<Utc>,
    pub reason: String,
    pub findings: Option<String>,
    pub diagnosis: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CONSULTATION_SELECT: &str = r#"
    SELECT c.consultation_id, c.patient_id, c.dentist_id, u.display_name AS dentist_name,
           c.appointment_id, c.consulted_at, c.reason, c.findings, c.diagnosis, c.notes,
           c.created_at, c.updated_at
    FROM consultation c
    JOIN staff_user u ON u.user_id = c.dentist_id
"#;

fn require_reason(raw: &str) -> Result<String, ApiError> {
    let reason = raw.trim();
    if reason.is_empty() {
        return Err(ApiError::validation("reason is required"));
    }
    Ok(reason.to_string())
}

fn not_in_future(consulted_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), ApiError> {
    // A few minutes of clock skew between workstations is tolerated.
    if consulted_at > now + chrono::Duration::minutes(5) {
        return Err(ApiError::validation("consulted_at cannot be in the future"));
    }
    Ok(())
}

async fn fetch_consultation(state: &AppState, consultation_id: Uuid) -> Result<ConsultationRow, ApiError> {
    sqlx::query_as::<_, ConsultationRow>(&format!(
        "{CONSULTATION_SELECT} WHERE c.consultation_id = $1"
    ))
    .bind(consultation_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("consultation"))
}

pub async fn list_consultations(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Query(paging): Query<Paging>,
) -> Result<Json<ApiOk<Vec<ConsultationRow>>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;
    ensure_patient(&state, patient_id).await?;

    let (limit, offset) = paging.resolve();
    let rows: Vec<ConsultationRow> = sqlx::query_as::<_, ConsultationRow>(&format!(
        r#"
        {CONSULTATION_SELECT}
        WHERE c.patient_id = $1
        ORDER BY c.consulted_at DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(patient_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreateConsultationRequest {
    /// Defaults to the caller when the caller is a dentist.
    pub dentist_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub consulted_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub findings: Option<String>,
    pub diagnosis: Option<String>,
    pub notes: Option<String>,
}

fn resolve_dentist(auth: &AuthContext, requested: Option<Uuid>) -> Result<Uuid, ApiError> {
    match requested {
        Some(id) => Ok(id),
        None if auth.role == Role::Dentist => Ok(auth.user_id),
        None => Err(ApiError::validation("dentist_id is required")),
    }
}

pub async fn create_consultation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<CreateConsultationRequest>,
) -> Result<Json<ApiOk<ConsultationRow>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;
    ensure_patient(&state, patient_id).await?;

    let reason = require_reason(&req.reason)?;
    let dentist_id = resolve_dentist(&auth, req.dentist_id)?;
    if let Some(at) = req.consulted_at {
        not_in_future(at, Utc::now())?;
    }

    let consultation_id: Uuid = sqlx::query_scalar(
        "SELECT consultation_id FROM consultation_create($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(patient_id)
    .bind(dentist_id)
    .bind(req.appointment_id)
    .bind(req.consulted_at)
    .bind(reason)
    .bind(clean_opt(req.findings))
    .bind(clean_opt(req.diagnosis))
    .bind(clean_opt(req.notes))
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(%consultation_id, %patient_id, %dentist_id, by = %auth.user_id, "consultation created");
    Ok(Json(ApiOk::new(fetch_consultation(&state, consultation_id).await?)))
}

#[derive(Debug, Serialize)]
pub struct ConsultationDetail {
    pub consultation: ConsultationRow,
    pub treatments: Vec<PatientTreatmentDto>,
    pub odontogram_entries: Vec<ChartEntryDto>,
    pub radiographs: Vec<RadiographDto>,
}

/// Odontogram entry as listed under a consultation.
#[derive(Debug, Serialize)]
pub struct ChartEntryDto {
    pub entry_id: Uuid,
    pub tooth: i16,
    pub face: Option<i16>,
    pub diagnosis_code: String,
    pub diagnosis_name: String,
    pub color: String,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<ChartEntry> for ChartEntryDto {
    fn from(e: ChartEntry) -> Self {
        ChartEntryDto {
            entry_id: e.entry_id,
            tooth: e.tooth,
            face: e.face,
            diagnosis_code: e.diagnosis_code,
            diagnosis_name: e.diagnosis_name,
            color: e.color,
            note: e.note,
            recorded_at: e.recorded_at,
        }
    }
}

pub async fn get_consultation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ConsultationDetail>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;

    let consultation = fetch_consultation(&state, consultation_id).await?;

    let treatment_rows: Vec<PatientTreatmentRow> = sqlx::query_as::<_, PatientTreatmentRow>(&format!(
        r#"
        {PATIENT_TREATMENT_SELECT}
        WHERE pt.consultation_id = $1
        ORDER BY pt.created_at ASC
        "#
    ))
    .bind(consultation_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let entries: Vec<ChartEntry> = sqlx::query_as::<_, ChartEntry>(&format!(
        r#"
        {ENTRY_SELECT}
        WHERE e.consultation_id = $1
          AND e.removed_at IS NULL
        ORDER BY e.tooth ASC, e.recorded_at ASC
        "#
    ))
    .bind(consultation_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let radiograph_rows: Vec<RadiographRow> = sqlx::query_as::<_, RadiographRow>(&format!(
        r#"
        SELECT {RADIOGRAPH_COLUMNS}
        FROM radiograph
        WHERE consultation_id = $1
        ORDER BY taken_at ASC
        "#
    ))
    .bind(consultation_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let radiographs = radiograph_rows
        .into_iter()
        .map(RadiographDto::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ApiOk::new(ConsultationDetail {
        consultation,
        treatments: into_dtos(treatment_rows)?,
        odontogram_entries: entries.into_iter().map(ChartEntryDto::from).collect(),
        radiographs,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateConsultationRequest {
    pub consulted_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub findings: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub diagnosis: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

pub async fn update_consultation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(consultation_id): Path<Uuid>,
    Json(req): Json<UpdateConsultationRequest>,
) -> Result<Json<ApiOk<ConsultationRow>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;

    let existing = fetch_consultation(&state, consultation_id).await?;

    let reason = match req.reason.as_deref() {
        Some(r) => require_reason(r)?,
        None => existing.reason,
    };
    let consulted_at = req.consulted_at.unwrap_or(existing.consulted_at);
    not_in_future(consulted_at, Utc::now())?;

    let updated: Option<Uuid> = sqlx::query_scalar(
        "SELECT consultation_id FROM consultation_update($1, $2, $3, $4, $5, $6)",
    )
    .bind(consultation_id)
    .bind(consulted_at)
    .bind(reason)
    .bind(patch_opt_text(req.findings, existing.findings))
    .bind(patch_opt_text(req.diagnosis, existing.diagnosis))
    .bind(patch_opt_text(req.notes, existing.notes))
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    if updated.is_none() {
        return Err(ApiError::not_found("consultation"));
    }

    tracing::info!(%consultation_id, by = %auth.user_id, "consultation updated");
    Ok(Json(ApiOk::new(fetch_consultation(&state, consultation_id).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(role: Role) -> AuthContext {
        AuthContext {
            user_id: Uuid::from_u128(3),
            role,
            session_token_id: Uuid::nil(),
        }
    }

    #[test]
    fn dentist_defaults_to_caller() {
        assert_eq!(resolve_dentist(&ctx(Role::Dentist), None).unwrap(), Uuid::from_u128(3));
        assert!(resolve_dentist(&ctx(Role::Admin), None).is_err());
        let other = Uuid::from_u128(9);
        assert_eq!(resolve_dentist(&ctx(Role::Admin), Some(other)).unwrap(), other);
    }

    #[test]
    fn reason_is_required() {
        assert!(require_reason("  ").is_err());
        assert_eq!(require_reason(" toothache ").unwrap(), "toothache");
    }

    #[test]
    fn future_consultations_are_rejected() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(not_in_future(now, now).is_ok());
        assert!(not_in_future(now + chrono::Duration::minutes(4), now).is_ok());
        assert!(not_in_future(now + chrono::Duration::hours(1), now).is_err());
    }
}
