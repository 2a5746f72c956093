// src/routes/patient_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    calendar::{fold_rows, AppointmentBlock, AppointmentJoinRow},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean_opt, deserialize_double_option, patch_opt_text, ApiOk, AppState, Capability, Paging},
    routes::{appointment_routes::APPOINTMENT_SELECT, payment_routes::{load_balance, PatientBalance}},
};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PatientRow {
    pub patient_id: Uuid,
    pub record_number: String,
    pub first_name: String,
    pub last_name: String,
    pub document_id: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub gender: i16,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub allergies: Option<String>,
    pub medical_notes: Option<String>,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const PATIENT_STATUS_ACTIVE: i16 = 0;
pub const PATIENT_STATUS_ARCHIVED: i16 = 1;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients", post(create_patient).get(search_patients))
        .route("/patients/{patient_id}", get(get_patient).patch(update_patient))
        .route("/patients/{patient_id}/summary", get(get_patient_summary))
        .route("/patients/{patient_id}/archive", post(archive_patient))
        .route("/patients/{patient_id}/restore", post(restore_patient))
}

/* ============================================================
   Validation
   ============================================================ */

fn require_name(field: &str, value: &str) -> Result<String, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::validation(format!("{field} is required")));
    }
    if v.chars().count() > 100 {
        return Err(ApiError::validation(format!("{field} is too long (max 100)")));
    }
    Ok(v.to_string())
}

fn validate_gender(gender: i16) -> Result<(), ApiError> {
    if !(0..=2).contains(&gender) {
        return Err(ApiError::validation("gender must be 0 (unspecified), 1 (female) or 2 (male)"));
    }
    Ok(())
}

fn validate_email(email: Option<&str>) -> Result<(), ApiError> {
    if let Some(e) = email {
        let ok = e
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !ok {
            return Err(ApiError::validation("email is not a valid address"));
        }
    }
    Ok(())
}

fn validate_birthday(birthday: Option<NaiveDate>, today: NaiveDate) -> Result<(), ApiError> {
    if birthday.is_some_and(|b| b > today) {
        return Err(ApiError::validation("birthday cannot be in the future"));
    }
    Ok(())
}

pub(crate) async fn fetch_patient(state: &AppState, patient_id: Uuid) -> Result<PatientRow, ApiError> {
    sqlx::query_as::<_, PatientRow>("SELECT * FROM patient WHERE patient_id = $1")
        .bind(patient_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("patient"))
}

/// 404 unless the patient exists.
pub(crate) async fn ensure_patient(state: &AppState, patient_id: Uuid) -> Result<(), ApiError> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM patient WHERE patient_id = $1)")
        .bind(patient_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;
    if exists {
        Ok(())
    } else {
        Err(ApiError::not_found("patient"))
    }
}

/* ============================================================
   Create / read
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreatePatientRequest {
    pub record_number: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub document_id: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub gender: Option<i16>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub allergies: Option<String>,
    pub medical_notes: Option<String>,
}

pub async fn create_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    auth.require(Capability::PatientsWrite)?;

    let first_name = require_name("first_name", &req.first_name)?;
    let last_name = require_name("last_name", &req.last_name)?;
    let gender = req.gender.unwrap_or(0);
    validate_gender(gender)?;
    let email = clean_opt(req.email);
    validate_email(email.as_deref())?;
    validate_birthday(req.birthday, Utc::now().date_naive())?;

    let row: PatientRow = sqlx::query_as::<_, PatientRow>(
        "SELECT * FROM patient_create($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(clean_opt(req.record_number))
    .bind(first_name)
    .bind(last_name)
    .bind(clean_opt(req.document_id))
    .bind(req.birthday)
    .bind(gender)
    .bind(clean_opt(req.phone))
    .bind(email)
    .bind(clean_opt(req.address))
    .bind(clean_opt(req.allergies))
    .bind(clean_opt(req.medical_notes))
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(patient_id = %row.patient_id, record = %row.record_number, by = %auth.user_id, "patient created");
    Ok(Json(ApiOk::new(row)))
}

pub async fn get_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    auth.require(Capability::PatientsRead)?;
    Ok(Json(ApiOk::new(fetch_patient(&state, patient_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub include_archived: Option<bool>,
    #[serde(flatten)]
    pub paging: Paging,
}

/// `%term%` with LIKE wildcards in the term matched literally.
fn contains_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

pub async fn search_patients(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SearchQuery>,
) -> Result<Json<ApiOk<Vec<PatientRow>>>, ApiError> {
    auth.require(Capability::PatientsRead)?;

    let (limit, offset) = q.paging.resolve();
    let rows: Vec<PatientRow> =
        sqlx::query_as::<_, PatientRow>("SELECT * FROM patient_search($1, $2, $3, $4)")
            .bind(clean_opt(q.query).as_deref().map(contains_pattern))
            .bind(q.include_archived.unwrap_or(false))
            .bind(limit as i32)
            .bind(offset as i32)
            .fetch_all(&state.db)
            .await
            .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(rows)))
}

/* ============================================================
   Update
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct UpdatePatientRequest {
    pub record_number: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub document_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub birthday: Option<Option<NaiveDate>>,
    pub gender: Option<i16>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub address: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub allergies: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub medical_notes: Option<Option<String>>,
}

pub async fn update_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<UpdatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    auth.require(Capability::PatientsWrite)?;

    let existing = fetch_patient(&state, patient_id).await?;

    let record_number = clean_opt(req.record_number).unwrap_or(existing.record_number);
    let first_name = match req.first_name.as_deref() {
        Some(v) => require_name("first_name", v)?,
        None => existing.first_name,
    };
    let last_name = match req.last_name.as_deref() {
        Some(v) => require_name("last_name", v)?,
        None => existing.last_name,
    };
    let gender = req.gender.unwrap_or(existing.gender);
    validate_gender(gender)?;
    let birthday = match req.birthday {
        None => existing.birthday,
        Some(v) => v,
    };
    validate_birthday(birthday, Utc::now().date_naive())?;
    let email = patch_opt_text(req.email, existing.email);
    validate_email(email.as_deref())?;

    let updated: PatientRow = sqlx::query_as::<_, PatientRow>(
        "SELECT * FROM patient_update($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(patient_id)
    .bind(record_number)
    .bind(first_name)
    .bind(last_name)
    .bind(patch_opt_text(req.document_id, existing.document_id))
    .bind(birthday)
    .bind(gender)
    .bind(patch_opt_text(req.phone, existing.phone))
    .bind(email)
    .bind(patch_opt_text(req.address, existing.address))
    .bind(patch_opt_text(req.allergies, existing.allergies))
    .bind(patch_opt_text(req.medical_notes, existing.medical_notes))
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("patient"))?;

    tracing::info!(%patient_id, by = %auth.user_id, "patient updated");
    Ok(Json(ApiOk::new(updated)))
}

async fn set_status(
    state: &AppState,
    auth: &AuthContext,
    patient_id: Uuid,
    status: i16,
) -> Result<PatientRow, ApiError> {
    auth.require(Capability::PatientsWrite)?;

    let row = sqlx::query_as::<_, PatientRow>("SELECT * FROM patient_set_status($1, $2)")
        .bind(patient_id)
        .bind(status)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("patient"))?;

    tracing::info!(%patient_id, status, by = %auth.user_id, "patient status changed");
    Ok(row)
}

pub async fn archive_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    let row = set_status(&state, &auth, patient_id, PATIENT_STATUS_ARCHIVED).await?;
    Ok(Json(ApiOk::new(row)))
}

pub async fn restore_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    let row = set_status(&state, &auth, patient_id, PATIENT_STATUS_ACTIVE).await?;
    Ok(Json(ApiOk::new(row)))
}

/* ============================================================
   Summary
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConsultationBrief {
    pub consultation_id: Uuid,
    pub consulted_at: DateTime<Utc>,
    pub reason: String,
    pub diagnosis: Option<String>,
    pub dentist_name: String,
}

#[derive(Debug, Serialize)]
pub struct PatientSummary {
    pub patient: PatientRow,
    pub upcoming_appointments: Vec<AppointmentBlock>,
    pub recent_consultations: Vec<ConsultationBrief>,
    pub active_plans: Vec<ActivePlanBrief>,
    pub balance: PatientBalance,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ActivePlanBrief {
    pub plan_id: Uuid,
    pub description: String,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub balance_cents: i64,
}

pub async fn get_patient_summary(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientSummary>>, ApiError> {
    auth.require(Capability::PatientsRead)?;

    let patient = fetch_patient(&state, patient_id).await?;

    let rows: Vec<AppointmentJoinRow> = sqlx::query_as::<_, AppointmentJoinRow>(&format!(
        r#"
        {APPOINTMENT_SELECT}
        WHERE a.appointment_id IN (
            SELECT appointment_id
            FROM appointment
            WHERE patient_id = $1
              AND start_at >= now()
              AND status NOT IN (5, 6)
            ORDER BY start_at ASC
            LIMIT 5
        )
        ORDER BY a.start_at ASC, tc.code ASC
        "#
    ))
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;
    let upcoming_appointments = fold_rows(rows)?;

    // Front desk staff see the schedule but not clinical notes.
    let recent_consultations = if auth.can(Capability::ClinicalRead) {
        sqlx::query_as::<_, ConsultationBrief>(
            r#"
            SELECT c.consultation_id, c.consulted_at, c.reason, c.diagnosis,
                   u.display_name AS dentist_name
            FROM consultation c
            JOIN staff_user u ON u.user_id = c.dentist_id
            WHERE c.patient_id = $1
            ORDER BY c.consulted_at DESC
            LIMIT 5
            "#,
        )
        .bind(patient_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?
    } else {
        Vec::new()
    };

    let active_plans: Vec<ActivePlanBrief> = sqlx::query_as::<_, ActivePlanBrief>(
        r#"
        SELECT pp.plan_id, pp.description, pp.total_cents,
               COALESCE(sum(p.amount_cents), 0)::bigint AS paid_cents,
               (pp.total_cents - COALESCE(sum(p.amount_cents), 0))::bigint AS balance_cents
        FROM payment_plan pp
        LEFT JOIN payment p ON p.plan_id = pp.plan_id
        WHERE pp.patient_id = $1 AND pp.status = 0
        GROUP BY pp.plan_id
        ORDER BY pp.created_at ASC
        "#,
    )
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let balance = load_balance(&state, patient_id).await?;

    Ok(Json(ApiOk::new(PatientSummary {
        patient,
        upcoming_appointments,
        recent_consultations,
        active_plans,
        balance,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_terms_match_wildcards_literally() {
        assert_eq!(contains_pattern("ana"), "%ana%");
        assert_eq!(contains_pattern("_"), "%\\_%");
        assert_eq!(contains_pattern("50%"), "%50\\%%");
        assert_eq!(contains_pattern(r"a\b"), r"%a\\b%");
    }

    #[test]
    fn names_are_trimmed_and_required() {
        assert_eq!(require_name("first_name", "  Ana ").unwrap(), "Ana");
        assert!(require_name("first_name", "   ").is_err());
        assert!(require_name("last_name", &"x".repeat(101)).is_err());
    }

    #[test]
    fn gender_codes() {
        assert!(validate_gender(0).is_ok());
        assert!(validate_gender(2).is_ok());
        assert!(validate_gender(3).is_err());
        assert!(validate_gender(-1).is_err());
    }

    #[test]
    fn email_shape() {
        assert!(validate_email(None).is_ok());
        assert!(validate_email(Some("ana@example.com")).is_ok());
        assert!(validate_email(Some("ana.example.com")).is_err());
        assert!(validate_email(Some("@example.com")).is_err());
        assert!(validate_email(Some("ana@localhost")).is_err());
    }

    #[test]
    fn birthday_cannot_be_future() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert!(validate_birthday(NaiveDate::from_ymd_opt(2024, 6, 2), today).is_err());
        assert!(validate_birthday(NaiveDate::from_ymd_opt(1990, 1, 1), today).is_ok());
        assert!(validate_birthday(None, today).is_ok());
    }
}
