// src/routes/odontogram_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean_opt, ApiOk, AppState, Capability},
    odontogram::{build_chart, validate_entry, Chart, ChartEntry, Dentition, DiagnosisScope, Face, Tooth},
    routes::patient_routes::ensure_patient,
};

/// Entry joined with its diagnosis; columns line up with `ChartEntry`.
pub(crate) const ENTRY_SELECT: &str = r#"
    SELECT e.entry_id, e.tooth, e.face, e.diagnosis_id,
           d.code AS diagnosis_code, d.name AS diagnosis_name, d.color,
           e.consultation_id, e.note, e.recorded_at
    FROM odontogram_entry e
    JOIN dental_diagnosis d ON d.diagnosis_id = e.diagnosis_id
"#;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients/{patient_id}/odontogram", get(get_chart))
        .route("/patients/{patient_id}/odontogram/entries", post(add_entry))
        .route(
            "/patients/{patient_id}/odontogram/teeth/{tooth}/history",
            get(tooth_history),
        )
        .route("/odontogram/entries/{entry_id}", delete(remove_entry))
        .route("/diagnoses", get(list_diagnoses).post(create_diagnosis))
}

/* ============================================================
   Diagnosis catalog
   ============================================================ */

#[derive(Debug, sqlx::FromRow)]
struct DiagnosisRow {
    diagnosis_id: Uuid,
    code: String,
    name: String,
    color: String,
    scope: i16,
}

#[derive(Debug, Serialize)]
pub struct DiagnosisDto {
    pub diagnosis_id: Uuid,
    pub code: String,
    pub name: String,
    pub color: String,
    pub scope: DiagnosisScope,
}

impl TryFrom<DiagnosisRow> for DiagnosisDto {
    type Error = ApiError;

    fn try_from(r: DiagnosisRow) -> Result<Self, Self::Error> {
        let scope = DiagnosisScope::from_code(r.scope)
            .ok_or_else(|| ApiError::Internal(format!("unknown diagnosis scope {}", r.scope)))?;
        Ok(DiagnosisDto {
            diagnosis_id: r.diagnosis_id,
            code: r.code,
            name: r.name,
            color: r.color,
            scope,
        })
    }
}

/// `#RRGGBB`, stored lower-case.
fn validate_color(raw: &str) -> Result<String, ApiError> {
    let c = raw.trim();
    let ok = c.len() == 7
        && c.starts_with('#')
        && c[1..].chars().all(|ch| ch.is_ascii_hexdigit());
    if !ok {
        return Err(ApiError::validation("color must look like #RRGGBB"));
    }
    Ok(c.to_ascii_lowercase())
}

pub async fn list_diagnoses(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<DiagnosisDto>>>, ApiError> {
    let rows: Vec<DiagnosisRow> = sqlx::query_as::<_, DiagnosisRow>(
        r#"
        SELECT diagnosis_id, code, name, color, scope
        FROM dental_diagnosis
        ORDER BY scope ASC, code ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let out = rows
        .into_iter()
        .map(DiagnosisDto::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiOk::new(out)))
}

#[derive(Debug, Deserialize)]
pub struct CreateDiagnosisRequest {
    pub code: String,
    pub name: String,
    pub color: String,
    pub scope: DiagnosisScope,
}

pub async fn create_diagnosis(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateDiagnosisRequest>,
) -> Result<Json<ApiOk<DiagnosisDto>>, ApiError> {
    auth.require(Capability::CatalogWrite)?;

    let code = req.code.trim().to_ascii_uppercase();
    if code.is_empty() || code.len() > 16 {
        return Err(ApiError::validation("code must be 1 to 16 characters"));
    }
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let color = validate_color(&req.color)?;

    let row: DiagnosisRow = sqlx::query_as::<_, DiagnosisRow>(
        r#"
        INSERT INTO dental_diagnosis (code, name, color, scope)
        VALUES ($1, $2, $3, $4)
        RETURNING diagnosis_id, code, name, color, scope
        "#,
    )
    .bind(&code)
    .bind(name)
    .bind(color)
    .bind(req.scope.code())
    .fetch_one(&state.db)
    .await
    .map_err(|e| match ApiError::db(e) {
        ApiError::Conflict(..) => {
            ApiError::Conflict("CODE_TAKEN", format!("diagnosis code {code} already exists"))
        }
        other => other,
    })?;

    tracing::info!(diagnosis_id = %row.diagnosis_id, code = %row.code, by = %auth.user_id, "diagnosis created");
    Ok(Json(ApiOk::new(row.try_into()?)))
}

/* ============================================================
   Chart
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ChartQuery {
    pub dentition: Option<String>,
}

pub async fn get_chart(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Query(q): Query<ChartQuery>,
) -> Result<Json<ApiOk<Chart>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;
    let dentition = Dentition::parse(q.dentition.as_deref())?;
    ensure_patient(&state, patient_id).await?;

    let entries: Vec<ChartEntry> = sqlx::query_as::<_, ChartEntry>(&format!(
        r#"
        {ENTRY_SELECT}
        WHERE e.patient_id = $1
          AND e.removed_at IS NULL
        ORDER BY e.recorded_at ASC, e.entry_id ASC
        "#
    ))
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(build_chart(dentition, entries))))
}

/// A single entry with its face named for the tooth it sits on.
#[derive(Debug, Serialize)]
pub struct EntryView {
    pub entry_id: Uuid,
    pub tooth: i16,
    pub face: Option<Face>,
    pub face_label: Option<&'static str>,
    pub diagnosis_id: Uuid,
    pub diagnosis_code: String,
    pub diagnosis_name: String,
    pub color: String,
    pub consultation_id: Option<Uuid>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<ChartEntry> for EntryView {
    type Error = ApiError;

    fn try_from(e: ChartEntry) -> Result<Self, Self::Error> {
        let tooth = Tooth::new(e.tooth)?;
        let face = e.face.map(Face::from_code).transpose()?;
        Ok(EntryView {
            entry_id: e.entry_id,
            tooth: tooth.number(),
            face,
            face_label: face.map(|f| f.label_for(tooth)),
            diagnosis_id: e.diagnosis_id,
            diagnosis_code: e.diagnosis_code,
            diagnosis_name: e.diagnosis_name,
            color: e.color,
            consultation_id: e.consultation_id,
            note: e.note,
            recorded_at: e.recorded_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AddEntryRequest {
    pub tooth: i16,
    pub face: Option<Face>,
    pub diagnosis_id: Uuid,
    pub consultation_id: Option<Uuid>,
    pub note: Option<String>,
}

pub async fn add_entry(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<AddEntryRequest>,
) -> Result<Json<ApiOk<EntryView>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;
    let tooth = Tooth::new(req.tooth)?;
    ensure_patient(&state, patient_id).await?;

    let diagnosis: DiagnosisDto = sqlx::query_as::<_, DiagnosisRow>(
        "SELECT diagnosis_id, code, name, color, scope FROM dental_diagnosis WHERE diagnosis_id = $1",
    )
    .bind(req.diagnosis_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("diagnosis"))?
    .try_into()?;

    validate_entry(&diagnosis.code, diagnosis.scope, req.face)?;

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

    let entry_id: Uuid = sqlx::query_scalar(
        "SELECT entry_id FROM odontogram_add_entry($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(patient_id)
    .bind(tooth.number())
    .bind(req.face.map(Face::code))
    .bind(diagnosis.diagnosis_id)
    .bind(req.consultation_id)
    .bind(clean_opt(req.note))
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    let entry: ChartEntry = sqlx::query_as::<_, ChartEntry>(&format!(
        "{ENTRY_SELECT} WHERE e.entry_id = $1"
    ))
    .bind(entry_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(%entry_id, %patient_id, tooth = tooth.number(), code = %diagnosis.code, by = %auth.user_id, "odontogram entry added");
    Ok(Json(ApiOk::new(entry.try_into()?)))
}

pub async fn remove_entry(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<ApiOk<crate::models::OkData>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;

    let removed: Option<Uuid> = sqlx::query_scalar(
        "SELECT entry_id FROM odontogram_remove_entry($1, $2)",
    )
    .bind(entry_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    if removed.is_none() {
        return Err(ApiError::not_found("active odontogram entry"));
    }

    tracing::info!(%entry_id, by = %auth.user_id, "odontogram entry removed");
    Ok(Json(ApiOk::new(crate::models::OkData { ok: true })))
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    #[sqlx(flatten)]
    entry: ChartEntry,
    recorded_by_name: String,
    removed_at: Option<DateTime<Utc>>,
    removed_by_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    #[serde(flatten)]
    pub entry: EntryView,
    pub recorded_by_name: String,
    pub removed_at: Option<DateTime<Utc>>,
    pub removed_by_name: Option<String>,
}

/// Every entry ever recorded on one tooth, removed ones included, newest first.
pub async fn tooth_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((patient_id, tooth)): Path<(Uuid, i16)>,
) -> Result<Json<ApiOk<Vec<HistoryItem>>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;
    let tooth = Tooth::new(tooth)?;
    ensure_patient(&state, patient_id).await?;

    let rows: Vec<HistoryRow> = sqlx::query_as::<_, HistoryRow>(
        r#"
        SELECT e.entry_id, e.tooth, e.face, e.diagnosis_id,
               d.code AS diagnosis_code, d.name AS diagnosis_name, d.color,
               e.consultation_id, e.note, e.recorded_at,
               rb.display_name AS recorded_by_name,
               e.removed_at,
               xb.display_name AS removed_by_name
        FROM odontogram_entry e
        JOIN dental_diagnosis d ON d.diagnosis_id = e.diagnosis_id
        JOIN staff_user rb ON rb.user_id = e.recorded_by
        LEFT JOIN staff_user xb ON xb.user_id = e.removed_by
        WHERE e.patient_id = $1 AND e.tooth = $2
        ORDER BY e.recorded_at DESC, e.entry_id DESC
        "#,
    )
    .bind(patient_id)
    .bind(tooth.number())
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let items = rows
        .into_iter()
        .map(|r| {
            Ok(HistoryItem {
                entry: r.entry.try_into()?,
                recorded_by_name: r.recorded_by_name,
                removed_at: r.removed_at,
                removed_by_name: r.removed_by_name,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(ApiOk::new(items)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tooth: i16, face: Option<i16>) -> ChartEntry {
        ChartEntry {
            entry_id: Uuid::new_v4(),
            tooth,
            face,
            diagnosis_id: Uuid::new_v4(),
            diagnosis_code: "CAR".into(),
            diagnosis_name: "Caries".into(),
            color: "#d32f2f".into(),
            consultation_id: None,
            note: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn colors_are_hex_triplets() {
        assert_eq!(validate_color(" #A1B2C3 ").unwrap(), "#a1b2c3");
        assert!(validate_color("a1b2c3").is_err());
        assert!(validate_color("#a1b2c").is_err());
        assert!(validate_color("#zzzzzz").is_err());
    }

    #[test]
    fn entry_view_names_faces_for_the_tooth() {
        let upper_incisor: EntryView = entry(11, Some(1)).try_into().unwrap();
        assert_eq!(upper_incisor.face, Some(Face::Lingual));
        assert_eq!(upper_incisor.face_label, Some("palatal"));

        let lower_molar: EntryView = entry(36, Some(4)).try_into().unwrap();
        assert_eq!(lower_molar.face_label, Some("occlusal"));

        let whole: EntryView = entry(46, None).try_into().unwrap();
        assert_eq!(whole.face, None);
        assert_eq!(whole.face_label, None);
    }

    #[test]
    fn entry_view_rejects_bad_stored_values() {
        assert!(EntryView::try_from(entry(19, None)).is_err());
        assert!(EntryView::try_from(entry(11, Some(9))).is_err());
    }
}
