// src/routes/radiography_routes.rs

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean_opt, ApiOk, AppState, Capability, OkData},
    radiography::{
        check_size, resolve_content_type, sanitize_file_name, validate_detections, DetectionInput,
        DetectionSource, RadiographError, RadiographKind,
    },
    routes::patient_routes::ensure_patient,
};

/// Room for the multipart framing and text fields around the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/patients/{patient_id}/radiographs",
            get(list_radiographs)
                .post(upload_radiograph)
                .layer(DefaultBodyLimit::max(max_upload_bytes + MULTIPART_OVERHEAD)),
        )
        .route(
            "/radiographs/{radiograph_id}",
            get(get_radiograph).delete(delete_radiograph),
        )
        .route("/radiographs/{radiograph_id}/file", get(download_file))
        .route(
            "/radiographs/{radiograph_id}/detections",
            get(list_detections).put(replace_detections),
        )
}

/* ============================================================
   Rows / DTOs
   ============================================================ */

#[derive(Debug, sqlx::FromRow)]
pub struct RadiographRow {
    pub radiograph_id: Uuid,
    pub patient_id: Uuid,
    pub consultation_id: Option<Uuid>,
    pub kind: i16,
    pub taken_at: DateTime<Utc>,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub storage_key: String,
    pub note: Option<String>,
    pub uploaded_by: Uuid,
    pub created_at: DateTime<Utc>,
}

pub(crate) const RADIOGRAPH_COLUMNS: &str = "radiograph_id, patient_id, consultation_id, kind, taken_at, \
     file_name, content_type, size_bytes, sha256, storage_key, note, uploaded_by, created_at";

#[derive(Debug, Serialize)]
pub struct RadiographDto {
    pub radiograph_id: Uuid,
    pub patient_id: Uuid,
    pub consultation_id: Option<Uuid>,
    pub kind: RadiographKind,
    pub taken_at: DateTime<Utc>,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub note: Option<String>,
    pub uploaded_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RadiographRow> for RadiographDto {
    type Error = ApiError;

    fn try_from(r: RadiographRow) -> Result<Self, Self::Error> {
        let kind = RadiographKind::from_code(r.kind)
            .ok_or_else(|| ApiError::Internal(format!("unknown radiograph kind {}", r.kind)))?;
        Ok(RadiographDto {
            radiograph_id: r.radiograph_id,
            patient_id: r.patient_id,
            consultation_id: r.consultation_id,
            kind,
            taken_at: r.taken_at,
            file_name: r.file_name,
            content_type: r.content_type,
            size_bytes: r.size_bytes,
            sha256: r.sha256,
            note: r.note,
            uploaded_by: r.uploaded_by,
            created_at: r.created_at,
        })
    }
}

async fn fetch_row(state: &AppState, radiograph_id: Uuid) -> Result<RadiographRow, ApiError> {
    sqlx::query_as::<_, RadiographRow>(&format!(
        "SELECT {RADIOGRAPH_COLUMNS} FROM radiograph WHERE radiograph_id = $1"
    ))
    .bind(radiograph_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("radiograph"))
}

/* ============================================================
   Upload
   ============================================================ */

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(e.body_text())
    } else {
        ApiError::BadRequest("INVALID_MULTIPART", e.body_text())
    }
}

#[derive(Debug, Default)]
struct UploadForm {
    file: Option<UploadedFile>,
    kind: Option<String>,
    taken_at: Option<String>,
    consultation_id: Option<String>,
    note: Option<String>,
}

#[derive(Debug)]
struct UploadedFile {
    file_name: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                form.file = Some(UploadedFile {
                    file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            "kind" => form.kind = Some(field.text().await.map_err(multipart_error)?),
            "taken_at" => form.taken_at = Some(field.text().await.map_err(multipart_error)?),
            "consultation_id" => {
                form.consultation_id = Some(field.text().await.map_err(multipart_error)?)
            }
            "note" => form.note = Some(field.text().await.map_err(multipart_error)?),
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }
    Ok(form)
}

struct UploadMeta {
    kind: RadiographKind,
    taken_at: Option<DateTime<Utc>>,
    consultation_id: Option<Uuid>,
    note: Option<String>,
}

fn parse_meta(form: &UploadForm) -> Result<UploadMeta, ApiError> {
    let kind = match clean_opt(form.kind.clone()) {
        Some(raw) => RadiographKind::parse(&raw)
            .ok_or_else(|| ApiError::validation(format!("unknown radiograph kind {raw:?}")))?,
        None => RadiographKind::Other,
    };
    let taken_at = clean_opt(form.taken_at.clone())
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| ApiError::validation("taken_at must be an RFC 3339 timestamp"))
        })
        .transpose()?;
    let consultation_id = clean_opt(form.consultation_id.clone())
        .map(|raw| {
            Uuid::parse_str(&raw).map_err(|_| ApiError::validation("consultation_id is not a UUID"))
        })
        .transpose()?;
    Ok(UploadMeta {
        kind,
        taken_at,
        consultation_id,
        note: clean_opt(form.note.clone()),
    })
}

pub async fn upload_radiograph(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<Json<ApiOk<RadiographDto>>, ApiError> {
    auth.require(Capability::RadiographUpload)?;
    ensure_patient(&state, patient_id).await?;

    let form = read_form(multipart).await?;
    let meta = parse_meta(&form)?;
    let file = form
        .file
        .ok_or_else(|| ApiError::validation("multipart field `file` is required"))?;

    check_size(file.bytes.len(), state.max_upload_bytes)?;
    let content_type = resolve_content_type(file.content_type.as_deref(), &file.bytes)?;
    let file_name = sanitize_file_name(file.file_name.as_deref());

    if let Some(consultation_id) = meta.consultation_id {
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

    let stored = state
        .store
        .put(&file.bytes)
        .await
        .map_err(RadiographError::from)?;

    let row: RadiographRow = sqlx::query_as::<_, RadiographRow>(&format!(
        r#"
        INSERT INTO radiograph (
            patient_id, consultation_id, kind, taken_at, file_name, content_type,
            size_bytes, sha256, storage_key, note, uploaded_by
        )
        VALUES ($1, $2, $3, COALESCE($4, now()), $5, $6, $7, $8, $9, $10, $11)
        RETURNING {RADIOGRAPH_COLUMNS}
        "#
    ))
    .bind(patient_id)
    .bind(meta.consultation_id)
    .bind(meta.kind.code())
    .bind(meta.taken_at)
    .bind(file_name)
    .bind(content_type)
    .bind(stored.size_bytes)
    .bind(&stored.sha256)
    .bind(&stored.key)
    .bind(meta.note)
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(
        radiograph_id = %row.radiograph_id,
        %patient_id,
        size = stored.size_bytes,
        sha256 = %stored.sha256,
        by = %auth.user_id,
        "radiograph uploaded"
    );
    Ok(Json(ApiOk::new(row.try_into()?)))
}

/* ============================================================
   Read / delete
   ============================================================ */

pub async fn list_radiographs(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<RadiographDto>>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;
    ensure_patient(&state, patient_id).await?;

    let rows: Vec<RadiographRow> = sqlx::query_as::<_, RadiographRow>(&format!(
        r#"
        SELECT {RADIOGRAPH_COLUMNS}
        FROM radiograph
        WHERE patient_id = $1
        ORDER BY taken_at DESC, created_at DESC
        "#
    ))
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let out = rows
        .into_iter()
        .map(RadiographDto::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiOk::new(out)))
}

pub async fn get_radiograph(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(radiograph_id): Path<Uuid>,
) -> Result<Json<ApiOk<RadiographDto>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;
    Ok(Json(ApiOk::new(fetch_row(&state, radiograph_id).await?.try_into()?)))
}

fn content_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| if c == '"' || c == '\\' || !c.is_ascii() { '_' } else { c })
        .collect();
    format!("inline; filename=\"{safe}\"")
}

pub async fn download_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(radiograph_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    auth.require(Capability::ClinicalRead)?;

    let row = fetch_row(&state, radiograph_id).await?;
    let bytes = state
        .store
        .get(&row.storage_key)
        .await
        .map_err(RadiographError::from)?;

    Ok((
        [
            (header::CONTENT_TYPE, row.content_type),
            (header::CONTENT_DISPOSITION, content_disposition(&row.file_name)),
        ],
        bytes,
    )
        .into_response())
}

/// Removes the row; the file goes too once no other row shares its hash.
pub async fn delete_radiograph(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(radiograph_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let (storage_key, sha256): (String, String) = sqlx::query_as(
        "DELETE FROM radiograph WHERE radiograph_id = $1 RETURNING storage_key, sha256",
    )
    .bind(radiograph_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("radiograph"))?;

    let still_referenced: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM radiograph WHERE sha256 = $1)")
            .bind(&sha256)
            .fetch_one(&mut *tx)
            .await
            .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    if !still_referenced {
        if let Err(e) = state.store.delete(&storage_key).await {
            tracing::warn!(%radiograph_id, key = %storage_key, error = %e, "radiograph file left behind");
        }
    }

    tracing::info!(%radiograph_id, file_removed = !still_referenced, by = %auth.user_id, "radiograph deleted");
    Ok(Json(ApiOk::new(OkData { ok: true })))
}

/* ============================================================
   Detections
   ============================================================ */

#[derive(Debug, sqlx::FromRow)]
struct DetectionRow {
    detection_id: Uuid,
    label: String,
    confidence: f64,
    box_x: f64,
    box_y: f64,
    box_w: f64,
    box_h: f64,
    tooth: Option<i16>,
    source: i16,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Serialize)]
pub struct DetectionDto {
    pub detection_id: Uuid,
    pub label: String,
    pub confidence: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub tooth: Option<i16>,
    pub source: DetectionSource,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DetectionRow> for DetectionDto {
    type Error = ApiError;

    fn try_from(r: DetectionRow) -> Result<Self, Self::Error> {
        let source = DetectionSource::from_code(r.source)
            .ok_or_else(|| ApiError::Internal(format!("unknown detection source {}", r.source)))?;
        Ok(DetectionDto {
            detection_id: r.detection_id,
            label: r.label,
            confidence: r.confidence,
            bbox: BoundingBox {
                x: r.box_x,
                y: r.box_y,
                w: r.box_w,
                h: r.box_h,
            },
            tooth: r.tooth,
            source,
            created_at: r.created_at,
        })
    }
}

async fn load_detections(state: &AppState, radiograph_id: Uuid) -> Result<Vec<DetectionDto>, ApiError> {
    let rows: Vec<DetectionRow> = sqlx::query_as::<_, DetectionRow>(
        r#"
        SELECT detection_id, label, confidence, box_x, box_y, box_w, box_h, tooth, source, created_at
        FROM radiograph_detection
        WHERE radiograph_id = $1
        ORDER BY source ASC, confidence DESC, detection_id ASC
        "#,
    )
    .bind(radiograph_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    rows.into_iter().map(DetectionDto::try_from).collect()
}

pub async fn list_detections(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(radiograph_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<DetectionDto>>>, ApiError> {
    auth.require(Capability::ClinicalRead)?;
    fetch_row(&state, radiograph_id).await?;
    Ok(Json(ApiOk::new(load_detections(&state, radiograph_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct ReplaceDetectionsRequest {
    pub source: DetectionSource,
    pub detections: Vec<DetectionInput>,
}

/// Replace every detection of one source; the other source is untouched.
pub async fn replace_detections(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(radiograph_id): Path<Uuid>,
    Json(req): Json<ReplaceDetectionsRequest>,
) -> Result<Json<ApiOk<Vec<DetectionDto>>>, ApiError> {
    auth.require(Capability::ClinicalWrite)?;
    validate_detections(&req.detections)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let exists: Option<Uuid> = sqlx::query_scalar(
        "SELECT radiograph_id FROM radiograph WHERE radiograph_id = $1 FOR UPDATE",
    )
    .bind(radiograph_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    if exists.is_none() {
        return Err(ApiError::not_found("radiograph"));
    }

    sqlx::query("DELETE FROM radiograph_detection WHERE radiograph_id = $1 AND source = $2")
        .bind(radiograph_id)
        .bind(req.source.code())
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    for d in &req.detections {
        sqlx::query(
            r#"
            INSERT INTO radiograph_detection (
                radiograph_id, label, confidence, box_x, box_y, box_w, box_h, tooth, source, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(radiograph_id)
        .bind(d.label.trim())
        .bind(d.confidence)
        .bind(d.x)
        .bind(d.y)
        .bind(d.w)
        .bind(d.h)
        .bind(d.tooth)
        .bind(req.source.code())
        .bind(auth.user_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%radiograph_id, source = ?req.source, count = req.detections.len(), by = %auth.user_id, "detections replaced");
    Ok(Json(ApiOk::new(load_detections(&state, radiograph_id).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(kind: Option<&str>, taken_at: Option<&str>, consultation_id: Option<&str>) -> UploadForm {
        UploadForm {
            file: None,
            kind: kind.map(str::to_string),
            taken_at: taken_at.map(str::to_string),
            consultation_id: consultation_id.map(str::to_string),
            note: Some("  ".into()),
        }
    }

    #[test]
    fn meta_defaults() {
        let meta = parse_meta(&form(None, None, None)).unwrap();
        assert_eq!(meta.kind, RadiographKind::Other);
        assert!(meta.taken_at.is_none());
        assert!(meta.consultation_id.is_none());
        assert!(meta.note.is_none());
    }

    #[test]
    fn meta_parses_fields() {
        let meta = parse_meta(&form(
            Some("Panoramic"),
            Some("2024-03-01T10:15:00+02:00"),
            Some("00000000-0000-0000-0000-000000000001"),
        ))
        .unwrap();
        assert_eq!(meta.kind, RadiographKind::Panoramic);
        assert_eq!(meta.taken_at.unwrap().to_rfc3339(), "2024-03-01T08:15:00+00:00");
        assert_eq!(meta.consultation_id, Some(Uuid::from_u128(1)));
    }

    #[test]
    fn meta_rejects_garbage() {
        assert!(parse_meta(&form(Some("xray"), None, None)).is_err());
        assert!(parse_meta(&form(None, Some("yesterday"), None)).is_err());
        assert!(parse_meta(&form(None, None, Some("42"))).is_err());
    }

    #[test]
    fn disposition_quotes_are_neutralized() {
        assert_eq!(content_disposition("pano.png"), "inline; filename=\"pano.png\"");
        assert_eq!(content_disposition("a\"b.png"), "inline; filename=\"a_b.png\"");
        assert_eq!(content_disposition("ñ.png"), "inline; filename=\"_.png\"");
    }
}
