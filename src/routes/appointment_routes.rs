// src/routes/appointment_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    calendar::{
        check_transition, clinic_today, fold_rows, local_day_range, parse_date, validate_window,
        AppointmentBlock, AppointmentJoinRow, AppointmentStatus, CalendarError,
    },
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean_opt, deserialize_double_option, patch_opt_text, ApiOk, AppState, Capability, Paging, Role},
    routes::patient_routes::ensure_patient,
};

/// Appointment joined with patient, dentist and planned treatments.
/// Callers append their own WHERE / ORDER BY.
pub(crate) const APPOINTMENT_SELECT: &str = r#"
    SELECT
      a.appointment_id,
      a.start_at,
      a.end_at,
      a.status,
      a.reason,
      a.note,
      a.color,

      p.patient_id,
      p.first_name AS p_first,
      p.last_name  AS p_last,
      p.record_number AS p_record,

      a.dentist_id,
      d.display_name AS d_name,

      api.treatment_id AS item_treatment_id,
      tc.code AS item_code,
      tc.name AS item_name,
      api.qty AS item_qty

    FROM appointment a
    JOIN patient p ON p.patient_id = a.patient_id
    JOIN staff_user d ON d.user_id = a.dentist_id
    LEFT JOIN appointment_plan_item api ON api.appointment_id = a.appointment_id
    LEFT JOIN treatment_catalog tc ON tc.treatment_id = api.treatment_id
"#;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route("/appointments/today", get(list_today))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment).patch(update_appointment),
        )
        .route("/appointments/{appointment_id}/status", post(change_status))
        .route("/appointments/{appointment_id}/plan_items", put(put_plan_items))
        .route("/patients/{patient_id}/appointments", get(list_patient_appointments))
}

/* ============================================================
   Access
   ============================================================ */

/// Front desk and clinical staff can read the calendar.
fn ensure_calendar_view(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.can(Capability::AppointmentsManage) || auth.can(Capability::ClinicalRead) {
        Ok(())
    } else {
        auth.require(Capability::AppointmentsManage)
    }
}

/// Dentists without an explicit filter see their own calendar.
fn resolve_dentist_filter(auth: &AuthContext, requested: Option<Uuid>) -> Option<Uuid> {
    match requested {
        Some(id) => Some(id),
        None if auth.is_dentist() => Some(auth.user_id),
        None => None,
    }
}

async fn ensure_dentist(state: &AppState, dentist_id: Uuid) -> Result<(), ApiError> {
    let ok: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM staff_user
            WHERE user_id = $1 AND role = $2 AND is_active = true
        )
        "#,
    )
    .bind(dentist_id)
    .bind(Role::Dentist.code())
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    if ok {
        Ok(())
    } else {
        Err(ApiError::BadRequest(
            "INVALID_DENTIST",
            "dentist_id does not refer to an active dentist".into(),
        ))
    }
}

/// Takes a per-dentist transaction lock before checking, so concurrent
/// bookings for the same chair are checked one after the other.
async fn ensure_free_slot(
    conn: &mut PgConnection,
    dentist_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    exclude: Option<Uuid>,
) -> Result<(), ApiError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
        .bind(dentist_id)
        .execute(&mut *conn)
        .await
        .map_err(ApiError::db)?;

    let overlaps: bool = sqlx::query_scalar("SELECT appointment_overlaps($1, $2, $3, $4, $5)")
        .bind(dentist_id)
        .bind(start_at)
        .bind(end_at)
        .bind(exclude)
        .bind(AppointmentStatus::blocking_codes())
        .fetch_one(&mut *conn)
        .await
        .map_err(ApiError::db)?;

    if overlaps {
        tracing::warn!(%dentist_id, %start_at, %end_at, "appointment overlap rejected");
        return Err(CalendarError::Overlap.into());
    }
    Ok(())
}

async fn fetch_block(state: &AppState, appointment_id: Uuid) -> Result<AppointmentBlock, ApiError> {
    let rows: Vec<AppointmentJoinRow> = sqlx::query_as::<_, AppointmentJoinRow>(&format!(
        r#"
        {APPOINTMENT_SELECT}
        WHERE a.appointment_id = $1
        ORDER BY tc.code ASC
        "#
    ))
    .bind(appointment_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    fold_rows(rows)?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::not_found("appointment"))
}

async fn fetch_range(
    state: &AppState,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    dentist_id: Option<Uuid>,
) -> Result<Vec<AppointmentBlock>, ApiError> {
    let rows: Vec<AppointmentJoinRow> = sqlx::query_as::<_, AppointmentJoinRow>(&format!(
        r#"
        {APPOINTMENT_SELECT}
        WHERE a.start_at >= $1
          AND a.start_at <  $2
          AND ($3::uuid IS NULL OR a.dentist_id = $3)
        ORDER BY a.start_at ASC, d.display_name ASC, tc.code ASC
        "#
    ))
    .bind(start)
    .bind(end)
    .bind(dentist_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(fold_rows(rows)?)
}

/* ============================================================
   Listing
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    /// YYYY-MM-DD in clinic local time; defaults to today.
    pub from: Option<String>,
    pub days: Option<i64>,
    pub dentist_id: Option<Uuid>,
}

pub async fn list_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<RangeQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentBlock>>>, ApiError> {
    ensure_calendar_view(&auth)?;

    let first = match q.from.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => clinic_today(state.clinic_tz_offset_minutes),
    };
    let (start, end) = local_day_range(first, q.days.unwrap_or(7), state.clinic_tz_offset_minutes)?;
    let dentist_id = resolve_dentist_filter(&auth, q.dentist_id);

    Ok(Json(ApiOk::new(fetch_range(&state, start, end, dentist_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct TodayQuery {
    pub dentist_id: Option<Uuid>,
}

pub async fn list_today(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<TodayQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentBlock>>>, ApiError> {
    ensure_calendar_view(&auth)?;

    let today = clinic_today(state.clinic_tz_offset_minutes);
    let (start, end) = local_day_range(today, 1, state.clinic_tz_offset_minutes)?;
    let dentist_id = resolve_dentist_filter(&auth, q.dentist_id);

    Ok(Json(ApiOk::new(fetch_range(&state, start, end, dentist_id).await?)))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentBlock>>, ApiError> {
    ensure_calendar_view(&auth)?;
    Ok(Json(ApiOk::new(fetch_block(&state, appointment_id).await?)))
}

pub async fn list_patient_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Query(paging): Query<Paging>,
) -> Result<Json<ApiOk<Vec<AppointmentBlock>>>, ApiError> {
    auth.require(Capability::PatientsRead)?;
    ensure_patient(&state, patient_id).await?;

    let (limit, offset) = paging.resolve();
    let rows: Vec<AppointmentJoinRow> = sqlx::query_as::<_, AppointmentJoinRow>(&format!(
        r#"
        {APPOINTMENT_SELECT}
        WHERE a.appointment_id IN (
            SELECT appointment_id
            FROM appointment
            WHERE patient_id = $1
            ORDER BY start_at DESC
            LIMIT $2 OFFSET $3
        )
        ORDER BY a.start_at DESC, tc.code ASC
        "#
    ))
    .bind(patient_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(fold_rows(rows)?)))
}

/* ============================================================
   Create / update
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PlanItemInput {
    pub treatment_id: Uuid,
    pub qty: Option<i32>,
    pub note: Option<String>,
}

fn validate_plan_items(items: &[PlanItemInput]) -> Result<(), ApiError> {
    if items.len() > 50 {
        return Err(ApiError::validation("too many planned treatments (max 50)"));
    }
    for (i, it) in items.iter().enumerate() {
        if it.qty.is_some_and(|q| q < 1) {
            return Err(ApiError::validation(format!("plan_items[{i}].qty must be at least 1")));
        }
        if items[..i].iter().any(|prev| prev.treatment_id == it.treatment_id) {
            return Err(ApiError::validation(format!(
                "plan_items[{i}] repeats treatment {}",
                it.treatment_id
            )));
        }
    }
    Ok(())
}

async fn insert_plan_items(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    appointment_id: Uuid,
    items: Vec<PlanItemInput>,
) -> Result<(), ApiError> {
    for it in items {
        sqlx::query(
            r#"
            INSERT INTO appointment_plan_item (appointment_id, treatment_id, qty, note)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(appointment_id)
        .bind(it.treatment_id)
        .bind(it.qty.unwrap_or(1))
        .bind(clean_opt(it.note))
        .execute(&mut **tx)
        .await
        .map_err(ApiError::db)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub patient_id: Uuid,
    pub dentist_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub color: Option<i32>,
    #[serde(default)]
    pub plan_items: Vec<PlanItemInput>,
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentBlock>>, ApiError> {
    auth.require(Capability::AppointmentsManage)?;

    validate_window(req.start_at, req.end_at)?;
    validate_plan_items(&req.plan_items)?;
    ensure_patient(&state, req.patient_id).await?;
    ensure_dentist(&state, req.dentist_id).await?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    ensure_free_slot(&mut tx, req.dentist_id, req.start_at, req.end_at, None).await?;

    let appointment_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO appointment (patient_id, dentist_id, start_at, end_at, reason, note, color, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING appointment_id
        "#,
    )
    .bind(req.patient_id)
    .bind(req.dentist_id)
    .bind(req.start_at)
    .bind(req.end_at)
    .bind(clean_opt(req.reason))
    .bind(clean_opt(req.note))
    .bind(req.color)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    insert_plan_items(&mut tx, appointment_id, req.plan_items).await?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%appointment_id, dentist_id = %req.dentist_id, by = %auth.user_id, "appointment created");
    Ok(Json(ApiOk::new(fetch_block(&state, appointment_id).await?)))
}

#[derive(Debug, sqlx::FromRow)]
struct AppointmentCore {
    dentist_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    status: i16,
}

async fn fetch_core(state: &AppState, appointment_id: Uuid) -> Result<AppointmentCore, ApiError> {
    sqlx::query_as::<_, AppointmentCore>(
        "SELECT dentist_id, start_at, end_at, status FROM appointment WHERE appointment_id = $1",
    )
    .bind(appointment_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment"))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppointmentRequest {
    pub dentist_id: Option<Uuid>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub reason: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub note: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub color: Option<Option<i32>>,
}

impl UpdateAppointmentRequest {
    fn reschedules(&self) -> bool {
        self.dentist_id.is_some() || self.start_at.is_some() || self.end_at.is_some()
    }

    fn into_patch(self) -> AppointmentPatch {
        let rescheduled = self.reschedules();
        AppointmentPatch {
            rescheduled,
            dentist_id: self.dentist_id,
            start_at: self.start_at,
            end_at: self.end_at,
            reason: self.reason.map(clean_opt),
            note: self.note,
            color: self.color,
        }
    }
}

/// Update request with text cleaned. Outer `None` leaves a column as is.
#[derive(Debug)]
struct AppointmentPatch {
    rescheduled: bool,
    dentist_id: Option<Uuid>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    reason: Option<Option<String>>,
    note: Option<Option<String>>,
    color: Option<Option<i32>>,
}

pub async fn update_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<UpdateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentBlock>>, ApiError> {
    auth.require(Capability::AppointmentsManage)?;

    let patch = req.into_patch();
    let rescheduled = patch.rescheduled;
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let core = sqlx::query_as::<_, AppointmentCore>(
        "SELECT dentist_id, start_at, end_at, status FROM appointment WHERE appointment_id = $1 FOR UPDATE",
    )
    .bind(appointment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;
    let status = AppointmentStatus::from_code(core.status)?;

    let dentist_id = patch.dentist_id.unwrap_or(core.dentist_id);
    let start_at = patch.start_at.unwrap_or(core.start_at);
    let end_at = patch.end_at.unwrap_or(core.end_at);

    if rescheduled {
        if status.is_terminal() {
            return Err(ApiError::Conflict(
                "APPOINTMENT_CLOSED",
                format!("a {} appointment cannot be rescheduled", status.as_str()),
            ));
        }
        validate_window(start_at, end_at)?;
        if dentist_id != core.dentist_id {
            ensure_dentist(&state, dentist_id).await?;
        }
        ensure_free_slot(&mut tx, dentist_id, start_at, end_at, Some(appointment_id)).await?;
    }

    let (reason_set, reason) = match patch.reason {
        None => (false, None),
        Some(v) => (true, v),
    };
    let note = patch.note;
    let (color_set, color) = match patch.color {
        None => (false, None),
        Some(v) => (true, v),
    };

    sqlx::query(
        r#"
        UPDATE appointment
        SET dentist_id = $2,
            start_at   = $3,
            end_at     = $4,
            reason     = CASE WHEN $5 THEN $6 ELSE reason END,
            note       = CASE WHEN $7 THEN $8 ELSE note END,
            color      = CASE WHEN $9 THEN $10 ELSE color END,
            updated_at = now()
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(dentist_id)
    .bind(start_at)
    .bind(end_at)
    .bind(reason_set)
    .bind(reason)
    .bind(note.is_some())
    .bind(patch_opt_text(note, None))
    .bind(color_set)
    .bind(color)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%appointment_id, by = %auth.user_id, rescheduled, "appointment updated");
    Ok(Json(ApiOk::new(fetch_block(&state, appointment_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: AppointmentStatus,
}

pub async fn change_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<ApiOk<AppointmentBlock>>, ApiError> {
    auth.require(Capability::AppointmentsManage)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let current: i16 = sqlx::query_scalar(
        "SELECT status FROM appointment WHERE appointment_id = $1 FOR UPDATE",
    )
    .bind(appointment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;

    let from = AppointmentStatus::from_code(current)?;
    check_transition(from, req.status)?;

    sqlx::query("UPDATE appointment SET status = $2, updated_at = now() WHERE appointment_id = $1")
        .bind(appointment_id)
        .bind(req.status.code())
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%appointment_id, from = from.as_str(), to = req.status.as_str(), by = %auth.user_id, "appointment status changed");
    Ok(Json(ApiOk::new(fetch_block(&state, appointment_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct PutPlanItemsRequest {
    pub items: Vec<PlanItemInput>,
}

/// Replace the planned treatments of an appointment.
pub async fn put_plan_items(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<PutPlanItemsRequest>,
) -> Result<Json<ApiOk<AppointmentBlock>>, ApiError> {
    auth.require(Capability::AppointmentsManage)?;
    validate_plan_items(&req.items)?;

    let core = fetch_core(&state, appointment_id).await?;
    let status = AppointmentStatus::from_code(core.status)?;
    if status.is_terminal() {
        return Err(ApiError::Conflict(
            "APPOINTMENT_CLOSED",
            format!("a {} appointment cannot be edited", status.as_str()),
        ));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    sqlx::query("DELETE FROM appointment_plan_item WHERE appointment_id = $1")
        .bind(appointment_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    insert_plan_items(&mut tx, appointment_id, req.items).await?;

    sqlx::query("UPDATE appointment SET updated_at = now() WHERE appointment_id = $1")
        .bind(appointment_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(fetch_block(&state, appointment_id).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: Role) -> AuthContext {
        AuthContext {
            user_id: Uuid::from_u128(7),
            role,
            session_token_id: Uuid::nil(),
        }
    }

    fn item(id: u128, qty: Option<i32>) -> PlanItemInput {
        PlanItemInput {
            treatment_id: Uuid::from_u128(id),
            qty,
            note: None,
        }
    }

    #[test]
    fn dentists_default_to_their_own_calendar() {
        let dentist = ctx(Role::Dentist);
        assert_eq!(resolve_dentist_filter(&dentist, None), Some(dentist.user_id));
        let other = Uuid::from_u128(99);
        assert_eq!(resolve_dentist_filter(&dentist, Some(other)), Some(other));
        assert_eq!(resolve_dentist_filter(&ctx(Role::Receptionist), None), None);
    }

    #[test]
    fn calendar_visibility_by_role() {
        assert!(ensure_calendar_view(&ctx(Role::Admin)).is_ok());
        assert!(ensure_calendar_view(&ctx(Role::Dentist)).is_ok());
        assert!(ensure_calendar_view(&ctx(Role::Assistant)).is_ok());
        assert!(ensure_calendar_view(&ctx(Role::Receptionist)).is_ok());
    }

    #[test]
    fn plan_items_reject_duplicates_and_zero_qty() {
        assert!(validate_plan_items(&[item(1, None), item(2, Some(3))]).is_ok());
        assert!(validate_plan_items(&[item(1, Some(0))]).is_err());
        assert!(validate_plan_items(&[item(1, None), item(1, Some(2))]).is_err());
    }

    #[test]
    fn reschedule_detection() {
        let mut req = UpdateAppointmentRequest {
            dentist_id: None,
            start_at: None,
            end_at: None,
            reason: Some(Some("pain".into())),
            note: None,
            color: None,
        };
        assert!(!req.reschedules());
        req.end_at = Some(Utc::now());
        assert!(req.reschedules());
    }

    #[test]
    fn patch_keeps_reschedule_flag_and_cleans_reason() {
        let req: UpdateAppointmentRequest = serde_json::from_str(
            r#"{"start_at":"2024-04-02T14:00:00Z","reason":"  ","note":null}"#,
        )
        .unwrap();
        let patch = req.into_patch();
        assert!(patch.rescheduled);
        assert_eq!(patch.reason, Some(None));
        assert_eq!(patch.note, Some(None));
        assert_eq!(patch.color, None);
        assert!(patch.dentist_id.is_none());

        let req: UpdateAppointmentRequest = serde_json::from_str(r#"{"color":3}"#).unwrap();
        let patch = req.into_patch();
        assert!(!patch.rescheduled);
        assert_eq!(patch.color, Some(Some(3)));
    }

    #[test]
    fn overlap_function_filters_on_the_bound_status_list() {
        let sql = include_str!("../../migrations/0002_functions.sql");
        let body = sql
            .split("CREATE FUNCTION appointment_overlaps(")
            .nth(1)
            .and_then(|rest| rest.split("$$;").next())
            .unwrap();
        assert!(body.contains("p_blocking    smallint[]"));
        assert!(body.contains("a.status = ANY (p_blocking)"));
        assert!(!body.contains("NOT IN"));
    }
}
