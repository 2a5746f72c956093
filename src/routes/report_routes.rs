// src/routes/report_routes.rs

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    calendar::{clinic_today, AppointmentStatus},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Capability},
    reports::{
        fill_counts, income_report, resolve_range, CountBucket, CountRow, Grain, IncomeReport,
        IncomeRow, ReportRange,
    },
};

const DEFAULT_TOP: i64 = 20;
const MAX_TOP: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/reports
        .route("/income", get(income))
        .route("/appointments", get(appointments))
        .route("/treatments", get(treatments))
        .route("/new_patients", get(new_patients))
        .route("/outstanding", get(outstanding))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub grain: Option<String>,
    pub limit: Option<i64>,
}

impl RangeQuery {
    fn range(&self, grain: Grain, state: &AppState) -> Result<ReportRange, ApiError> {
        let today = clinic_today(state.clinic_tz_offset_minutes);
        Ok(resolve_range(self.from.as_deref(), self.to.as_deref(), grain, today)?)
    }

    fn top(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_TOP).clamp(1, MAX_TOP)
    }
}

pub async fn income(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<RangeQuery>,
) -> Result<Json<ApiOk<IncomeReport>>, ApiError> {
    auth.require(Capability::Reports)?;

    let grain = Grain::parse(q.grain.as_deref())?;
    let range = q.range(grain, &state)?;

    let rows: Vec<IncomeRow> = sqlx::query_as::<_, IncomeRow>("SELECT * FROM report_income($1, $2, $3, $4)")
        .bind(range.from)
        .bind(range.to)
        .bind(grain.as_sql())
        .bind(state.clinic_tz_offset_minutes)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(income_report(range, grain, rows))))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StatusCountRow {
    pub status: i16,
    pub appointment_count: i64,
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: AppointmentStatus,
    pub count: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DentistCount {
    pub dentist_id: Uuid,
    pub display_name: String,
    pub appointment_count: i64,
    pub completed_count: i64,
}

#[derive(Debug, Serialize)]
pub struct AppointmentReport {
    pub range: ReportRange,
    pub total: i64,
    pub by_status: Vec<StatusCount>,
    pub by_dentist: Vec<DentistCount>,
}

/// Every status is listed, zero counts included, in lifecycle order.
pub(crate) fn status_counts(rows: Vec<StatusCountRow>) -> Vec<StatusCount> {
    AppointmentStatus::ALL
        .into_iter()
        .map(|status| StatusCount {
            status,
            count: rows
                .iter()
                .filter(|r| r.status == status.code())
                .map(|r| r.appointment_count)
                .sum(),
        })
        .collect()
}

pub async fn appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<RangeQuery>,
) -> Result<Json<ApiOk<AppointmentReport>>, ApiError> {
    auth.require(Capability::Reports)?;
    let range = q.range(Grain::Day, &state)?;

    let status_rows: Vec<StatusCountRow> =
        sqlx::query_as::<_, StatusCountRow>("SELECT * FROM report_appointments_by_status($1, $2, $3)")
            .bind(range.from)
            .bind(range.to)
            .bind(state.clinic_tz_offset_minutes)
            .fetch_all(&state.db)
            .await
            .map_err(ApiError::db)?;

    let by_dentist: Vec<DentistCount> =
        sqlx::query_as::<_, DentistCount>("SELECT * FROM report_appointments_by_dentist($1, $2, $3)")
            .bind(range.from)
            .bind(range.to)
            .bind(state.clinic_tz_offset_minutes)
            .fetch_all(&state.db)
            .await
            .map_err(ApiError::db)?;

    let by_status = status_counts(status_rows);
    Ok(Json(ApiOk::new(AppointmentReport {
        range,
        total: by_status.iter().map(|s| s.count).sum(),
        by_status,
        by_dentist,
    })))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TreatmentLine {
    pub treatment_id: Uuid,
    pub code: String,
    pub name: String,
    pub treatment_count: i64,
    pub revenue_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct TreatmentReport {
    pub range: ReportRange,
    pub lines: Vec<TreatmentLine>,
}

pub async fn treatments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<RangeQuery>,
) -> Result<Json<ApiOk<TreatmentReport>>, ApiError> {
    auth.require(Capability::Reports)?;
    let range = q.range(Grain::Day, &state)?;

    let lines: Vec<TreatmentLine> =
        sqlx::query_as::<_, TreatmentLine>("SELECT * FROM report_treatments($1, $2, $3, $4)")
            .bind(range.from)
            .bind(range.to)
            .bind(q.top() as i32)
            .bind(state.clinic_tz_offset_minutes)
            .fetch_all(&state.db)
            .await
            .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(TreatmentReport { range, lines })))
}

#[derive(Debug, Serialize)]
pub struct NewPatientsReport {
    pub range: ReportRange,
    pub total: i64,
    pub buckets: Vec<CountBucket>,
}

pub async fn new_patients(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<RangeQuery>,
) -> Result<Json<ApiOk<NewPatientsReport>>, ApiError> {
    auth.require(Capability::Reports)?;
    let range = q.range(Grain::Month, &state)?;

    let rows: Vec<CountRow> = sqlx::query_as::<_, CountRow>("SELECT * FROM report_new_patients($1, $2, $3)")
        .bind(range.from)
        .bind(range.to)
        .bind(state.clinic_tz_offset_minutes)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    let buckets = fill_counts(range, Grain::Month, rows);
    Ok(Json(ApiOk::new(NewPatientsReport {
        range,
        total: buckets.iter().map(|b| b.count).sum(),
        buckets,
    })))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct OutstandingLine {
    pub patient_id: Uuid,
    pub record_number: String,
    pub full_name: String,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub outstanding_cents: i64,
}

pub async fn outstanding(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<RangeQuery>,
) -> Result<Json<ApiOk<Vec<OutstandingLine>>>, ApiError> {
    auth.require(Capability::Reports)?;

    let rows: Vec<OutstandingLine> =
        sqlx::query_as::<_, OutstandingLine>("SELECT * FROM report_outstanding($1)")
            .bind(q.limit.unwrap_or(MAX_TOP).clamp(1, MAX_TOP) as i32)
            .fetch_all(&state.db)
            .await
            .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(rows)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_status_is_reported() {
        let rows = vec![
            StatusCountRow { status: 0, appointment_count: 3 },
            StatusCountRow { status: 4, appointment_count: 7 },
        ];
        let counts = status_counts(rows);
        assert_eq!(counts.len(), AppointmentStatus::ALL.len());
        assert_eq!(counts[0].status, AppointmentStatus::Scheduled);
        assert_eq!(counts[0].count, 3);
        assert_eq!(counts[4].count, 7);
        assert_eq!(counts[5].count, 0);
    }

    #[test]
    fn top_is_clamped() {
        let q = |limit| RangeQuery { from: None, to: None, grain: None, limit };
        assert_eq!(q(None).top(), DEFAULT_TOP);
        assert_eq!(q(Some(0)).top(), 1);
        assert_eq!(q(Some(10_000)).top(), MAX_TOP);
    }

    #[test]
    fn dated_reports_bucket_in_clinic_time() {
        let sql = include_str!("../../migrations/0002_functions.sql");
        for name in [
            "report_income",
            "report_appointments_by_status",
            "report_appointments_by_dentist",
            "report_treatments",
            "report_new_patients",
        ] {
            let body = sql
                .split(&format!("CREATE FUNCTION {name}("))
                .nth(1)
                .and_then(|rest| rest.split("$$;").next())
                .unwrap();
            assert!(body.contains("p_offset integer"), "{name} takes no offset");
            assert!(body.contains("clinic_day_start(p_from, p_offset)"), "{name} bounds");
            assert!(!body.contains("::timestamptz"), "{name} uses session time zone");
        }
    }
}
