use axum::{Json, Router, extract::State, routing::get};
use chrono::{Datelike, NaiveDate};

use crate::calendar::{clinic_today, local_day_range};
use crate::error::ApiError;
use crate::middleware::auth_context::AuthContext;
use crate::models::{ApiOk, AppState, Capability, ClinicProfile};
use crate::routes::auth_routes::load_clinic_profile;
use crate::routes::report_routes::{StatusCount, StatusCountRow, status_counts};

#[derive(serde::Serialize)]
pub struct HomeData {
    pub view: &'static str,
    pub clinic: ClinicProfile,
    pub today: NaiveDate,
    /// Only the caller's own chair for dentists.
    pub today_appointments: Vec<StatusCount>,
    /// Present for roles that handle payments.
    pub overdue_installments: Option<i64>,
    pub new_patients_this_month: i64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/home", get(home))
}

pub async fn home(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<HomeData>>, ApiError> {
    let offset = state.clinic_tz_offset_minutes;
    let today = clinic_today(offset);
    let (day_start, day_end) = local_day_range(today, 1, offset)?;
    let dentist_id = auth.is_dentist().then_some(auth.user_id);

    let rows: Vec<StatusCountRow> = sqlx::query_as::<_, StatusCountRow>(
        r#"
        SELECT status, count(*)::bigint AS appointment_count
        FROM appointment
        WHERE start_at >= $1
          AND start_at <  $2
          AND ($3::uuid IS NULL OR dentist_id = $3)
        GROUP BY status
        "#,
    )
    .bind(day_start)
    .bind(day_end)
    .bind(dentist_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    // An installment is overdue while the plan's payments, applied in
    // sequence order, have not yet covered it.
    let overdue_installments = if auth.can(Capability::Billing) {
        let n: i64 = sqlx::query_scalar(
            r#"
            WITH inst AS (
                SELECT i.plan_id, i.due_date,
                       sum(i.amount_cents) OVER (PARTITION BY i.plan_id ORDER BY i.seq) AS covered_at
                FROM installment i
                JOIN payment_plan pp ON pp.plan_id = i.plan_id
                WHERE pp.status = 0
            ),
            paid AS (
                SELECT plan_id, sum(amount_cents) AS paid
                FROM payment
                WHERE plan_id IS NOT NULL
                GROUP BY plan_id
            )
            SELECT count(*)
            FROM inst
            LEFT JOIN paid ON paid.plan_id = inst.plan_id
            WHERE inst.due_date < $1
              AND inst.covered_at > COALESCE(paid.paid, 0)
            "#,
        )
        .bind(today)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;
        Some(n)
    } else {
        None
    };

    let month_start = today.with_day(1).unwrap_or(today);
    let (since, _) = local_day_range(month_start, 1, offset)?;
    let new_patients_this_month: i64 =
        sqlx::query_scalar("SELECT count(*) FROM patient WHERE created_at >= $1")
            .bind(since)
            .fetch_one(&state.db)
            .await
            .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(HomeData {
        view: auth.role.as_str(),
        clinic: load_clinic_profile(&state).await?,
        today,
        today_appointments: status_counts(rows),
        overdue_installments,
        new_patients_this_month,
    })))
}
