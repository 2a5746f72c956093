// src/routes/payment_routes.rs

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    billing::{
        build_schedule, check_plan_payment, reconcile, settle_status, BillingError, Frequency,
        InstallmentRow, PaymentMethod, PlanPayment, PlanStatus, PlanTerms, Reconciliation,
    },
    calendar::clinic_today,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{clean_opt, ApiOk, AppState, Capability, OkData, Paging},
    routes::patient_routes::ensure_patient,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/patients/{patient_id}/payment_plans",
            get(list_plans).post(create_plan),
        )
        .route("/payment_plans/{plan_id}", get(get_plan))
        .route("/payment_plans/{plan_id}/cancel", post(cancel_plan))
        .route(
            "/patients/{patient_id}/payments",
            get(list_payments).post(record_payment),
        )
        .route("/payments/{payment_id}", delete(delete_payment))
        .route("/patients/{patient_id}/balance", get(get_balance))
}

/* ============================================================
   Rows / DTOs
   ============================================================ */

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    plan_id: Uuid,
    patient_id: Uuid,
    description: String,
    total_cents: i64,
    down_payment_cents: i64,
    installment_count: i16,
    frequency: i16,
    start_date: NaiveDate,
    status: i16,
    created_at: DateTime<Utc>,
}

const PLAN_COLUMNS: &str = "plan_id, patient_id, description, total_cents, down_payment_cents, \
     installment_count, frequency, start_date, status, created_at";

#[derive(Debug, Serialize)]
pub struct PlanView {
    pub plan_id: Uuid,
    pub patient_id: Uuid,
    pub description: String,
    pub total_cents: i64,
    pub down_payment_cents: i64,
    pub installment_count: i16,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub reconciliation: Reconciliation,
}

impl PlanRow {
    fn status(&self) -> Result<PlanStatus, ApiError> {
        PlanStatus::from_code(self.status)
            .ok_or_else(|| ApiError::Internal(format!("unknown plan status {}", self.status)))
    }

    fn into_view(self, reconciliation: Reconciliation) -> Result<PlanView, ApiError> {
        let status = self.status()?;
        let frequency = Frequency::from_code(self.frequency)
            .ok_or_else(|| ApiError::Internal(format!("unknown plan frequency {}", self.frequency)))?;
        Ok(PlanView {
            plan_id: self.plan_id,
            patient_id: self.patient_id,
            description: self.description,
            total_cents: self.total_cents,
            down_payment_cents: self.down_payment_cents,
            installment_count: self.installment_count,
            frequency,
            start_date: self.start_date,
            status,
            created_at: self.created_at,
            reconciliation,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    patient_id: Uuid,
    plan_id: Option<Uuid>,
    amount_cents: i64,
    method: i16,
    paid_at: DateTime<Utc>,
    reference: Option<String>,
    note: Option<String>,
    received_by: Uuid,
    received_by_name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PaymentDto {
    pub payment_id: Uuid,
    pub patient_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub received_by: Uuid,
    pub received_by_name: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentDto {
    type Error = ApiError;

    fn try_from(r: PaymentRow) -> Result<Self, Self::Error> {
        let method = PaymentMethod::from_code(r.method)
            .ok_or_else(|| ApiError::Internal(format!("unknown payment method {}", r.method)))?;
        Ok(PaymentDto {
            payment_id: r.payment_id,
            patient_id: r.patient_id,
            plan_id: r.plan_id,
            amount_cents: r.amount_cents,
            method,
            paid_at: r.paid_at,
            reference: r.reference,
            note: r.note,
            received_by: r.received_by,
            received_by_name: r.received_by_name,
            created_at: r.created_at,
        })
    }
}

const PAYMENT_SELECT: &str = r#"
    SELECT p.payment_id, p.patient_id, p.plan_id, p.amount_cents, p.method, p.paid_at,
           p.reference, p.note, p.received_by, u.display_name AS received_by_name, p.created_at
    FROM payment p
    JOIN staff_user u ON u.user_id = p.received_by
"#;

/// Totals as computed by `patient_balance()`. Cancelled plans are excluded.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PatientBalance {
    pub planned_cents: i64,
    pub paid_on_plans_cents: i64,
    pub outstanding_cents: i64,
    pub treatments_completed_cents: i64,
    pub payments_total_cents: i64,
}

/* ============================================================
   Loading
   ============================================================ */

async fn plan_schedule(
    conn: &mut PgConnection,
    plan_id: Uuid,
) -> Result<(Vec<InstallmentRow>, Vec<PlanPayment>), ApiError> {
    let installments: Vec<InstallmentRow> = sqlx::query_as::<_, InstallmentRow>(
        r#"
        SELECT installment_id, seq, due_date, amount_cents
        FROM installment
        WHERE plan_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(plan_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(ApiError::db)?;

    let payments: Vec<PlanPayment> = sqlx::query_as::<_, PlanPayment>(
        r#"
        SELECT payment_id, amount_cents, paid_at
        FROM payment
        WHERE plan_id = $1
        ORDER BY paid_at ASC, payment_id ASC
        "#,
    )
    .bind(plan_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(ApiError::db)?;

    Ok((installments, payments))
}

async fn load_plan_view(state: &AppState, plan_id: Uuid) -> Result<PlanView, ApiError> {
    let mut conn = state.db.acquire().await.map_err(ApiError::db)?;

    let plan: PlanRow = sqlx::query_as::<_, PlanRow>(&format!(
        "SELECT {PLAN_COLUMNS} FROM payment_plan WHERE plan_id = $1"
    ))
    .bind(plan_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("payment plan"))?;

    let (installments, payments) = plan_schedule(&mut conn, plan_id).await?;
    let today = clinic_today(state.clinic_tz_offset_minutes);
    plan.into_view(reconcile(&installments, &payments, today))
}

/// Lock the plan row and bring its status in line with its payments.
async fn resettle_plan(
    tx: &mut PgConnection,
    plan_id: Uuid,
    today: NaiveDate,
) -> Result<PlanStatus, ApiError> {
    let current: i16 = sqlx::query_scalar("SELECT status FROM payment_plan WHERE plan_id = $1 FOR UPDATE")
        .bind(plan_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("payment plan"))?;
    let current = PlanStatus::from_code(current)
        .ok_or_else(|| ApiError::Internal(format!("unknown plan status {current}")))?;

    let (installments, payments) = plan_schedule(tx, plan_id).await?;
    let next = settle_status(current, &reconcile(&installments, &payments, today));

    if next != current {
        sqlx::query("UPDATE payment_plan SET status = $2, updated_at = now() WHERE plan_id = $1")
            .bind(plan_id)
            .bind(next.code())
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
        tracing::info!(%plan_id, from = ?current, to = ?next, "payment plan status settled");
    }
    Ok(next)
}

pub(crate) async fn load_balance(state: &AppState, patient_id: Uuid) -> Result<PatientBalance, ApiError> {
    sqlx::query_as::<_, PatientBalance>("SELECT * FROM patient_balance($1)")
        .bind(patient_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)
}

/* ============================================================
   Plans
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub description: String,
    pub total_cents: i64,
    #[serde(default)]
    pub down_payment_cents: i64,
    pub installment_count: i16,
    pub frequency: Frequency,
    /// First due date; defaults to today in clinic time.
    pub start_date: Option<NaiveDate>,
}

pub async fn create_plan(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<CreatePlanRequest>,
) -> Result<Json<ApiOk<PlanView>>, ApiError> {
    auth.require(Capability::Billing)?;
    ensure_patient(&state, patient_id).await?;

    let description = req.description.trim();
    if description.is_empty() {
        return Err(ApiError::validation("description is required"));
    }

    let terms = PlanTerms {
        total_cents: req.total_cents,
        down_payment_cents: req.down_payment_cents,
        installment_count: req.installment_count,
        frequency: req.frequency,
        start_date: req
            .start_date
            .unwrap_or_else(|| clinic_today(state.clinic_tz_offset_minutes)),
    };
    let schedule = build_schedule(&terms)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let plan_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO payment_plan (
            patient_id, description, total_cents, down_payment_cents,
            installment_count, frequency, start_date, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING plan_id
        "#,
    )
    .bind(patient_id)
    .bind(description)
    .bind(terms.total_cents)
    .bind(terms.down_payment_cents)
    .bind(terms.installment_count)
    .bind(terms.frequency.code())
    .bind(terms.start_date)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    for inst in &schedule {
        sqlx::query(
            r#"
            INSERT INTO installment (plan_id, seq, due_date, amount_cents)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(plan_id)
        .bind(inst.seq)
        .bind(inst.due_date)
        .bind(inst.amount_cents)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%plan_id, %patient_id, total = terms.total_cents, installments = schedule.len(), by = %auth.user_id, "payment plan created");
    Ok(Json(ApiOk::new(load_plan_view(&state, plan_id).await?)))
}

#[derive(Debug, sqlx::FromRow)]
struct PlanInstallmentRow {
    plan_id: Uuid,
    installment_id: Uuid,
    seq: i16,
    due_date: NaiveDate,
    amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanPaymentRow {
    plan_id: Uuid,
    payment_id: Uuid,
    amount_cents: i64,
    paid_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListPlansQuery {
    pub include_closed: Option<bool>,
}

pub async fn list_plans(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Query(q): Query<ListPlansQuery>,
) -> Result<Json<ApiOk<Vec<PlanView>>>, ApiError> {
    auth.require(Capability::Billing)?;
    ensure_patient(&state, patient_id).await?;

    let plans: Vec<PlanRow> = sqlx::query_as::<_, PlanRow>(&format!(
        r#"
        SELECT {PLAN_COLUMNS}
        FROM payment_plan
        WHERE patient_id = $1
          AND ($2 OR status = 0)
        ORDER BY created_at DESC
        "#
    ))
    .bind(patient_id)
    .bind(q.include_closed.unwrap_or(true))
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let installment_rows: Vec<PlanInstallmentRow> = sqlx::query_as::<_, PlanInstallmentRow>(
        r#"
        SELECT i.plan_id, i.installment_id, i.seq, i.due_date, i.amount_cents
        FROM installment i
        JOIN payment_plan pp ON pp.plan_id = i.plan_id
        WHERE pp.patient_id = $1
        ORDER BY i.plan_id, i.seq
        "#,
    )
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let payment_rows: Vec<PlanPaymentRow> = sqlx::query_as::<_, PlanPaymentRow>(
        r#"
        SELECT plan_id, payment_id, amount_cents, paid_at
        FROM payment
        WHERE patient_id = $1 AND plan_id IS NOT NULL
        ORDER BY paid_at ASC, payment_id ASC
        "#,
    )
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut installments: HashMap<Uuid, Vec<InstallmentRow>> = HashMap::new();
    for r in installment_rows {
        installments.entry(r.plan_id).or_default().push(InstallmentRow {
            installment_id: r.installment_id,
            seq: r.seq,
            due_date: r.due_date,
            amount_cents: r.amount_cents,
        });
    }
    let mut payments: HashMap<Uuid, Vec<PlanPayment>> = HashMap::new();
    for r in payment_rows {
        payments.entry(r.plan_id).or_default().push(PlanPayment {
            payment_id: r.payment_id,
            amount_cents: r.amount_cents,
            paid_at: r.paid_at,
        });
    }

    let today = clinic_today(state.clinic_tz_offset_minutes);
    let views = plans
        .into_iter()
        .map(|plan| {
            let rec = reconcile(
                installments.get(&plan.plan_id).map(Vec::as_slice).unwrap_or(&[]),
                payments.get(&plan.plan_id).map(Vec::as_slice).unwrap_or(&[]),
                today,
            );
            plan.into_view(rec)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ApiOk::new(views)))
}

pub async fn get_plan(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<ApiOk<PlanView>>, ApiError> {
    auth.require(Capability::Billing)?;
    Ok(Json(ApiOk::new(load_plan_view(&state, plan_id).await?)))
}

pub async fn cancel_plan(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<ApiOk<PlanView>>, ApiError> {
    auth.require(Capability::Billing)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let current: i16 = sqlx::query_scalar("SELECT status FROM payment_plan WHERE plan_id = $1 FOR UPDATE")
        .bind(plan_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("payment plan"))?;

    if current != PlanStatus::Active.code() {
        return Err(ApiError::Conflict(
            "PLAN_CLOSED",
            "only active payment plans can be cancelled".into(),
        ));
    }

    sqlx::query("UPDATE payment_plan SET status = $2, updated_at = now() WHERE plan_id = $1")
        .bind(plan_id)
        .bind(PlanStatus::Cancelled.code())
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%plan_id, by = %auth.user_id, "payment plan cancelled");
    Ok(Json(ApiOk::new(load_plan_view(&state, plan_id).await?)))
}

/* ============================================================
   Payments
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub paid_at: Option<DateTime<Utc>>,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub plan_id: Option<Uuid>,
}

pub async fn record_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<RecordPaymentRequest>,
) -> Result<Json<ApiOk<PaymentDto>>, ApiError> {
    auth.require(Capability::Billing)?;
    ensure_patient(&state, patient_id).await?;

    if req.amount_cents <= 0 {
        return Err(BillingError::NonPositivePayment.into());
    }
    let today = clinic_today(state.clinic_tz_offset_minutes);

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    if let Some(plan_id) = req.plan_id {
        let status: i16 = sqlx::query_scalar(
            "SELECT status FROM payment_plan WHERE plan_id = $1 AND patient_id = $2 FOR UPDATE",
        )
        .bind(plan_id)
        .bind(patient_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("payment plan"))?;
        let status = PlanStatus::from_code(status)
            .ok_or_else(|| ApiError::Internal(format!("unknown plan status {status}")))?;

        let (installments, payments) = plan_schedule(&mut tx, plan_id).await?;
        let rec = reconcile(&installments, &payments, today);
        check_plan_payment(status, rec.balance_cents, req.amount_cents)?;
    }

    let payment_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO payment (patient_id, plan_id, amount_cents, method, paid_at, reference, note, received_by)
        VALUES ($1, $2, $3, $4, COALESCE($5, now()), $6, $7, $8)
        RETURNING payment_id
        "#,
    )
    .bind(patient_id)
    .bind(req.plan_id)
    .bind(req.amount_cents)
    .bind(req.method.code())
    .bind(req.paid_at)
    .bind(clean_opt(req.reference))
    .bind(clean_opt(req.note))
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    if let Some(plan_id) = req.plan_id {
        resettle_plan(&mut tx, plan_id, today).await?;
    }

    let row: PaymentRow = sqlx::query_as::<_, PaymentRow>(&format!(
        "{PAYMENT_SELECT} WHERE p.payment_id = $1"
    ))
    .bind(payment_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(%payment_id, %patient_id, amount = req.amount_cents, plan_id = ?req.plan_id, by = %auth.user_id, "payment recorded");
    Ok(Json(ApiOk::new(row.try_into()?)))
}

pub async fn list_payments(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Query(paging): Query<Paging>,
) -> Result<Json<ApiOk<Vec<PaymentDto>>>, ApiError> {
    auth.require(Capability::Billing)?;
    ensure_patient(&state, patient_id).await?;

    let (limit, offset) = paging.resolve();
    let rows: Vec<PaymentRow> = sqlx::query_as::<_, PaymentRow>(&format!(
        r#"
        {PAYMENT_SELECT}
        WHERE p.patient_id = $1
        ORDER BY p.paid_at DESC, p.payment_id DESC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(patient_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let payments = rows
        .into_iter()
        .map(PaymentDto::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiOk::new(payments)))
}

/// Admin correction; the plan the payment belonged to is re-settled.
pub async fn delete_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiOk<OkData>>, ApiError> {
    auth.require(Capability::StaffAdmin)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let plan_id: Option<Uuid> = sqlx::query_scalar::<_, Option<Uuid>>(
        "DELETE FROM payment WHERE payment_id = $1 RETURNING plan_id",
    )
    .bind(payment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("payment"))?;

    if let Some(plan_id) = plan_id {
        resettle_plan(&mut tx, plan_id, clinic_today(state.clinic_tz_offset_minutes)).await?;
    }

    tx.commit().await.map_err(ApiError::db)?;

    tracing::warn!(%payment_id, plan_id = ?plan_id, by = %auth.user_id, "payment deleted");
    Ok(Json(ApiOk::new(OkData { ok: true })))
}

pub async fn get_balance(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientBalance>>, ApiError> {
    if !auth.can(Capability::Billing) {
        auth.require(Capability::PatientsRead)?;
    }
    ensure_patient(&state, patient_id).await?;
    Ok(Json(ApiOk::new(load_balance(&state, patient_id).await?)))
}
