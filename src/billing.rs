//! Payment plans: installment schedule generation and reconciliation of
//! recorded payments against that schedule.
//!
//! All amounts are integer cents.

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

pub const MAX_INSTALLMENTS: i16 = 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("total must be greater than zero")]
    NonPositiveTotal,
    #[error("down payment must be at least zero and below the total")]
    InvalidDownPayment,
    #[error("installment count must be between 1 and {MAX_INSTALLMENTS}")]
    InvalidInstallmentCount,
    #[error("financed amount of {financed} cents cannot be split into {count} installments")]
    FinancedTooSmall { financed: i64, count: i16 },
    #[error("due date overflows the calendar")]
    DateOverflow,
    #[error("payment amount must be greater than zero")]
    NonPositivePayment,
    #[error("payment of {amount} cents exceeds the remaining balance of {balance} cents")]
    Overpayment { amount: i64, balance: i64 },
    #[error("payment plan is {0} and no longer accepts payments")]
    PlanClosed(&'static str),
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Overpayment { amount, balance } => {
                tracing::warn!(amount, balance, "payment rejected: overpayment");
                ApiError::BadRequest("OVERPAYMENT", e.to_string())
            }
            BillingError::PlanClosed(status) => {
                tracing::warn!(plan_status = status, "payment rejected: plan closed");
                ApiError::Conflict("PLAN_CLOSED", e.to_string())
            }
            _ => ApiError::validation(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
}

impl Frequency {
    pub fn code(self) -> i16 {
        match self {
            Frequency::Weekly => 0,
            Frequency::Biweekly => 1,
            Frequency::Monthly => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Frequency::Weekly),
            1 => Some(Frequency::Biweekly),
            2 => Some(Frequency::Monthly),
            _ => None,
        }
    }

    /// Due date of the `periods`-th period after `start`.
    /// Monthly steps are taken from the anchor, so month-end days clamp
    /// without drifting (Jan 31 → Feb 28 → Mar 31).
    pub fn advance(self, start: NaiveDate, periods: u32) -> Option<NaiveDate> {
        match self {
            Frequency::Weekly => start.checked_add_days(Days::new(7 * u64::from(periods))),
            Frequency::Biweekly => start.checked_add_days(Days::new(14 * u64::from(periods))),
            Frequency::Monthly => start.checked_add_months(Months::new(periods)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Active,
    Completed,
    Cancelled,
}

impl PlanStatus {
    pub fn code(self) -> i16 {
        match self {
            PlanStatus::Active => 0,
            PlanStatus::Completed => 1,
            PlanStatus::Cancelled => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(PlanStatus::Active),
            1 => Some(PlanStatus::Completed),
            2 => Some(PlanStatus::Cancelled),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Completed => "completed",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Other,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [
        PaymentMethod::Cash,
        PaymentMethod::Card,
        PaymentMethod::Transfer,
        PaymentMethod::Other,
    ];

    pub fn code(self) -> i16 {
        match self {
            PaymentMethod::Cash => 0,
            PaymentMethod::Card => 1,
            PaymentMethod::Transfer => 2,
            PaymentMethod::Other => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        PaymentMethod::ALL.into_iter().find(|m| m.code() == code)
    }
}

#[derive(Debug, Clone)]
pub struct PlanTerms {
    pub total_cents: i64,
    pub down_payment_cents: i64,
    pub installment_count: i16,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledInstallment {
    pub seq: i16,
    pub due_date: NaiveDate,
    pub amount_cents: i64,
}

/// Split a plan into its installments.
///
/// A down payment becomes installment 0 due on the start date and pushes
/// the financed installments one period later. The financed amount is
/// split evenly; leftover cents go on the last installment.
pub fn build_schedule(terms: &PlanTerms) -> Result<Vec<ScheduledInstallment>, BillingError> {
    if terms.total_cents <= 0 {
        return Err(BillingError::NonPositiveTotal);
    }
    if terms.down_payment_cents < 0 || terms.down_payment_cents >= terms.total_cents {
        return Err(BillingError::InvalidDownPayment);
    }
    if !(1..=MAX_INSTALLMENTS).contains(&terms.installment_count) {
        return Err(BillingError::InvalidInstallmentCount);
    }

    let count = terms.installment_count;
    let financed = terms.total_cents - terms.down_payment_cents;
    if financed < i64::from(count) {
        return Err(BillingError::FinancedTooSmall { financed, count });
    }

    let base = financed / i64::from(count);
    let remainder = financed % i64::from(count);
    let has_down_payment = terms.down_payment_cents > 0;

    let mut schedule = Vec::with_capacity(usize::from(count.unsigned_abs()) + 1);
    if has_down_payment {
        schedule.push(ScheduledInstallment {
            seq: 0,
            due_date: terms.start_date,
            amount_cents: terms.down_payment_cents,
        });
    }

    for i in 0..count {
        let periods = u32::from(i.unsigned_abs()) + u32::from(has_down_payment);
        let due_date = terms
            .frequency
            .advance(terms.start_date, periods)
            .ok_or(BillingError::DateOverflow)?;
        let amount_cents = if i == count - 1 { base + remainder } else { base };
        schedule.push(ScheduledInstallment {
            seq: i + 1,
            due_date,
            amount_cents,
        });
    }

    Ok(schedule)
}

/* -------------------------
   Reconciliation
--------------------------*/

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstallmentRow {
    pub installment_id: Uuid,
    pub seq: i16,
    pub due_date: NaiveDate,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlanPayment {
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallmentState {
    Paid,
    Partial,
    Pending,
    Overdue,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallmentStatus {
    pub installment_id: Uuid,
    pub seq: i16,
    pub due_date: NaiveDate,
    pub amount_cents: i64,
    pub paid_cents: i64,
    pub remaining_cents: i64,
    pub state: InstallmentState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub installments: Vec<InstallmentStatus>,
    pub scheduled_cents: i64,
    pub paid_cents: i64,
    pub balance_cents: i64,
    pub overdue_cents: i64,
    pub overdue_count: usize,
    pub next_due: Option<NaiveDate>,
    pub last_payment_at: Option<DateTime<Utc>>,
    /// Paid beyond the schedule; non-zero only if data was edited by hand.
    pub unapplied_cents: i64,
}

impl Reconciliation {
    pub fn fully_paid(&self) -> bool {
        self.balance_cents == 0
    }
}

/// Apply payments to installments in sequence order, filling each one
/// before moving to the next. An installment with an unpaid remainder is
/// overdue once its due date is before `today`.
pub fn reconcile(
    installments: &[InstallmentRow],
    payments: &[PlanPayment],
    today: NaiveDate,
) -> Reconciliation {
    let mut ordered: Vec<&InstallmentRow> = installments.iter().collect();
    ordered.sort_by_key(|i| i.seq);

    let paid_cents: i64 = payments.iter().map(|p| p.amount_cents).sum();
    let last_payment_at = payments.iter().map(|p| p.paid_at).max();

    let mut pool = paid_cents;
    let mut out = Vec::with_capacity(ordered.len());
    for inst in ordered {
        let applied = pool.clamp(0, inst.amount_cents);
        pool -= applied;
        let remaining = inst.amount_cents - applied;
        let state = if remaining == 0 {
            InstallmentState::Paid
        } else if inst.due_date < today {
            InstallmentState::Overdue
        } else if applied > 0 {
            InstallmentState::Partial
        } else {
            InstallmentState::Pending
        };
        out.push(InstallmentStatus {
            installment_id: inst.installment_id,
            seq: inst.seq,
            due_date: inst.due_date,
            amount_cents: inst.amount_cents,
            paid_cents: applied,
            remaining_cents: remaining,
            state,
        });
    }

    let scheduled_cents: i64 = out.iter().map(|i| i.amount_cents).sum();
    let overdue: Vec<&InstallmentStatus> = out
        .iter()
        .filter(|i| i.state == InstallmentState::Overdue)
        .collect();
    let overdue_cents = overdue.iter().map(|i| i.remaining_cents).sum();
    let overdue_count = overdue.len();
    let next_due = out
        .iter()
        .find(|i| i.remaining_cents > 0)
        .map(|i| i.due_date);

    Reconciliation {
        scheduled_cents,
        paid_cents,
        balance_cents: (scheduled_cents - paid_cents).max(0),
        overdue_cents,
        overdue_count,
        next_due,
        last_payment_at,
        unapplied_cents: pool.max(0),
        installments: out,
    }
}

/// Validate a new payment against a plan's current state.
pub fn check_plan_payment(
    status: PlanStatus,
    balance_cents: i64,
    amount_cents: i64,
) -> Result<(), BillingError> {
    if amount_cents <= 0 {
        return Err(BillingError::NonPositivePayment);
    }
    if status != PlanStatus::Active {
        return Err(BillingError::PlanClosed(status.as_str()));
    }
    if amount_cents > balance_cents {
        return Err(BillingError::Overpayment {
            amount: amount_cents,
            balance: balance_cents,
        });
    }
    Ok(())
}

/// Plan status after its payments changed. Cancelled plans stay cancelled.
pub fn settle_status(current: PlanStatus, reconciliation: &Reconciliation) -> PlanStatus {
    match current {
        PlanStatus::Cancelled => PlanStatus::Cancelled,
        _ if reconciliation.fully_paid() => PlanStatus::Completed,
        _ => PlanStatus::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_rejections_map_to_api_codes() {
        match ApiError::from(BillingError::Overpayment { amount: 500, balance: 200 }) {
            ApiError::BadRequest(code, msg) => {
                assert_eq!(code, "OVERPAYMENT");
                assert!(msg.contains("200"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ApiError::from(BillingError::PlanClosed("cancelled")),
            ApiError::Conflict("PLAN_CLOSED", _)
        ));
        assert!(matches!(
            ApiError::from(BillingError::NonPositivePayment),
            ApiError::BadRequest("VALIDATION_ERROR", _)
        ));
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn terms(total: i64, down: i64, count: i16, frequency: Frequency, start: NaiveDate) -> PlanTerms {
        PlanTerms {
            total_cents: total,
            down_payment_cents: down,
            installment_count: count,
            frequency,
            start_date: start,
        }
    }

    fn rows(schedule: &[ScheduledInstallment]) -> Vec<InstallmentRow> {
        schedule
            .iter()
            .map(|s| InstallmentRow {
                installment_id: Uuid::new_v4(),
                seq: s.seq,
                due_date: s.due_date,
                amount_cents: s.amount_cents,
            })
            .collect()
    }

    fn pay(amount: i64) -> PlanPayment {
        PlanPayment {
            payment_id: Uuid::new_v4(),
            amount_cents: amount,
            paid_at: Utc::now(),
        }
    }

    #[test]
    fn remainder_lands_on_last_installment() {
        let s = build_schedule(&terms(10_000, 0, 3, Frequency::Monthly, d(2024, 1, 15))).unwrap();
        let amounts: Vec<i64> = s.iter().map(|i| i.amount_cents).collect();
        assert_eq!(amounts, vec![3333, 3333, 3334]);
        assert_eq!(amounts.iter().sum::<i64>(), 10_000);
        let seqs: Vec<i16> = s.iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(s[0].due_date, d(2024, 1, 15));
        assert_eq!(s[2].due_date, d(2024, 3, 15));
    }

    #[test]
    fn monthly_dates_clamp_to_month_end_without_drift() {
        let s = build_schedule(&terms(3_000, 0, 3, Frequency::Monthly, d(2024, 1, 31))).unwrap();
        let dates: Vec<NaiveDate> = s.iter().map(|i| i.due_date).collect();
        assert_eq!(dates, vec![d(2024, 1, 31), d(2024, 2, 29), d(2024, 3, 31)]);
    }

    #[test]
    fn down_payment_is_installment_zero_and_shifts_the_rest() {
        let s = build_schedule(&terms(50_000, 10_000, 4, Frequency::Weekly, d(2024, 5, 1))).unwrap();
        assert_eq!(s.len(), 5);
        assert_eq!(s[0], ScheduledInstallment { seq: 0, due_date: d(2024, 5, 1), amount_cents: 10_000 });
        assert_eq!(s[1].due_date, d(2024, 5, 8));
        assert_eq!(s[4].due_date, d(2024, 5, 29));
        assert!(s[1..].iter().all(|i| i.amount_cents == 10_000));
    }

    #[test]
    fn biweekly_steps_fourteen_days() {
        let s = build_schedule(&terms(2_000, 0, 2, Frequency::Biweekly, d(2024, 12, 25))).unwrap();
        assert_eq!(s[1].due_date, d(2025, 1, 8));
    }

    #[test]
    fn invalid_terms_are_rejected() {
        let start = d(2024, 1, 1);
        assert_eq!(
            build_schedule(&terms(0, 0, 1, Frequency::Monthly, start)),
            Err(BillingError::NonPositiveTotal)
        );
        assert_eq!(
            build_schedule(&terms(1_000, 1_000, 1, Frequency::Monthly, start)),
            Err(BillingError::InvalidDownPayment)
        );
        assert_eq!(
            build_schedule(&terms(1_000, -1, 1, Frequency::Monthly, start)),
            Err(BillingError::InvalidDownPayment)
        );
        assert_eq!(
            build_schedule(&terms(1_000, 0, 61, Frequency::Monthly, start)),
            Err(BillingError::InvalidInstallmentCount)
        );
        assert_eq!(
            build_schedule(&terms(5, 0, 6, Frequency::Monthly, start)),
            Err(BillingError::FinancedTooSmall { financed: 5, count: 6 })
        );
    }

    #[test]
    fn payments_fill_installments_in_order() {
        let schedule = build_schedule(&terms(9_000, 0, 3, Frequency::Monthly, d(2024, 1, 10))).unwrap();
        let r = reconcile(&rows(&schedule), &[pay(2_000), pay(2_500)], d(2024, 1, 1));

        let states: Vec<InstallmentState> = r.installments.iter().map(|i| i.state).collect();
        assert_eq!(
            states,
            vec![InstallmentState::Paid, InstallmentState::Partial, InstallmentState::Pending]
        );
        assert_eq!(r.installments[1].paid_cents, 1_500);
        assert_eq!(r.installments[1].remaining_cents, 1_500);
        assert_eq!(r.paid_cents, 4_500);
        assert_eq!(r.balance_cents, 4_500);
        assert_eq!(r.next_due, Some(d(2024, 2, 10)));
        assert!(!r.fully_paid());
    }

    #[test]
    fn unpaid_past_due_installments_are_overdue() {
        let schedule = build_schedule(&terms(3_000, 0, 3, Frequency::Monthly, d(2024, 1, 10))).unwrap();
        let r = reconcile(&rows(&schedule), &[pay(1_500)], d(2024, 2, 11));

        assert_eq!(r.installments[0].state, InstallmentState::Paid);
        assert_eq!(r.installments[1].state, InstallmentState::Overdue);
        assert_eq!(r.installments[2].state, InstallmentState::Pending);
        assert_eq!(r.overdue_count, 1);
        assert_eq!(r.overdue_cents, 500);
    }

    #[test]
    fn due_today_is_not_overdue() {
        let schedule = build_schedule(&terms(1_000, 0, 1, Frequency::Monthly, d(2024, 3, 1))).unwrap();
        let r = reconcile(&rows(&schedule), &[], d(2024, 3, 1));
        assert_eq!(r.installments[0].state, InstallmentState::Pending);
    }

    #[test]
    fn installments_are_reconciled_by_seq_not_input_order() {
        let schedule = build_schedule(&terms(2_000, 500, 1, Frequency::Monthly, d(2024, 1, 1))).unwrap();
        let mut reversed = rows(&schedule);
        reversed.reverse();
        let r = reconcile(&reversed, &[pay(500)], d(2024, 1, 1));
        assert_eq!(r.installments[0].seq, 0);
        assert_eq!(r.installments[0].state, InstallmentState::Paid);
        assert_eq!(r.installments[1].state, InstallmentState::Pending);
    }

    #[test]
    fn full_payment_settles_the_plan() {
        let schedule = build_schedule(&terms(1_000, 0, 2, Frequency::Weekly, d(2024, 1, 1))).unwrap();
        let r = reconcile(&rows(&schedule), &[pay(400), pay(600)], d(2024, 6, 1));
        assert!(r.fully_paid());
        assert_eq!(r.overdue_count, 0);
        assert_eq!(r.next_due, None);
        assert_eq!(settle_status(PlanStatus::Active, &r), PlanStatus::Completed);
        assert_eq!(settle_status(PlanStatus::Cancelled, &r), PlanStatus::Cancelled);
    }

    #[test]
    fn removing_a_payment_reopens_a_completed_plan() {
        let schedule = build_schedule(&terms(1_000, 0, 2, Frequency::Weekly, d(2024, 1, 1))).unwrap();
        let r = reconcile(&rows(&schedule), &[pay(400)], d(2024, 1, 1));
        assert_eq!(settle_status(PlanStatus::Completed, &r), PlanStatus::Active);
    }

    #[test]
    fn excess_payments_are_reported_as_unapplied() {
        let schedule = build_schedule(&terms(1_000, 0, 1, Frequency::Weekly, d(2024, 1, 1))).unwrap();
        let r = reconcile(&rows(&schedule), &[pay(1_200)], d(2024, 1, 1));
        assert_eq!(r.balance_cents, 0);
        assert_eq!(r.unapplied_cents, 200);
    }

    #[test]
    fn payment_checks() {
        assert_eq!(check_plan_payment(PlanStatus::Active, 1_000, 1_000), Ok(()));
        assert_eq!(
            check_plan_payment(PlanStatus::Active, 1_000, 1_001),
            Err(BillingError::Overpayment { amount: 1_001, balance: 1_000 })
        );
        assert_eq!(
            check_plan_payment(PlanStatus::Active, 1_000, 0),
            Err(BillingError::NonPositivePayment)
        );
        assert_eq!(
            check_plan_payment(PlanStatus::Cancelled, 1_000, 10),
            Err(BillingError::PlanClosed("cancelled"))
        );
        assert_eq!(
            check_plan_payment(PlanStatus::Completed, 0, 10),
            Err(BillingError::PlanClosed("completed"))
        );
    }

    #[test]
    fn method_codes_round_trip() {
        for m in PaymentMethod::ALL {
            assert_eq!(PaymentMethod::from_code(m.code()), Some(m));
        }
        assert_eq!(PaymentMethod::from_code(9), None);
    }
}
