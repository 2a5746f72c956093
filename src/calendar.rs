//! Appointment lifecycle, scheduling windows and calendar row folding.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::PersonBrief;

pub const MAX_APPOINTMENT_HOURS: i64 = 12;
pub const MAX_RANGE_DAYS: i64 = 31;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("{0:?} is not a YYYY-MM-DD date")]
    InvalidDate(String),
    #[error("days must be between 1 and {MAX_RANGE_DAYS}")]
    InvalidDays,
    #[error("end_at must be after start_at")]
    EndBeforeStart,
    #[error("appointments may not exceed {MAX_APPOINTMENT_HOURS} hours")]
    TooLong,
    #[error("unknown appointment status {0}")]
    UnknownStatus(i16),
    #[error("cannot move an appointment from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("dentist already has an appointment in that time slot")]
    Overlap,
}

impl From<CalendarError> for ApiError {
    fn from(e: CalendarError) -> Self {
        match e {
            CalendarError::InvalidTransition { from, to } => {
                tracing::warn!(from, to, "appointment transition rejected");
                ApiError::Conflict("INVALID_TRANSITION", e.to_string())
            }
            CalendarError::Overlap => ApiError::Conflict("APPOINTMENT_OVERLAP", e.to_string()),
            _ => ApiError::validation(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 7] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Confirmed,
        AppointmentStatus::Arrived,
        AppointmentStatus::InProgress,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::NoShow,
    ];

    pub fn code(self) -> i16 {
        match self {
            AppointmentStatus::Scheduled => 0,
            AppointmentStatus::Confirmed => 1,
            AppointmentStatus::Arrived => 2,
            AppointmentStatus::InProgress => 3,
            AppointmentStatus::Completed => 4,
            AppointmentStatus::Cancelled => 5,
            AppointmentStatus::NoShow => 6,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, CalendarError> {
        AppointmentStatus::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or(CalendarError::UnknownStatus(code))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Arrived => "arrived",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    /// Whether the appointment occupies the dentist's chair.
    pub fn is_blocking(self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }

    /// Stored codes of every status that occupies the chair.
    pub fn blocking_codes() -> Vec<i16> {
        Self::ALL
            .into_iter()
            .filter(|s| s.is_blocking())
            .map(Self::code)
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Scheduled, Confirmed | Arrived | Cancelled | NoShow)
                | (Confirmed, Arrived | Cancelled | NoShow)
                | (Arrived, InProgress | Cancelled)
                | (InProgress, Completed)
        )
    }
}

pub fn check_transition(
    from: AppointmentStatus,
    to: AppointmentStatus,
) -> Result<(), CalendarError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(CalendarError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn validate_window(start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Result<(), CalendarError> {
    if end_at <= start_at {
        return Err(CalendarError::EndBeforeStart);
    }
    if end_at - start_at > Duration::hours(MAX_APPOINTMENT_HOURS) {
        return Err(CalendarError::TooLong);
    }
    Ok(())
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| CalendarError::InvalidDate(raw.to_string()))
}

/// The clinic's calendar date right now.
pub fn clinic_today(offset_minutes: i32) -> NaiveDate {
    (Utc::now() + Duration::minutes(i64::from(offset_minutes))).date_naive()
}

/// UTC bounds `[start, end)` covering `days` local days starting at `first`.
pub fn local_day_range(
    first: NaiveDate,
    days: i64,
    offset_minutes: i32,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CalendarError> {
    if !(1..=MAX_RANGE_DAYS).contains(&days) {
        return Err(CalendarError::InvalidDays);
    }
    let local_midnight = first.and_time(chrono::NaiveTime::MIN);
    let start = DateTime::<Utc>::from_naive_utc_and_offset(local_midnight, Utc)
        - Duration::minutes(i64::from(offset_minutes));
    Ok((start, start + Duration::days(days)))
}

/* -------------------------
   Row folding
--------------------------*/

/// One appointment joined with one of its planned treatments (or none).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppointmentJoinRow {
    pub appointment_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: i16,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub color: Option<i32>,
    pub patient_id: Uuid,
    pub p_first: String,
    pub p_last: String,
    pub p_record: String,
    pub dentist_id: Uuid,
    pub d_name: String,
    pub item_treatment_id: Option<Uuid>,
    pub item_code: Option<String>,
    pub item_name: Option<String>,
    pub item_qty: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct PlannedItem {
    pub treatment_id: Uuid,
    pub code: String,
    pub name: String,
    pub qty: i32,
}

#[derive(Debug, Serialize)]
pub struct AppointmentBlock {
    pub appointment_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub color: Option<i32>,
    pub patient: PersonBrief,
    pub dentist: PersonBrief,
    pub planned_items: Vec<PlannedItem>,
    pub planned_summary: String,
}

/// Collapse joined rows into one block per appointment, keeping the order
/// in which appointments first appear.
pub fn fold_rows(rows: Vec<AppointmentJoinRow>) -> Result<Vec<AppointmentBlock>, CalendarError> {
    let mut blocks: Vec<AppointmentBlock> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();

    for r in rows {
        let idx = match index.get(&r.appointment_id) {
            Some(&idx) => idx,
            None => {
                blocks.push(AppointmentBlock {
                    appointment_id: r.appointment_id,
                    start_at: r.start_at,
                    end_at: r.end_at,
                    status: AppointmentStatus::from_code(r.status)?,
                    reason: r.reason.clone(),
                    note: r.note.clone(),
                    color: r.color,
                    patient: PersonBrief {
                        id: r.patient_id,
                        display: format!("{} {}", r.p_first, r.p_last),
                        number: Some(r.p_record.clone()),
                    },
                    dentist: PersonBrief {
                        id: r.dentist_id,
                        display: r.d_name.clone(),
                        number: None,
                    },
                    planned_items: Vec::new(),
                    planned_summary: String::new(),
                });
                index.insert(r.appointment_id, blocks.len() - 1);
                blocks.len() - 1
            }
        };

        if let Some(treatment_id) = r.item_treatment_id {
            blocks[idx].planned_items.push(PlannedItem {
                treatment_id,
                code: r.item_code.unwrap_or_default(),
                name: r.item_name.unwrap_or_else(|| "Treatment".into()),
                qty: r.item_qty.unwrap_or(1),
            });
        }
    }

    for b in &mut blocks {
        b.planned_summary = planned_summary(&b.planned_items);
    }
    Ok(blocks)
}

fn planned_summary(items: &[PlannedItem]) -> String {
    if items.is_empty() {
        return "(no planned treatments)".into();
    }
    items
        .iter()
        .map(|it| {
            if it.qty <= 1 {
                it.name.clone()
            } else {
                format!("{}×{}", it.name, it.qty)
            }
        })
        .collect::<Vec<_>>()
        .join(" + ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, h, m, 0).unwrap()
    }

    fn row(id: Uuid, start: DateTime<Utc>, item: Option<(&str, i32)>) -> AppointmentJoinRow {
        AppointmentJoinRow {
            appointment_id: id,
            start_at: start,
            end_at: start + Duration::minutes(30),
            status: 0,
            reason: Some("checkup".into()),
            note: None,
            color: None,
            patient_id: Uuid::nil(),
            p_first: "Ana".into(),
            p_last: "Lopez".into(),
            p_record: "P-000001".into(),
            dentist_id: Uuid::nil(),
            d_name: "Dr. Ruiz".into(),
            item_treatment_id: item.map(|_| Uuid::new_v4()),
            item_code: item.map(|(n, _)| n.to_uppercase()),
            item_name: item.map(|(n, _)| n.to_string()),
            item_qty: item.map(|(_, q)| q),
        }
    }

    #[test]
    fn lifecycle_transitions() {
        use AppointmentStatus::*;
        assert!(Scheduled.can_transition_to(Confirmed));
        assert!(Scheduled.can_transition_to(Arrived));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(Arrived.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));

        assert!(!Scheduled.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Cancelled));
        assert!(!Scheduled.can_transition_to(Scheduled));
        for terminal in [Completed, Cancelled, NoShow] {
            assert!(terminal.is_terminal());
            for next in AppointmentStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn invalid_transition_reports_both_states() {
        let err = check_transition(AppointmentStatus::Cancelled, AppointmentStatus::Arrived).unwrap_err();
        assert_eq!(err.to_string(), "cannot move an appointment from cancelled to arrived");
    }

    #[test]
    fn cancelled_and_no_show_free_the_chair() {
        assert!(AppointmentStatus::Scheduled.is_blocking());
        assert!(AppointmentStatus::Completed.is_blocking());
        assert!(!AppointmentStatus::Cancelled.is_blocking());
        assert!(!AppointmentStatus::NoShow.is_blocking());
    }

    #[test]
    fn overlap_check_ignores_only_cancelled_and_no_show() {
        let codes = AppointmentStatus::blocking_codes();
        assert_eq!(codes.len(), AppointmentStatus::ALL.len() - 2);
        assert!(!codes.contains(&AppointmentStatus::Cancelled.code()));
        assert!(!codes.contains(&AppointmentStatus::NoShow.code()));
        assert!(codes.contains(&AppointmentStatus::Scheduled.code()));
        assert!(codes.contains(&AppointmentStatus::Completed.code()));
    }

    #[test]
    fn status_codes_round_trip() {
        for s in AppointmentStatus::ALL {
            assert_eq!(AppointmentStatus::from_code(s.code()), Ok(s));
        }
        assert_eq!(AppointmentStatus::from_code(7), Err(CalendarError::UnknownStatus(7)));
    }

    #[test]
    fn windows_must_be_positive_and_bounded() {
        assert!(validate_window(at(9, 0), at(9, 30)).is_ok());
        assert_eq!(validate_window(at(9, 0), at(9, 0)), Err(CalendarError::EndBeforeStart));
        assert_eq!(validate_window(at(10, 0), at(9, 0)), Err(CalendarError::EndBeforeStart));
        assert_eq!(
            validate_window(at(6, 0), at(6, 0) + Duration::hours(13)),
            Err(CalendarError::TooLong)
        );
    }

    #[test]
    fn local_range_shifts_by_offset() {
        let first = NaiveDate::from_ymd_opt(2024, 4, 2).unwrap();
        let (start, end) = local_day_range(first, 7, -300).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 4, 2, 5, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 4, 9, 5, 0, 0).unwrap());
        assert_eq!(local_day_range(first, 0, 0), Err(CalendarError::InvalidDays));
        assert_eq!(local_day_range(first, 32, 0), Err(CalendarError::InvalidDays));
    }

    #[test]
    fn parse_date_rejects_other_formats() {
        assert!(parse_date(" 2024-02-29 ").is_ok());
        assert!(parse_date("02/29/2024").is_err());
        assert!(parse_date("2023-02-29").is_err());
    }

    #[test]
    fn fold_groups_items_and_keeps_time_order() {
        let late = Uuid::from_u128(1);
        let early = Uuid::from_u128(2);
        let blocks = fold_rows(vec![
            row(early, at(8, 0), Some(("cleaning", 1))),
            row(early, at(8, 0), Some(("filling", 2))),
            row(late, at(11, 0), None),
        ])
        .unwrap();

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].appointment_id, early);
        assert_eq!(blocks[0].planned_items.len(), 2);
        assert_eq!(blocks[0].planned_summary, "cleaning + filling×2");
        assert_eq!(blocks[0].patient.display, "Ana Lopez");
        assert_eq!(blocks[1].appointment_id, late);
        assert_eq!(blocks[1].planned_summary, "(no planned treatments)");
    }

    #[test]
    fn fold_rejects_unknown_status_codes() {
        let mut r = row(Uuid::new_v4(), at(8, 0), None);
        r.status = 42;
        assert_eq!(fold_rows(vec![r]).unwrap_err(), CalendarError::UnknownStatus(42));
    }
}
