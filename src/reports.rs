//! Range handling and zero-filling for the reporting endpoints. The
//! aggregation itself happens in the `report_*` stored functions.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::billing::PaymentMethod;
use crate::calendar::parse_date;
use crate::error::ApiError;

const MAX_DAY_SPAN: i64 = 366;
const MAX_MONTH_SPAN_MONTHS: u32 = 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("{0:?} is not a YYYY-MM-DD date")]
    InvalidDate(String),
    #[error("unknown grain {0:?}; expected day or month")]
    InvalidGrain(String),
    #[error("from must not be after to")]
    Inverted,
    #[error("range too long for {0} grain")]
    TooLong(&'static str),
}

impl From<ReportError> for ApiError {
    fn from(e: ReportError) -> Self {
        ApiError::validation(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grain {
    Day,
    Month,
}

impl Grain {
    pub fn parse(raw: Option<&str>) -> Result<Self, ReportError> {
        match raw.map(str::trim).unwrap_or("day") {
            "" | "day" => Ok(Grain::Day),
            "month" => Ok(Grain::Month),
            other => Err(ReportError::InvalidGrain(other.to_string())),
        }
    }

    /// Argument for `date_trunc`.
    pub fn as_sql(self) -> &'static str {
        match self {
            Grain::Day => "day",
            Grain::Month => "month",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

fn first_of_month(d: NaiveDate) -> NaiveDate {
    d.with_day(1).unwrap_or(d)
}

/// Inclusive date range from query strings. Missing bounds default to the
/// last 30 days (day grain) or the last 12 months (month grain) up to `today`.
pub fn resolve_range(
    from: Option<&str>,
    to: Option<&str>,
    grain: Grain,
    today: NaiveDate,
) -> Result<ReportRange, ReportError> {
    let parse = |s: &str| parse_date(s).map_err(|_| ReportError::InvalidDate(s.to_string()));

    let to = match to.filter(|s| !s.trim().is_empty()) {
        Some(s) => parse(s)?,
        None => today,
    };
    let from = match from.filter(|s| !s.trim().is_empty()) {
        Some(s) => parse(s)?,
        None => match grain {
            Grain::Day => to.checked_sub_days(Days::new(29)).unwrap_or(to),
            Grain::Month => first_of_month(to)
                .checked_sub_months(Months::new(11))
                .unwrap_or(to),
        },
    };

    if from > to {
        return Err(ReportError::Inverted);
    }
    match grain {
        Grain::Day if (to - from).num_days() >= MAX_DAY_SPAN => Err(ReportError::TooLong("day")),
        Grain::Month
            if from
                .checked_add_months(Months::new(MAX_MONTH_SPAN_MONTHS))
                .is_none_or(|limit| to >= limit) =>
        {
            Err(ReportError::TooLong("month"))
        }
        _ => Ok(ReportRange { from, to }),
    }
}

/// Every bucket start in the range, in order.
pub fn bucket_starts(range: ReportRange, grain: Grain) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut cur = match grain {
        Grain::Day => range.from,
        Grain::Month => first_of_month(range.from),
    };
    while cur <= range.to {
        out.push(cur);
        let next = match grain {
            Grain::Day => cur.checked_add_days(Days::new(1)),
            Grain::Month => cur.checked_add_months(Months::new(1)),
        };
        match next {
            Some(n) => cur = n,
            None => break,
        }
    }
    out
}

/* -------------------------
   Income
--------------------------*/

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IncomeRow {
    pub bucket: NaiveDate,
    pub method: i16,
    pub total_cents: i64,
    pub payment_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodTotals {
    pub cash: i64,
    pub card: i64,
    pub transfer: i64,
    pub other: i64,
}

impl MethodTotals {
    fn add(&mut self, method: PaymentMethod, cents: i64) {
        match method {
            PaymentMethod::Cash => self.cash += cents,
            PaymentMethod::Card => self.card += cents,
            PaymentMethod::Transfer => self.transfer += cents,
            PaymentMethod::Other => self.other += cents,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomeBucket {
    pub bucket: NaiveDate,
    pub total_cents: i64,
    pub payment_count: i64,
    pub by_method: MethodTotals,
}

#[derive(Debug, Serialize)]
pub struct IncomeReport {
    pub range: ReportRange,
    pub grain: Grain,
    pub buckets: Vec<IncomeBucket>,
    pub total_cents: i64,
    pub payment_count: i64,
    pub by_method: MethodTotals,
}

pub fn income_report(range: ReportRange, grain: Grain, rows: Vec<IncomeRow>) -> IncomeReport {
    let mut buckets: Vec<IncomeBucket> = bucket_starts(range, grain)
        .into_iter()
        .map(|bucket| IncomeBucket {
            bucket,
            total_cents: 0,
            payment_count: 0,
            by_method: MethodTotals::default(),
        })
        .collect();
    let mut by_method = MethodTotals::default();

    for row in rows {
        let method = PaymentMethod::from_code(row.method).unwrap_or(PaymentMethod::Other);
        by_method.add(method, row.total_cents);
        match buckets.binary_search_by_key(&row.bucket, |b| b.bucket) {
            Ok(idx) => {
                let b = &mut buckets[idx];
                b.total_cents += row.total_cents;
                b.payment_count += row.payment_count;
                b.by_method.add(method, row.total_cents);
            }
            Err(_) => {
                tracing::warn!(bucket = %row.bucket, "income row outside requested range");
            }
        }
    }

    IncomeReport {
        range,
        grain,
        total_cents: buckets.iter().map(|b| b.total_cents).sum(),
        payment_count: buckets.iter().map(|b| b.payment_count).sum(),
        by_method,
        buckets,
    }
}

/* -------------------------
   Counts per bucket
--------------------------*/

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CountRow {
    pub bucket: NaiveDate,
    pub patient_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountBucket {
    pub bucket: NaiveDate,
    pub count: i64,
}

pub fn fill_counts(range: ReportRange, grain: Grain, rows: Vec<CountRow>) -> Vec<CountBucket> {
    let mut out: Vec<CountBucket> = bucket_starts(range, grain)
        .into_iter()
        .map(|bucket| CountBucket { bucket, count: 0 })
        .collect();
    for row in rows {
        if let Ok(idx) = out.binary_search_by_key(&row.bucket, |b| b.bucket) {
            out[idx].count += row.patient_count;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn default_ranges() {
        let today = d(2024, 3, 15);
        let r = resolve_range(None, None, Grain::Day, today).unwrap();
        assert_eq!(r, ReportRange { from: d(2024, 2, 15), to: today });

        let r = resolve_range(None, Some(""), Grain::Month, today).unwrap();
        assert_eq!(r, ReportRange { from: d(2023, 4, 1), to: today });
    }

    #[test]
    fn range_validation() {
        let today = d(2024, 3, 15);
        assert_eq!(
            resolve_range(Some("2024-03-10"), Some("2024-03-01"), Grain::Day, today),
            Err(ReportError::Inverted)
        );
        assert_eq!(
            resolve_range(Some("2023-01-01"), Some("2024-03-01"), Grain::Day, today),
            Err(ReportError::TooLong("day"))
        );
        assert!(resolve_range(Some("2023-01-01"), Some("2024-03-01"), Grain::Month, today).is_ok());
        assert_eq!(
            resolve_range(Some("2015-01-01"), Some("2024-03-01"), Grain::Month, today),
            Err(ReportError::TooLong("month"))
        );
        assert_eq!(
            resolve_range(Some("yesterday"), None, Grain::Day, today),
            Err(ReportError::InvalidDate("yesterday".into()))
        );
    }

    #[test]
    fn month_grain_is_capped_at_sixty_months() {
        let today = d(2025, 6, 1);
        let r = resolve_range(Some("2019-01-01"), Some("2023-12-31"), Grain::Month, today).unwrap();
        assert_eq!(bucket_starts(r, Grain::Month).len(), 60);
        assert_eq!(
            resolve_range(Some("2019-01-01"), Some("2024-01-01"), Grain::Month, today),
            Err(ReportError::TooLong("month"))
        );
        assert_eq!(
            resolve_range(Some("2019-01-01"), Some("2024-12-31"), Grain::Month, today),
            Err(ReportError::TooLong("month"))
        );
    }

    #[test]
    fn grain_parsing() {
        assert_eq!(Grain::parse(None), Ok(Grain::Day));
        assert_eq!(Grain::parse(Some("month")), Ok(Grain::Month));
        assert!(Grain::parse(Some("week")).is_err());
    }

    #[test]
    fn month_buckets_start_on_the_first() {
        let r = ReportRange { from: d(2024, 1, 20), to: d(2024, 4, 2) };
        assert_eq!(
            bucket_starts(r, Grain::Month),
            vec![d(2024, 1, 1), d(2024, 2, 1), d(2024, 3, 1), d(2024, 4, 1)]
        );
        let r = ReportRange { from: d(2024, 2, 28), to: d(2024, 3, 1) };
        assert_eq!(bucket_starts(r, Grain::Day).len(), 3);
    }

    #[test]
    fn income_is_zero_filled_and_split_by_method() {
        let r = ReportRange { from: d(2024, 5, 1), to: d(2024, 5, 4) };
        let report = income_report(
            r,
            Grain::Day,
            vec![
                IncomeRow { bucket: d(2024, 5, 2), method: 0, total_cents: 1_000, payment_count: 2 },
                IncomeRow { bucket: d(2024, 5, 2), method: 1, total_cents: 2_500, payment_count: 1 },
                IncomeRow { bucket: d(2024, 5, 4), method: 2, total_cents: 700, payment_count: 1 },
            ],
        );

        assert_eq!(report.buckets.len(), 4);
        assert_eq!(report.buckets[0].total_cents, 0);
        assert_eq!(report.buckets[1].total_cents, 3_500);
        assert_eq!(report.buckets[1].payment_count, 3);
        assert_eq!(report.buckets[1].by_method.card, 2_500);
        assert_eq!(report.buckets[3].by_method.transfer, 700);
        assert_eq!(report.total_cents, 4_200);
        assert_eq!(report.payment_count, 4);
        assert_eq!(
            report.by_method,
            MethodTotals { cash: 1_000, card: 2_500, transfer: 700, other: 0 }
        );
    }

    #[test]
    fn counts_are_zero_filled() {
        let r = ReportRange { from: d(2024, 1, 1), to: d(2024, 3, 31) };
        let counts = fill_counts(
            r,
            Grain::Month,
            vec![CountRow { bucket: d(2024, 2, 1), patient_count: 7 }],
        );
        let values: Vec<i64> = counts.iter().map(|c| c.count).collect();
        assert_eq!(values, vec![0, 7, 0]);
    }
}
