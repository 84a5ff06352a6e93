use crate::services::reliability::materialize::{DriveDayRecord, MaterializedTable};
use chrono::NaiveDate;
use duckdb::Row;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};

pub const DAYS_PER_YEAR: f64 = 365.0;
pub const HOURS_PER_YEAR: f64 = 24.0 * DAYS_PER_YEAR;

/// Which population an AFR is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfrMode {
    /// Every drive-day the filter matches, aggregated in the engine.
    FullAggregate,
    /// Only the row-limited sample that was materialized. Depends on the
    /// sample size and is not comparable to the full-aggregate figure.
    SampledSubset,
}

impl AfrMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "full" | "full_aggregate" | "aggregate" => Some(Self::FullAggregate),
            "sampled" | "sampled_subset" | "sample" => Some(Self::SampledSubset),
            _ => None,
        }
    }
}

/// One row of the aggregate query shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub model: Option<String>,
    pub drive_days: u64,
    pub failures: u64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub avg_failure_hours: Option<f64>,
}

impl AggregateRow {
    /// Reads the measures starting at column `offset`.
    pub(crate) fn from_row(
        row: &Row<'_>,
        offset: usize,
        model: Option<String>,
    ) -> duckdb::Result<Self> {
        let drive_days: i64 = row.get(offset)?;
        let failures: Option<i64> = row.get(offset + 1)?;
        Ok(Self {
            model,
            drive_days: drive_days.max(0) as u64,
            failures: failures.unwrap_or(0).max(0) as u64,
            first_date: row.get(offset + 2)?,
            last_date: row.get(offset + 3)?,
            avg_failure_hours: row.get(offset + 4)?,
        })
    }

    /// The same measures computed over a materialized sample.
    pub fn from_sample(sample: &MaterializedTable, model: Option<String>) -> Self {
        let failure_hours: Vec<f64> = sample
            .failure_rows()
            .filter_map(|row| row.power_on_hours)
            .map(|hours| hours as f64)
            .collect();
        Self {
            model,
            drive_days: sample.len() as u64,
            failures: sample.failures(),
            first_date: sample.first_date(),
            last_date: sample.last_date(),
            avg_failure_hours: mean(&failure_hours),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityReport {
    pub model: Option<String>,
    pub afr_mode: AfrMode,
    pub total_drive_days: u64,
    pub total_failures: u64,
    pub annualized_failure_rate_pct: f64,
    pub first_observed: Option<NaiveDate>,
    pub last_observed: Option<NaiveDate>,
    /// `None` when nothing failed.
    pub avg_power_on_hours_at_failure: Option<f64>,
}

impl ReliabilityReport {
    pub fn is_empty(&self) -> bool {
        self.total_drive_days == 0
    }

    pub fn avg_power_on_hours_at_failure_or_zero(&self) -> f64 {
        self.avg_power_on_hours_at_failure.unwrap_or(0.0)
    }
}

/// `(failures / (drive_days / 365)) * 100`, or 0 when there are no drive-days.
pub fn annualized_failure_rate(failures: u64, drive_days: u64) -> f64 {
    if drive_days == 0 {
        return 0.0;
    }
    (failures as f64 / (drive_days as f64 / DAYS_PER_YEAR)) * 100.0
}

pub fn compute_report(row: &AggregateRow, afr_mode: AfrMode) -> ReliabilityReport {
    if row.failures > row.drive_days {
        tracing::warn!(
            model = ?row.model,
            failures = row.failures,
            drive_days = row.drive_days,
            "aggregate has more failures than drive-days"
        );
    }
    let avg_power_on_hours_at_failure = if row.failures == 0 {
        None
    } else {
        row.avg_failure_hours.filter(|hours| hours.is_finite())
    };
    ReliabilityReport {
        model: row.model.clone(),
        afr_mode,
        total_drive_days: row.drive_days,
        total_failures: row.failures,
        annualized_failure_rate_pct: annualized_failure_rate(row.failures, row.drive_days),
        first_observed: row.first_date,
        last_observed: row.last_date,
        avg_power_on_hours_at_failure,
    }
}

/// Lowest AFR first. Equal rates keep their input order; reports with no
/// drive-days have no meaningful rate and go last.
pub fn rank_by_afr(mut reports: Vec<ReliabilityReport>) -> Vec<ReliabilityReport> {
    reports.sort_by(|a, b| {
        a.is_empty().cmp(&b.is_empty()).then_with(|| {
            a.annualized_failure_rate_pct
                .total_cmp(&b.annualized_failure_rate_pct)
        })
    });
    reports
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyFailurePoint {
    pub month: NaiveDate,
    pub drive_days: u64,
    pub failures: u64,
    pub annualized_failure_rate_pct: f64,
}

impl MonthlyFailurePoint {
    pub(crate) fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        let drive_days: i64 = row.get(1)?;
        let failures: i64 = row.get(2)?;
        let drive_days = drive_days.max(0) as u64;
        let failures = failures.max(0) as u64;
        Ok(Self {
            month: row.get(0)?,
            drive_days,
            failures,
            annualized_failure_rate_pct: annualized_failure_rate(failures, drive_days),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeHistogramBucket {
    pub bucket_start_hours: i64,
    pub bucket_end_hours: i64,
    pub failures: u64,
}

impl AgeHistogramBucket {
    pub(crate) fn from_row(row: &Row<'_>, bucket_hours: u64) -> duckdb::Result<Self> {
        let start: i64 = row.get(0)?;
        let failures: i64 = row.get(1)?;
        Ok(Self {
            bucket_start_hours: start,
            bucket_end_hours: start.saturating_add(bucket_hours as i64),
            failures: failures.max(0) as u64,
        })
    }
}

/// Power-on hours at the failing day, over failure rows that report them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeAtFailureStats {
    pub failures: u64,
    pub mean_hours: f64,
    pub median_hours: f64,
    pub p90_hours: f64,
    pub min_hours: f64,
    pub max_hours: f64,
    pub mean_years: f64,
}

pub fn age_at_failure_stats<'a, I>(rows: I) -> Option<AgeAtFailureStats>
where
    I: IntoIterator<Item = &'a DriveDayRecord>,
{
    let hours: Vec<f64> = rows
        .into_iter()
        .filter(|row| row.failure)
        .filter_map(|row| row.power_on_hours)
        .map(|hours| hours as f64)
        .collect();
    let mean_hours = mean(&hours)?;
    let min_hours = hours.iter().copied().fold(f64::INFINITY, f64::min);
    let max_hours = hours.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let failures = hours.len() as u64;

    let mut data = Data::new(hours);
    Some(AgeAtFailureStats {
        failures,
        mean_hours,
        median_hours: data.quantile(0.5),
        p90_hours: data.quantile(0.9),
        min_hours,
        max_hours,
        mean_years: mean_hours / HOURS_PER_YEAR,
    })
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(model: &str, drive_days: u64, failures: u64) -> AggregateRow {
        AggregateRow {
            model: Some(model.to_string()),
            drive_days,
            failures,
            ..AggregateRow::default()
        }
    }

    fn failed(hours: i64) -> DriveDayRecord {
        DriveDayRecord {
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            serial_number: format!("S{hours}"),
            model: "ST4000DM000".to_string(),
            capacity_bytes: 0,
            failure: true,
            power_on_hours: Some(hours),
        }
    }

    #[test]
    fn zero_drive_days_yield_zero_afr() {
        assert_eq!(annualized_failure_rate(0, 0), 0.0);
        assert_eq!(annualized_failure_rate(3, 0), 0.0);
    }

    #[test]
    fn afr_is_finite_and_non_negative_for_well_formed_inputs() {
        for drive_days in [1u64, 2, 365, 10_000, 5_000_000_000] {
            for failures in [0u64, 1, drive_days / 2, drive_days] {
                let afr = annualized_failure_rate(failures, drive_days);
                assert!(afr.is_finite() && afr >= 0.0, "{failures}/{drive_days} -> {afr}");
            }
        }
    }

    #[test]
    fn three_day_single_failure_sample_blows_up_unsmoothed() {
        let report = compute_report(&aggregate("M", 3, 1), AfrMode::FullAggregate);
        assert_eq!(report.total_drive_days, 3);
        assert_eq!(report.total_failures, 1);
        let expected = (1.0 / (3.0 / 365.0)) * 100.0;
        assert!((report.annualized_failure_rate_pct - expected).abs() < 1e-9);
        assert!((report.annualized_failure_rate_pct - 12_166.666_666_666_666).abs() < 1e-6);
    }

    #[test]
    fn empty_aggregate_gives_zeroed_report() {
        let report = compute_report(&AggregateRow::default(), AfrMode::FullAggregate);
        assert!(report.is_empty());
        assert_eq!(report.total_failures, 0);
        assert_eq!(report.annualized_failure_rate_pct, 0.0);
        assert_eq!(report.first_observed, None);
        assert_eq!(report.avg_power_on_hours_at_failure, None);
        assert_eq!(report.avg_power_on_hours_at_failure_or_zero(), 0.0);
    }

    #[test]
    fn average_hours_are_not_applicable_without_failures() {
        let mut row = aggregate("M", 100, 0);
        row.avg_failure_hours = Some(1234.0);
        let report = compute_report(&row, AfrMode::SampledSubset);
        assert_eq!(report.avg_power_on_hours_at_failure, None);
        assert_eq!(report.afr_mode, AfrMode::SampledSubset);
    }

    #[test]
    fn comparison_ranks_lower_afr_first() {
        // 3 failures over 73,000 drive-days is 1.5%; 9 over 365,000 is 0.9%.
        let a = compute_report(&aggregate("A", 73_000, 3), AfrMode::FullAggregate);
        let b = compute_report(&aggregate("B", 365_000, 9), AfrMode::FullAggregate);
        assert!((a.annualized_failure_rate_pct - 1.5).abs() < 1e-9);
        assert!((b.annualized_failure_rate_pct - 0.9).abs() < 1e-9);

        let ranked = rank_by_afr(vec![a, b]);
        let order: Vec<_> = ranked.iter().map(|r| r.model.as_deref()).collect();
        assert_eq!(order, vec![Some("B"), Some("A")]);
    }

    #[test]
    fn ties_keep_input_order() {
        let ranked = rank_by_afr(vec![
            compute_report(&aggregate("first", 365, 1), AfrMode::FullAggregate),
            compute_report(&aggregate("second", 730, 2), AfrMode::FullAggregate),
            compute_report(&aggregate("best", 365, 0), AfrMode::FullAggregate),
        ]);
        let order: Vec<_> = ranked.iter().map(|r| r.model.as_deref()).collect();
        assert_eq!(order, vec![Some("best"), Some("first"), Some("second")]);
    }

    #[test]
    fn models_without_drive_days_rank_last() {
        let ranked = rank_by_afr(vec![
            compute_report(&aggregate("missing", 0, 0), AfrMode::FullAggregate),
            compute_report(&aggregate("observed", 365, 2), AfrMode::FullAggregate),
        ]);
        let order: Vec<_> = ranked.iter().map(|r| r.model.as_deref()).collect();
        assert_eq!(order, vec![Some("observed"), Some("missing")]);
    }

    #[test]
    fn age_at_failure_summary() {
        let rows = vec![failed(100), failed(300), failed(200)];
        let stats = age_at_failure_stats(&rows).unwrap();
        assert_eq!(stats.failures, 3);
        assert!((stats.mean_hours - 200.0).abs() < 1e-9);
        assert!((stats.median_hours - 200.0).abs() < 1e-9);
        assert!(stats.p90_hours >= stats.median_hours && stats.p90_hours <= stats.max_hours);
        assert_eq!(stats.min_hours, 100.0);
        assert_eq!(stats.max_hours, 300.0);
        assert!((stats.mean_years - 200.0 / HOURS_PER_YEAR).abs() < 1e-12);
        assert_eq!(age_at_failure_stats(&Vec::new()), None);
    }

    #[test]
    fn sample_aggregate_counts_rows_as_drive_days() {
        let mut healthy = failed(50);
        healthy.failure = false;
        let sample = MaterializedTable {
            rows: vec![healthy, failed(400)],
            row_limit: Some(2),
            truncated: true,
        };
        let row = AggregateRow::from_sample(&sample, Some("ST4000DM000".to_string()));
        assert_eq!(row.drive_days, 2);
        assert_eq!(row.failures, 1);
        assert_eq!(row.avg_failure_hours, Some(400.0));
    }
}
