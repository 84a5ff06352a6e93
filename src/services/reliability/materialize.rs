use crate::error::{DriveStatsError, DriveStatsResult};
use crate::services::reliability::query::BuiltQuery;
use chrono::NaiveDate;
use duckdb::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};

/// One drive observed on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveDayRecord {
    pub date: NaiveDate,
    pub serial_number: String,
    pub model: String,
    pub capacity_bytes: i64,
    pub failure: bool,
    pub power_on_hours: Option<i64>,
}

impl DriveDayRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        let failure: Option<i32> = row.get(4)?;
        Ok(Self {
            date: row.get(0)?,
            serial_number: row.get(1)?,
            model: row.get(2)?,
            capacity_bytes: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            failure: failure.unwrap_or(0) != 0,
            power_on_hours: row.get(5)?,
        })
    }

    pub fn capacity(&self, unit: CapacityUnit) -> f64 {
        unit.from_bytes(self.capacity_bytes)
    }
}

/// Terabyte convention for capacity conversions. Both are in use by callers
/// and neither is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityUnit {
    /// 10^12 bytes.
    DecimalTerabytes,
    /// 2^40 bytes.
    BinaryTebibytes,
}

impl CapacityUnit {
    pub fn bytes_per_unit(self) -> f64 {
        match self {
            Self::DecimalTerabytes => 1e12,
            Self::BinaryTebibytes => (1u64 << 40) as f64,
        }
    }

    pub fn from_bytes(self, bytes: i64) -> f64 {
        bytes as f64 / self.bytes_per_unit()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::DecimalTerabytes => "TB",
            Self::BinaryTebibytes => "TiB",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "decimal" | "tb" => Some(Self::DecimalTerabytes),
            "binary" | "tib" => Some(Self::BinaryTebibytes),
            _ => None,
        }
    }
}

/// Rows pulled back into the process, never more than `row_limit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializedTable {
    pub rows: Vec<DriveDayRecord>,
    pub row_limit: Option<u64>,
    /// The source had more rows than the cap allowed.
    pub truncated: bool,
}

impl MaterializedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn failures(&self) -> u64 {
        self.rows.iter().filter(|row| row.failure).count() as u64
    }

    pub fn failure_rows(&self) -> impl Iterator<Item = &DriveDayRecord> {
        self.rows.iter().filter(|row| row.failure)
    }

    pub fn average_capacity(&self, unit: CapacityUnit) -> Option<f64> {
        if self.rows.is_empty() {
            return None;
        }
        let total: f64 = self.rows.iter().map(|row| row.capacity(unit)).sum();
        Some(total / self.rows.len() as f64)
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|row| row.date).min()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|row| row.date).max()
    }
}

/// Collects records up to `row_limit`, reading at most one row past it to
/// detect truncation.
pub fn materialize<I>(rows: I, row_limit: Option<u64>) -> DriveStatsResult<MaterializedTable>
where
    I: IntoIterator<Item = DriveStatsResult<DriveDayRecord>>,
{
    let cap = row_limit.map(|limit| usize::try_from(limit).unwrap_or(usize::MAX));
    let mut out = Vec::with_capacity(cap.unwrap_or(0).min(16_384));
    let mut truncated = false;

    for row in rows {
        let row = row?;
        if cap.is_some_and(|cap| out.len() >= cap) {
            truncated = true;
            break;
        }
        out.push(row);
    }

    Ok(MaterializedTable {
        rows: out,
        row_limit,
        truncated,
    })
}

/// Runs a row-selection query and materializes its records.
pub(crate) fn fetch_records(
    conn: &Connection,
    query: &BuiltQuery,
    attempts: u64,
) -> DriveStatsResult<MaterializedTable> {
    let mut stmt = conn
        .prepare(&query.sql)
        .map_err(|err| DriveStatsError::from_engine(err, attempts))?;
    let rows = stmt
        .query_map(params_from_iter(query.params.iter()), DriveDayRecord::from_row)
        .map_err(|err| DriveStatsError::from_engine(err, attempts))?;
    materialize(
        rows.map(|row| row.map_err(|err| DriveStatsError::from_engine(err, attempts))),
        query.row_limit,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(day: u32, failure: bool, capacity_bytes: i64) -> DriveDayRecord {
        DriveDayRecord {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            serial_number: format!("S{day}"),
            model: "ST4000DM000".to_string(),
            capacity_bytes,
            failure,
            power_on_hours: Some(10_000 + day as i64),
        }
    }

    #[test]
    fn never_holds_more_rows_than_the_limit() {
        for limit in [0u64, 1, 5, 20, 50] {
            let source = (1..=20).map(|day| Ok(record(day, false, 0)));
            let table = materialize(source, Some(limit)).unwrap();
            assert!(table.len() as u64 <= limit, "limit {limit} exceeded");
            assert_eq!(table.truncated, limit < 20);
        }
    }

    #[test]
    fn errors_from_the_source_abort_materialization() {
        let source = vec![
            Ok(record(1, false, 0)),
            Err(DriveStatsError::query("boom")),
            Ok(record(2, false, 0)),
        ];
        assert!(materialize(source, Some(10)).is_err());
    }

    #[test]
    fn capacity_conventions_are_explicit() {
        let table = MaterializedTable {
            rows: vec![record(1, false, 4_000_000_000_000), record(2, true, 4_000_000_000_000)],
            row_limit: Some(10),
            truncated: false,
        };
        let decimal = table.average_capacity(CapacityUnit::DecimalTerabytes).unwrap();
        let binary = table.average_capacity(CapacityUnit::BinaryTebibytes).unwrap();
        assert!((decimal - 4.0).abs() < 1e-12);
        assert!((binary - 4_000_000_000_000f64 / 1_099_511_627_776f64).abs() < 1e-12);
        assert_eq!(table.failures(), 1);
        assert_eq!(MaterializedTable::default().average_capacity(CapacityUnit::DecimalTerabytes), None);
    }

    #[test]
    fn unit_names_parse() {
        assert_eq!(CapacityUnit::parse("decimal"), Some(CapacityUnit::DecimalTerabytes));
        assert_eq!(CapacityUnit::parse("TiB"), Some(CapacityUnit::BinaryTebibytes));
        assert_eq!(CapacityUnit::parse("gb"), None);
    }
}
