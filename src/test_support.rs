use anyhow::Result;
use duckdb::{params, Connection};
use std::path::Path;

use crate::services::reliability::query::quote_literal;

pub const FOUR_TB: i64 = 4_000_787_030_016;

#[derive(Debug, Clone)]
pub struct FixtureRow {
    pub date: String,
    pub serial_number: String,
    pub model: String,
    pub capacity_bytes: i64,
    pub failure: i32,
    pub power_on_hours: Option<i64>,
}

impl FixtureRow {
    pub fn new(date: &str, serial_number: &str, model: &str, failure: i32) -> Self {
        Self {
            date: date.to_string(),
            serial_number: serial_number.to_string(),
            model: model.to_string(),
            capacity_bytes: FOUR_TB,
            failure,
            power_on_hours: None,
        }
    }

    pub fn hours(mut self, hours: i64) -> Self {
        self.power_on_hours = Some(hours);
        self
    }

    pub fn capacity(mut self, capacity_bytes: i64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }
}

/// Writes a drive-stats shaped Parquet file using the engine itself.
pub fn write_drive_days(path: &Path, rows: &[FixtureRow]) -> Result<()> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "CREATE TABLE drive_days(
            date DATE,
            serial_number VARCHAR,
            model VARCHAR,
            capacity_bytes BIGINT,
            failure INTEGER,
            smart_9_raw BIGINT
        )",
    )?;
    {
        let mut insert =
            conn.prepare("INSERT INTO drive_days VALUES (CAST(? AS DATE), ?, ?, ?, ?, ?)")?;
        for row in rows {
            insert.execute(params![
                row.date,
                row.serial_number,
                row.model,
                row.capacity_bytes,
                row.failure,
                row.power_on_hours
            ])?;
        }
    }
    conn.execute_batch(&format!(
        "COPY drive_days TO {} (FORMAT PARQUET)",
        quote_literal(&path.display().to_string())
    ))?;
    Ok(())
}

/// `count` consecutive healthy days for one drive starting at `start`
/// (`YYYY-MM-DD`), hours increasing by 24 per day.
pub fn healthy_days(start: &str, serial: &str, model: &str, count: u32) -> Vec<FixtureRow> {
    let Ok(first) = chrono::NaiveDate::parse_from_str(start, "%Y-%m-%d") else {
        return Vec::new();
    };
    (0..count)
        .map(|offset| {
            let date = first + chrono::Duration::days(offset as i64);
            FixtureRow::new(&date.format("%Y-%m-%d").to_string(), serial, model, 0)
                .hours(1_000 + 24 * offset as i64)
        })
        .collect()
}
