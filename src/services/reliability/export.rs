use crate::error::{DriveStatsError, DriveStatsResult};
use crate::services::reliability::materialize::{CapacityUnit, DriveDayRecord};
use crate::services::reliability::security;
use std::io::Write;
use std::path::Path;

/// Writes records as UTF-8 CSV with a header row. Returns the number of data
/// rows written.
pub fn write_rows_csv<'a, W, I>(writer: W, rows: I, unit: CapacityUnit) -> DriveStatsResult<u64>
where
    W: Write,
    I: IntoIterator<Item = &'a DriveDayRecord>,
{
    let mut out = csv::Writer::from_writer(writer);
    let capacity_header = format!("capacity_{}", unit.label().to_lowercase());
    out.write_record([
        "date",
        "serial_number",
        "model",
        "capacity_bytes",
        capacity_header.as_str(),
        "failure",
        "power_on_hours",
    ])?;

    let mut written = 0u64;
    for row in rows {
        out.write_record([
            row.date.format("%Y-%m-%d").to_string(),
            row.serial_number.clone(),
            row.model.clone(),
            row.capacity_bytes.to_string(),
            format!("{:.3}", row.capacity(unit)),
            u8::from(row.failure).to_string(),
            row.power_on_hours
                .map(|hours| hours.to_string())
                .unwrap_or_default(),
        ])?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

/// Writes records to `path`, replacing any existing file.
pub fn export_rows_csv<'a, I>(path: &Path, rows: I, unit: CapacityUnit) -> DriveStatsResult<u64>
where
    I: IntoIterator<Item = &'a DriveDayRecord>,
{
    let file = std::fs::File::create(path).map_err(|err| {
        DriveStatsError::Export(format!("failed to create {}: {err}", path.display()))
    })?;
    let written = write_rows_csv(std::io::BufWriter::new(file), rows, unit)?;
    security::restrict_export_file(path).map_err(|err| DriveStatsError::Export(format!("{err:#}")))?;
    tracing::info!(path = %path.display(), rows = written, unit = unit.label(), "exported drive-day rows");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn failed_row() -> DriveDayRecord {
        DriveDayRecord {
            date: NaiveDate::from_ymd_opt(2023, 11, 5).unwrap(),
            serial_number: "ZA1\"B,2".to_string(),
            model: "ST8000NM0055".to_string(),
            capacity_bytes: 8_001_563_222_016,
            failure: true,
            power_on_hours: Some(41_234),
        }
    }

    #[test]
    fn csv_has_header_and_quotes_awkward_fields() {
        let mut buf = Vec::new();
        let written =
            write_rows_csv(&mut buf, &[failed_row()], CapacityUnit::DecimalTerabytes).unwrap();
        assert_eq!(written, 1);
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("date,serial_number,model,capacity_bytes,capacity_tb,failure,power_on_hours")
        );
        assert_eq!(
            lines.next(),
            Some("2023-11-05,\"ZA1\"\"B,2\",ST8000NM0055,8001563222016,8.002,1,41234")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn missing_hours_export_as_empty_fields() {
        let mut row = failed_row();
        row.power_on_hours = None;
        row.serial_number = "S1".to_string();
        let mut buf = Vec::new();
        write_rows_csv(&mut buf, &[row], CapacityUnit::BinaryTebibytes).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("date,serial_number,model,capacity_bytes,capacity_tib,"));
        assert!(text.lines().nth(1).unwrap().ends_with(",1,"));
    }

    #[test]
    fn exports_to_a_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("failures.csv");
        let written = export_rows_csv(&path, &[failed_row()], CapacityUnit::DecimalTerabytes)?;
        assert_eq!(written, 1);
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text.lines().count(), 2);
        Ok(())
    }
}
