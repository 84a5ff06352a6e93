use crate::error::{DriveStatsError, DriveStatsResult};
use crate::services::reliability::connection::ConnectionHandle;
use crate::services::reliability::query::{is_sql_identifier, quote_literal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Columns every drive-stats snapshot must expose, besides the configured
/// power-on-hours attribute.
pub const REQUIRED_COLUMNS: &[&str] = &["date", "serial_number", "model", "capacity_bytes", "failure"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFormat {
    Iceberg,
    Parquet,
}

impl TableFormat {
    /// Parquet for `.parquet` files and globs, Iceberg otherwise.
    pub fn infer(uri: &str) -> Self {
        let trimmed = uri.trim_end_matches('/');
        if trimmed.ends_with(".parquet") || trimmed.contains('*') {
            Self::Parquet
        } else {
            Self::Iceberg
        }
    }

    pub fn parse(raw: &str) -> Option<Option<Self>> {
        match raw.trim().to_lowercase().as_str() {
            "auto" | "" => Some(None),
            "iceberg" => Some(Some(Self::Iceberg)),
            "parquet" => Some(Some(Self::Parquet)),
            _ => None,
        }
    }
}

/// A resolved table the query builder can scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannableTable {
    uri: String,
    format: TableFormat,
    metadata_version: Option<String>,
    power_on_hours_column: String,
    columns: BTreeSet<String>,
}

impl ScannableTable {
    /// A table description that has not been checked against the store.
    pub(crate) fn declared(uri: &str, format: TableFormat, power_on_hours_column: &str) -> Self {
        Self {
            uri: uri.to_string(),
            format,
            metadata_version: None,
            power_on_hours_column: power_on_hours_column.to_string(),
            columns: BTreeSet::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn format(&self) -> TableFormat {
        self.format
    }

    pub fn power_on_hours_column(&self) -> &str {
        &self.power_on_hours_column
    }

    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    /// The table-function call placed in `FROM`.
    pub fn from_clause(&self) -> String {
        let uri = quote_literal(&self.uri);
        match self.format {
            TableFormat::Iceberg => match self.metadata_version.as_deref() {
                Some(version) => format!(
                    "iceberg_scan({uri}, allow_moved_paths = true, version = {})",
                    quote_literal(version)
                ),
                None => format!("iceberg_scan({uri}, allow_moved_paths = true)"),
            },
            TableFormat::Parquet => format!("read_parquet({uri}, union_by_name = true)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableResolverOptions {
    /// `None` infers the format from the URI.
    pub format: Option<TableFormat>,
    /// Pins an Iceberg metadata version instead of following the catalog.
    pub metadata_version: Option<String>,
    pub power_on_hours_column: String,
}

/// Maps a dataset URI to a scannable snapshot, probing its schema once per
/// session.
///
/// Retries of metadata fetches are the engine's job (configured on the
/// connection); resolution never writes to the store.
pub struct TableResolver {
    options: TableResolverOptions,
    resolved: Mutex<HashMap<String, Arc<ScannableTable>>>,
}

impl TableResolver {
    pub fn new(options: TableResolverOptions) -> Self {
        Self {
            options,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(
        &self,
        handle: &ConnectionHandle,
        dataset_uri: &str,
    ) -> DriveStatsResult<Arc<ScannableTable>> {
        let dataset_uri = dataset_uri.trim();
        {
            let cache = self.lock_cache()?;
            if let Some(table) = cache.get(dataset_uri) {
                return Ok(table.clone());
            }
        }

        let mut table = self.declare(dataset_uri)?;
        let columns = probe_columns(handle, &table)?;
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .chain(std::iter::once(table.power_on_hours_column()))
            .filter(|column| !columns.contains(*column))
            .collect();
        if !missing.is_empty() {
            return Err(DriveStatsError::query(format!(
                "table {} is missing required column(s): {}",
                dataset_uri,
                missing.join(", ")
            )));
        }
        table.columns = columns;

        tracing::info!(
            uri = %dataset_uri,
            format = ?table.format,
            metadata_version = ?table.metadata_version,
            columns = table.columns.len(),
            "resolved drive stats table"
        );

        let table = Arc::new(table);
        self.lock_cache()?
            .insert(dataset_uri.to_string(), table.clone());
        Ok(table)
    }

    fn declare(&self, dataset_uri: &str) -> DriveStatsResult<ScannableTable> {
        if dataset_uri.is_empty() {
            return Err(DriveStatsError::query("dataset URI must not be empty"));
        }
        if dataset_uri.contains('\0') {
            return Err(DriveStatsError::query(
                "dataset URI must not contain NUL characters",
            ));
        }
        let column = self.options.power_on_hours_column.as_str();
        if !is_sql_identifier(column) {
            return Err(DriveStatsError::query(format!(
                "power-on-hours column {column:?} is not a plain identifier"
            )));
        }
        let format = self
            .options
            .format
            .unwrap_or_else(|| TableFormat::infer(dataset_uri));
        let mut table = ScannableTable::declared(dataset_uri, format, column);
        if format == TableFormat::Iceberg {
            table.metadata_version = self.options.metadata_version.clone();
        }
        Ok(table)
    }

    fn lock_cache(
        &self,
    ) -> DriveStatsResult<std::sync::MutexGuard<'_, HashMap<String, Arc<ScannableTable>>>> {
        self.resolved
            .lock()
            .map_err(|_| DriveStatsError::Task("table cache lock poisoned".to_string()))
    }
}

fn probe_columns(
    handle: &ConnectionHandle,
    table: &ScannableTable,
) -> DriveStatsResult<BTreeSet<String>> {
    let attempts = handle.settings().engine_attempts();
    let conn = handle.lock()?;
    let sql = format!("DESCRIBE SELECT * FROM {}", table.from_clause());
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|err| DriveStatsError::from_engine(err, attempts))?;
    let mut rows = stmt
        .query([])
        .map_err(|err| DriveStatsError::from_engine(err, attempts))?;
    let mut columns = BTreeSet::new();
    while let Some(row) = rows
        .next()
        .map_err(|err| DriveStatsError::from_engine(err, attempts))?
    {
        let name: String = row
            .get(0)
            .map_err(|err| DriveStatsError::from_engine(err, attempts))?;
        columns.insert(name);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::reliability::connection::{ConnectionManager, ConnectionSettings};
    use crate::test_support::{write_drive_days, FixtureRow};
    use anyhow::Result;

    fn options() -> TableResolverOptions {
        TableResolverOptions {
            format: None,
            metadata_version: None,
            power_on_hours_column: "smart_9_raw".to_string(),
        }
    }

    #[test]
    fn format_inference_follows_the_uri_shape() {
        assert_eq!(
            TableFormat::infer("s3://drivestats-iceberg/drivestats"),
            TableFormat::Iceberg
        );
        assert_eq!(
            TableFormat::infer("/data/drivestats/*.parquet"),
            TableFormat::Parquet
        );
        assert_eq!(TableFormat::infer("/data/day.parquet"), TableFormat::Parquet);
        assert_eq!(TableFormat::parse("auto"), Some(None));
        assert_eq!(TableFormat::parse("ICEBERG"), Some(Some(TableFormat::Iceberg)));
        assert_eq!(TableFormat::parse("delta"), None);
    }

    #[test]
    fn iceberg_scans_tolerate_moved_paths_and_pinned_versions() {
        let resolver = TableResolver::new(TableResolverOptions {
            metadata_version: Some("00042".to_string()),
            ..options()
        });
        let table = resolver.declare("s3://drivestats-iceberg/drivestats").unwrap();
        assert_eq!(
            table.from_clause(),
            "iceberg_scan('s3://drivestats-iceberg/drivestats', allow_moved_paths = true, version = '00042')"
        );
    }

    #[test]
    fn quotes_in_uris_are_escaped() {
        let table = ScannableTable::declared("/tmp/o'brien.parquet", TableFormat::Parquet, "smart_9_raw");
        assert_eq!(
            table.from_clause(),
            "read_parquet('/tmp/o''brien.parquet', union_by_name = true)"
        );
    }

    #[test]
    fn resolves_a_local_table_once_per_session() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("drive_days.parquet");
        write_drive_days(&path, &[FixtureRow::new("2024-01-01", "S1", "ST4000DM000", 0)])?;

        let manager = ConnectionManager::new(ConnectionSettings::local());
        let handle = manager.acquire()?;
        let resolver = TableResolver::new(options());
        let uri = path.display().to_string();

        let first = resolver.resolve(&handle, &uri)?;
        let second = resolver.resolve(&handle, &uri)?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.format(), TableFormat::Parquet);
        assert!(first.columns().contains("smart_9_raw"));
        Ok(())
    }

    #[test]
    fn missing_health_attribute_column_is_a_query_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("drive_days.parquet");
        write_drive_days(&path, &[FixtureRow::new("2024-01-01", "S1", "ST4000DM000", 0)])?;

        let manager = ConnectionManager::new(ConnectionSettings::local());
        let handle = manager.acquire()?;
        let resolver = TableResolver::new(TableResolverOptions {
            power_on_hours_column: "smart_241_raw".to_string(),
            ..options()
        });
        let err = resolver
            .resolve(&handle, &path.display().to_string())
            .unwrap_err();
        assert!(matches!(err, DriveStatsError::Query(ref msg) if msg.contains("smart_241_raw")));
        Ok(())
    }

    #[test]
    fn missing_files_surface_as_engine_errors_not_setup() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let manager = ConnectionManager::new(ConnectionSettings::local());
        let handle = manager.acquire()?;
        let resolver = TableResolver::new(options());
        let err = resolver
            .resolve(&handle, &temp.path().join("absent.parquet").display().to_string())
            .unwrap_err();
        assert!(!err.is_setup());
        assert!(matches!(err, DriveStatsError::Execution(_)));
        Ok(())
    }
}
