use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::reliability::connection::{ConnectionSettings, RemoteAccess, UrlStyle};
use crate::services::reliability::duckdb_service::ReliabilityServiceOptions;
use crate::services::reliability::materialize::CapacityUnit;
use crate::services::reliability::metrics::AfrMode;
use crate::services::reliability::query::is_sql_identifier;
use crate::services::reliability::table::{TableFormat, TableResolverOptions};

pub const DEFAULT_DATASET_URI: &str = "s3://drivestats-iceberg/drivestats";
const DEFAULT_S3_REGION: &str = "us-west-004";
const DEFAULT_S3_ENDPOINT: &str = "s3.us-west-004.backblazeb2.com";
const DEFAULT_EXTENSIONS: &str = "httpfs,iceberg";
const DEFAULT_POWER_ON_HOURS_COLUMN: &str = "smart_9_raw";

#[derive(Debug, Clone)]
pub struct DriveStatsConfig {
    pub dataset_uri: String,
    /// `None` infers the format from the URI.
    pub table_format: Option<TableFormat>,
    pub metadata_version: Option<String>,
    pub remote: RemoteAccess,
    pub memory_limit: Option<String>,
    pub threads: u32,
    pub http_timeout_ms: u64,
    pub http_retries: u64,
    pub version_guessing: bool,
    pub extensions: Vec<String>,
    pub power_on_hours_column: String,
    pub default_row_limit: u64,
    pub max_row_limit: u64,
    pub capacity_unit: CapacityUnit,
    pub afr_mode: AfrMode,
    pub temp_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    dataset_uri: Option<String>,
    #[serde(default)]
    table_format: Option<String>,
    #[serde(default)]
    metadata_version: Option<String>,
    #[serde(default)]
    s3_region: Option<String>,
    #[serde(default)]
    s3_endpoint: Option<String>,
    #[serde(default)]
    s3_access_key_id: Option<String>,
    #[serde(default)]
    s3_secret_access_key: Option<String>,
    #[serde(default)]
    s3_use_ssl: Option<bool>,
    #[serde(default)]
    s3_url_style: Option<String>,
    #[serde(default)]
    memory_limit: Option<String>,
    #[serde(default)]
    threads: Option<u32>,
    #[serde(default)]
    http_timeout_ms: Option<u64>,
    #[serde(default)]
    http_retries: Option<u64>,
    #[serde(default)]
    version_guessing: Option<bool>,
    #[serde(default)]
    extensions: Option<Vec<String>>,
    #[serde(default)]
    power_on_hours_column: Option<String>,
    #[serde(default)]
    default_row_limit: Option<u64>,
    #[serde(default)]
    max_row_limit: Option<u64>,
    #[serde(default)]
    capacity_unit: Option<String>,
    #[serde(default)]
    afr_mode: Option<String>,
    #[serde(default)]
    temp_directory: Option<String>,
}

fn config_overrides_path() -> Option<PathBuf> {
    env_optional_string("DRIVESTATS_CONFIG_PATH").map(PathBuf::from)
}

fn load_config_overrides() -> Option<ConfigOverrides> {
    let path = config_overrides_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config overrides file not found; using env values");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config overrides; using env values"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse config overrides; using env values"
            );
            None
        }
    }
}

impl DriveStatsConfig {
    pub fn from_env() -> Result<Self> {
        let table_format = parse_table_format(&env_string("DRIVESTATS_TABLE_FORMAT", "auto"))?;
        let url_style = parse_url_style(&env_string("DRIVESTATS_S3_URL_STYLE", "path"))?;
        let capacity_unit = parse_capacity_unit(&env_string("DRIVESTATS_CAPACITY_UNIT", "binary"))?;
        let afr_mode = parse_afr_mode(&env_string("DRIVESTATS_AFR_MODE", "full"))?;

        let mut config = Self {
            dataset_uri: env_string("DRIVESTATS_DATASET_URI", DEFAULT_DATASET_URI),
            table_format,
            metadata_version: env_optional_string("DRIVESTATS_METADATA_VERSION"),
            remote: RemoteAccess {
                region: env_string("DRIVESTATS_S3_REGION", DEFAULT_S3_REGION),
                endpoint: env_string("DRIVESTATS_S3_ENDPOINT", DEFAULT_S3_ENDPOINT),
                access_key_id: env_optional_string("DRIVESTATS_S3_ACCESS_KEY_ID"),
                secret_access_key: env_optional_string("DRIVESTATS_S3_SECRET_ACCESS_KEY"),
                use_ssl: env_bool("DRIVESTATS_S3_USE_SSL", true),
                url_style,
            },
            memory_limit: optional_setting(env_string("DRIVESTATS_MEMORY_LIMIT", "4GB")),
            threads: env_u32("DRIVESTATS_THREADS", 4),
            http_timeout_ms: env_u64("DRIVESTATS_HTTP_TIMEOUT_MS", 30_000),
            http_retries: env_u64("DRIVESTATS_HTTP_RETRIES", 3).min(20),
            version_guessing: env_bool("DRIVESTATS_VERSION_GUESSING", true),
            extensions: parse_extensions(&env_string("DRIVESTATS_EXTENSIONS", DEFAULT_EXTENSIONS)),
            power_on_hours_column: env_string(
                "DRIVESTATS_POWER_ON_HOURS_COLUMN",
                DEFAULT_POWER_ON_HOURS_COLUMN,
            ),
            default_row_limit: env_u64("DRIVESTATS_DEFAULT_ROW_LIMIT", 1_000),
            max_row_limit: env_u64("DRIVESTATS_MAX_ROW_LIMIT", 10_000),
            capacity_unit,
            afr_mode,
            temp_directory: env_optional_string("DRIVESTATS_TEMP_DIRECTORY").map(PathBuf::from),
        };

        if let Some(overrides) = load_config_overrides() {
            config
                .apply_overrides(&overrides)
                .context("invalid value in config overrides")?;
        }

        config.validate()?;
        tracing::debug!(
            dataset_uri = %config.dataset_uri,
            format = ?config.table_format,
            threads = config.threads,
            credentials = config.remote.access_key_id.is_some(),
            "drive stats config loaded"
        );
        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(uri) = trimmed(overrides.dataset_uri.as_deref()) {
            self.dataset_uri = uri.to_string();
        }
        if let Some(raw) = trimmed(overrides.table_format.as_deref()) {
            self.table_format = parse_table_format(raw)?;
        }
        if let Some(version) = overrides.metadata_version.as_deref() {
            self.metadata_version = trimmed(Some(version)).map(str::to_string);
        }
        if let Some(region) = trimmed(overrides.s3_region.as_deref()) {
            self.remote.region = region.to_string();
        }
        if let Some(endpoint) = trimmed(overrides.s3_endpoint.as_deref()) {
            self.remote.endpoint = endpoint.to_string();
        }
        if let Some(key_id) = overrides.s3_access_key_id.as_deref() {
            self.remote.access_key_id = trimmed(Some(key_id)).map(str::to_string);
        }
        if let Some(secret) = overrides.s3_secret_access_key.as_deref() {
            self.remote.secret_access_key = trimmed(Some(secret)).map(str::to_string);
        }
        if let Some(use_ssl) = overrides.s3_use_ssl {
            self.remote.use_ssl = use_ssl;
        }
        if let Some(raw) = trimmed(overrides.s3_url_style.as_deref()) {
            self.remote.url_style = parse_url_style(raw)?;
        }
        if let Some(limit) = overrides.memory_limit.as_deref() {
            self.memory_limit = optional_setting(limit.to_string());
        }
        if let Some(threads) = overrides.threads {
            self.threads = threads;
        }
        if let Some(timeout) = overrides.http_timeout_ms.filter(|v| *v != 0) {
            self.http_timeout_ms = timeout;
        }
        if let Some(retries) = overrides.http_retries {
            self.http_retries = retries.min(20);
        }
        if let Some(guessing) = overrides.version_guessing {
            self.version_guessing = guessing;
        }
        if let Some(extensions) = overrides.extensions.as_ref() {
            self.extensions = extensions
                .iter()
                .map(|ext| ext.trim().to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
        if let Some(column) = trimmed(overrides.power_on_hours_column.as_deref()) {
            self.power_on_hours_column = column.to_string();
        }
        if let Some(limit) = overrides.default_row_limit {
            self.default_row_limit = limit;
        }
        if let Some(limit) = overrides.max_row_limit {
            self.max_row_limit = limit;
        }
        if let Some(raw) = trimmed(overrides.capacity_unit.as_deref()) {
            self.capacity_unit = parse_capacity_unit(raw)?;
        }
        if let Some(raw) = trimmed(overrides.afr_mode.as_deref()) {
            self.afr_mode = parse_afr_mode(raw)?;
        }
        if let Some(dir) = overrides.temp_directory.as_deref() {
            self.temp_directory = trimmed(Some(dir)).map(PathBuf::from);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dataset_uri.trim().is_empty() {
            anyhow::bail!("dataset URI must not be empty");
        }
        if !is_sql_identifier(&self.power_on_hours_column) {
            anyhow::bail!(
                "power-on-hours column {:?} is not a plain identifier",
                self.power_on_hours_column
            );
        }
        if self.threads == 0 {
            anyhow::bail!("thread count must be at least 1");
        }
        if self.max_row_limit == 0 {
            anyhow::bail!("max row limit must be at least 1");
        }
        if self.default_row_limit > self.max_row_limit {
            anyhow::bail!(
                "default row limit {} exceeds max row limit {}",
                self.default_row_limit,
                self.max_row_limit
            );
        }
        if let Some(ext) = self.extensions.iter().find(|ext| !is_sql_identifier(ext)) {
            anyhow::bail!("extension name {ext:?} is not a plain identifier");
        }
        Ok(())
    }

    /// Object-store URIs need the remote settings; local paths do not.
    pub fn is_remote_dataset(&self) -> bool {
        let uri = self.dataset_uri.trim().to_lowercase();
        ["s3://", "s3a://", "http://", "https://", "gcs://", "r2://"]
            .iter()
            .any(|scheme| uri.starts_with(scheme))
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            extensions: self.extensions.clone(),
            remote: self.is_remote_dataset().then(|| self.remote.clone()),
            memory_limit: self.memory_limit.clone(),
            threads: self.threads,
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            http_retries: self.http_retries,
            version_guessing: self.version_guessing,
            temp_directory: self.temp_directory.clone(),
        }
    }

    pub fn resolver_options(&self) -> TableResolverOptions {
        TableResolverOptions {
            format: self.table_format,
            metadata_version: self.metadata_version.clone(),
            power_on_hours_column: self.power_on_hours_column.clone(),
        }
    }

    pub fn service_options(&self) -> ReliabilityServiceOptions {
        ReliabilityServiceOptions {
            dataset_uri: self.dataset_uri.clone(),
            default_row_limit: self.default_row_limit,
            max_row_limit: self.max_row_limit,
            capacity_unit: self.capacity_unit,
        }
    }
}

fn parse_table_format(raw: &str) -> Result<Option<TableFormat>> {
    TableFormat::parse(raw)
        .with_context(|| format!("unknown table format {raw:?} (expected auto, iceberg or parquet)"))
}

fn parse_url_style(raw: &str) -> Result<UrlStyle> {
    UrlStyle::parse(raw).with_context(|| format!("unknown S3 URL style {raw:?}"))
}

fn parse_capacity_unit(raw: &str) -> Result<CapacityUnit> {
    CapacityUnit::parse(raw)
        .with_context(|| format!("unknown capacity unit {raw:?} (expected decimal or binary)"))
}

fn parse_afr_mode(raw: &str) -> Result<AfrMode> {
    AfrMode::parse(raw).with_context(|| format!("unknown AFR mode {raw:?} (expected full or sampled)"))
}

fn parse_extensions(raw: &str) -> Vec<String> {
    if raw.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    raw.split(',')
        .map(|ext| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

/// `off`/`none` leave the engine default in place.
fn optional_setting(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("off")
        || trimmed.eq_ignore_ascii_case("none")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
