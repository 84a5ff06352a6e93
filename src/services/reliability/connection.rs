use crate::error::{DriveStatsError, DriveStatsResult};
use crate::services::reliability::query::{is_sql_identifier, quote_literal};
use crate::services::reliability::security;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStyle {
    Path,
    VirtualHost,
}

impl UrlStyle {
    fn setting_value(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::VirtualHost => "vhost",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "path" => Some(Self::Path),
            "vhost" | "virtual-host" | "virtual_host" => Some(Self::VirtualHost),
            _ => None,
        }
    }
}

/// Object-store access parameters for the remote table.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteAccess {
    pub region: String,
    pub endpoint: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub use_ssl: bool,
    pub url_style: UrlStyle,
}

impl fmt::Debug for RemoteAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAccess")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("use_ssl", &self.use_ssl)
            .field("url_style", &self.url_style)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Engine extensions installed and loaded on first acquisition, in order.
    pub extensions: Vec<String>,
    /// `None` keeps the session local-only (no object-store or HTTP settings).
    pub remote: Option<RemoteAccess>,
    pub memory_limit: Option<String>,
    pub threads: u32,
    pub http_timeout: Duration,
    pub http_retries: u64,
    /// Lets the table scan pick the newest metadata file when the catalog
    /// pointer is stale or missing.
    pub version_guessing: bool,
    pub temp_directory: Option<PathBuf>,
}

impl ConnectionSettings {
    /// Settings for scanning local files only; nothing is downloaded.
    pub fn local() -> Self {
        Self {
            extensions: Vec::new(),
            remote: None,
            memory_limit: None,
            threads: 2,
            http_timeout: Duration::from_secs(30),
            http_retries: 3,
            version_guessing: false,
            temp_directory: None,
        }
    }

    /// Total tries the engine makes for one remote request.
    pub fn engine_attempts(&self) -> u64 {
        self.http_retries.saturating_add(1)
    }

    fn has_extension(&self, name: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SetupStatement {
    pub stage: String,
    pub sql: String,
}

/// Renders the one-time session setup, in execution order.
pub(crate) fn setup_statements(
    settings: &ConnectionSettings,
) -> DriveStatsResult<Vec<SetupStatement>> {
    let mut out = Vec::new();
    let mut push = |stage: String, sql: String| out.push(SetupStatement { stage, sql });

    for ext in &settings.extensions {
        if !is_sql_identifier(ext) {
            return Err(DriveStatsError::setup(
                format!("extension {ext}"),
                "extension names must be plain identifiers",
            ));
        }
        push(format!("extension {ext}"), format!("INSTALL {ext}; LOAD {ext};"));
    }

    if let Some(remote) = settings.remote.as_ref() {
        push(
            "s3 region".to_string(),
            format!("SET s3_region={}", quote_literal(&remote.region)),
        );
        push(
            "s3 endpoint".to_string(),
            format!("SET s3_endpoint={}", quote_literal(&remote.endpoint)),
        );
        if let Some(key_id) = remote.access_key_id.as_deref() {
            push(
                "s3 credentials".to_string(),
                format!("SET s3_access_key_id={}", quote_literal(key_id)),
            );
        }
        if let Some(secret) = remote.secret_access_key.as_deref() {
            push(
                "s3 credentials".to_string(),
                format!("SET s3_secret_access_key={}", quote_literal(secret)),
            );
        }
        push(
            "s3 tls".to_string(),
            format!("SET s3_use_ssl={}", remote.use_ssl),
        );
        push(
            "s3 url style".to_string(),
            format!(
                "SET s3_url_style={}",
                quote_literal(remote.url_style.setting_value())
            ),
        );
        // The engine takes whole seconds.
        push(
            "http timeout".to_string(),
            format!("SET http_timeout={}", settings.http_timeout.as_secs().max(1)),
        );
        push(
            "http retries".to_string(),
            format!("SET http_retries={}", settings.http_retries),
        );
    }

    if settings.version_guessing && settings.has_extension("iceberg") {
        push(
            "metadata version guessing".to_string(),
            "SET unsafe_enable_version_guessing=true".to_string(),
        );
    }

    if let Some(limit) = settings.memory_limit.as_deref() {
        push(
            "memory limit".to_string(),
            format!("SET memory_limit={}", quote_literal(limit)),
        );
    }
    push(
        "threads".to_string(),
        format!("SET threads={}", settings.threads.max(1)),
    );

    Ok(out)
}

/// The long-lived engine session shared by every query.
pub struct ConnectionHandle {
    conn: Mutex<Connection>,
    settings: ConnectionSettings,
    established_at: DateTime<Utc>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("settings", &self.settings)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub(crate) fn lock(&self) -> DriveStatsResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DriveStatsError::Task("engine session lock poisoned".to_string()))
    }

    fn establish(settings: &ConnectionSettings) -> DriveStatsResult<Self> {
        let statements = setup_statements(settings)?;
        let conn = Connection::open_in_memory()
            .map_err(|err| DriveStatsError::setup("open session", err))?;

        for statement in &statements {
            conn.execute_batch(&statement.sql)
                .map_err(|err| DriveStatsError::setup(statement.stage.clone(), err))?;
        }

        // Best-effort session niceties.
        let _ = conn.execute_batch("SET enable_progress_bar=false");
        if let Some(tmp_dir) = settings.temp_directory.as_ref() {
            match security::prepare_private_dir(tmp_dir) {
                Ok(tmp_dir) => {
                    let _ = conn.execute_batch(&format!(
                        "SET temp_directory={}",
                        quote_literal(&tmp_dir.display().to_string())
                    ));
                }
                Err(err) => {
                    tracing::warn!(path = %tmp_dir.display(), error = %err, "failed to prepare engine temp directory");
                }
            }
        }

        tracing::info!(
            extensions = ?settings.extensions,
            remote = settings.remote.is_some(),
            threads = settings.threads,
            http_retries = settings.http_retries,
            version_guessing = settings.version_guessing,
            "engine session established"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            settings: settings.clone(),
            established_at: Utc::now(),
        })
    }
}

enum HandleSlot {
    Empty,
    Ready(Arc<ConnectionHandle>),
    Failed { stage: String, diagnostic: String },
}

/// Hands out the session handle, running setup at most once.
///
/// A setup failure is remembered: later calls return the same error instead of
/// silently trying again.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    slot: Mutex<HandleSlot>,
    setup_runs: AtomicU64,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            slot: Mutex::new(HandleSlot::Empty),
            setup_runs: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn acquire(&self) -> DriveStatsResult<Arc<ConnectionHandle>> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| DriveStatsError::Task("connection manager lock poisoned".to_string()))?;

        match &*slot {
            HandleSlot::Ready(handle) => return Ok(handle.clone()),
            HandleSlot::Failed { stage, diagnostic } => {
                return Err(DriveStatsError::setup(stage.clone(), diagnostic));
            }
            HandleSlot::Empty => {}
        }

        self.setup_runs.fetch_add(1, Ordering::SeqCst);
        match ConnectionHandle::establish(&self.settings) {
            Ok(handle) => {
                let handle = Arc::new(handle);
                *slot = HandleSlot::Ready(handle.clone());
                Ok(handle)
            }
            Err(DriveStatsError::Setup { stage, diagnostic }) => {
                tracing::error!(stage = %stage, error = %diagnostic, "engine session setup failed");
                *slot = HandleSlot::Failed {
                    stage: stage.clone(),
                    diagnostic: diagnostic.clone(),
                };
                Err(DriveStatsError::Setup { stage, diagnostic })
            }
            Err(err) => Err(err),
        }
    }

    /// Number of times setup has actually executed.
    pub fn setup_runs(&self) -> u64 {
        self.setup_runs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_settings() -> ConnectionSettings {
        ConnectionSettings {
            extensions: vec!["httpfs".to_string(), "iceberg".to_string()],
            remote: Some(RemoteAccess {
                region: "us-west-004".to_string(),
                endpoint: "s3.us-west-004.backblazeb2.com".to_string(),
                access_key_id: Some("key-id".to_string()),
                secret_access_key: Some("s3cr3t'quote".to_string()),
                use_ssl: true,
                url_style: UrlStyle::Path,
            }),
            memory_limit: Some("4GB".to_string()),
            threads: 4,
            http_timeout: Duration::from_millis(45_000),
            http_retries: 5,
            version_guessing: true,
            temp_directory: None,
        }
    }

    #[test]
    fn setup_loads_extensions_before_remote_parameters() {
        let statements = setup_statements(&remote_settings()).unwrap();
        let sql: Vec<&str> = statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql[0], "INSTALL httpfs; LOAD httpfs;");
        assert_eq!(sql[1], "INSTALL iceberg; LOAD iceberg;");
        assert!(sql.contains(&"SET s3_region='us-west-004'"));
        assert!(sql.contains(&"SET s3_url_style='path'"));
        assert!(sql.contains(&"SET s3_use_ssl=true"));
        assert!(sql.contains(&"SET s3_secret_access_key='s3cr3t''quote'"));
        assert!(sql.contains(&"SET http_timeout=45"));
        assert!(sql.contains(&"SET http_retries=5"));
        assert!(sql.contains(&"SET unsafe_enable_version_guessing=true"));
        assert!(sql.contains(&"SET memory_limit='4GB'"));
        assert_eq!(sql.last(), Some(&"SET threads=4"));
    }

    #[test]
    fn local_sessions_skip_object_store_settings() {
        let statements = setup_statements(&ConnectionSettings::local()).unwrap();
        assert!(statements.iter().all(|s| !s.sql.contains("s3_")));
        assert!(statements.iter().all(|s| !s.sql.contains("http_")));
        assert!(statements
            .iter()
            .all(|s| !s.sql.contains("version_guessing")));
    }

    #[test]
    fn debug_output_redacts_the_secret_key() {
        let rendered = format!("{:?}", remote_settings());
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn repeated_acquisition_reuses_the_same_session() {
        let manager = ConnectionManager::new(ConnectionSettings::local());
        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.settings(), second.settings());
        assert_eq!(first.established_at(), second.established_at());
        assert_eq!(manager.setup_runs(), 1);
    }

    #[test]
    fn setup_failure_is_sticky_and_not_retried() {
        let mut settings = ConnectionSettings::local();
        settings.memory_limit = Some("not-a-size".to_string());
        let manager = ConnectionManager::new(settings);

        let first = manager.acquire().unwrap_err();
        assert!(first.is_setup(), "unexpected error: {first}");
        let second = manager.acquire().unwrap_err();
        assert!(second.is_setup());
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(manager.setup_runs(), 1);
    }

    #[test]
    fn extension_names_must_be_identifiers() {
        let mut settings = ConnectionSettings::local();
        settings.extensions = vec!["iceberg; DROP TABLE x".to_string()];
        let err = setup_statements(&settings).unwrap_err();
        assert!(err.is_setup());
    }
}
