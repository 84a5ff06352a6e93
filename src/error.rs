use thiserror::Error;

/// Failures surfaced by the reliability query layer.
///
/// A query that matches zero rows is not represented here; see
/// [`crate::services::reliability::QueryOutcome`].
#[derive(Debug, Error)]
pub enum DriveStatsError {
    /// Extension install/load or connection configuration failed. No query can
    /// succeed on this session afterwards.
    #[error("connection setup failed during {stage}: {diagnostic}")]
    Setup { stage: String, diagnostic: String },

    /// Timeout or connectivity failure that outlived the engine's retry budget.
    #[error("remote dataset unreachable after {attempts} attempt(s): {source}")]
    TransientNetwork {
        attempts: u64,
        #[source]
        source: duckdb::Error,
    },

    /// Malformed filter, bound or query shape, rejected before execution.
    #[error("invalid query: {0}")]
    Query(String),

    /// The engine rejected or failed the query for a non-network reason.
    #[error("query execution failed: {0}")]
    Execution(#[source] duckdb::Error),

    #[error("export failed: {0}")]
    Export(String),

    #[error("query task failed: {0}")]
    Task(String),
}

pub type DriveStatsResult<T> = Result<T, DriveStatsError>;

// Substrings the engine uses for connectivity failures against the object
// store. Status-bearing HTTP errors are classified by their status instead.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection error for http",
    "timed out",
    "timeout was reached",
    "connection refused",
    "connection reset",
    "could not resolve host",
    "could not establish connection",
    "network is unreachable",
];

// Request failures that carry no status code.
const STATUSLESS_HTTP_MARKERS: &[&str] = &["http get error", "http head error"];

impl DriveStatsError {
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    pub fn setup(stage: impl Into<String>, diagnostic: impl std::fmt::Display) -> Self {
        Self::Setup {
            stage: stage.into(),
            diagnostic: diagnostic.to_string(),
        }
    }

    /// Classifies an engine error raised while scanning or fetching metadata.
    ///
    /// `attempts` is the total number of tries the engine made (its configured
    /// retry count plus the initial attempt).
    pub fn from_engine(source: duckdb::Error, attempts: u64) -> Self {
        if is_transient_message(&source.to_string()) {
            tracing::warn!(attempts, error = %source, "remote scan failed with a network error");
            Self::TransientNetwork { attempts, source }
        } else {
            Self::Execution(source)
        }
    }

    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Setup { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }
}

impl From<tokio::task::JoinError> for DriveStatsError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<csv::Error> for DriveStatsError {
    fn from(err: csv::Error) -> Self {
        Self::Export(err.to_string())
    }
}

impl From<std::io::Error> for DriveStatsError {
    fn from(err: std::io::Error) -> Self {
        Self::Export(err.to_string())
    }
}

fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    match http_status(&lowered) {
        // Throttling and server-side failures outlive retries the same way a
        // dropped connection does; other client errors are permanent.
        Some(status) => status == 429 || (500..=599).contains(&status),
        None => TRANSIENT_MARKERS
            .iter()
            .chain(STATUSLESS_HTTP_MARKERS)
            .any(|marker| lowered.contains(marker)),
    }
}

/// First `http NNN` status code in a lowercased engine diagnostic.
fn http_status(lowered: &str) -> Option<u16> {
    lowered.match_indices("http ").find_map(|(idx, marker)| {
        let digits = lowered.get(idx + marker.len()..idx + marker.len() + 3)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let status: u16 = digits.parse().ok()?;
        (100..=599).contains(&status).then_some(status)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_diagnostics_are_classified_as_transient() {
        assert!(is_transient_message(
            "IO Error: Connection error for HTTP HEAD to 's3://bucket/metadata'"
        ));
        assert!(is_transient_message("HTTP GET error: request timed out"));
        assert!(!is_transient_message(
            "Binder Error: Referenced column \"modle\" not found"
        ));
        assert!(!is_transient_message(
            "IO Error: No files found that match the pattern \"/tmp/missing.parquet\""
        ));
        assert!(is_transient_message(
            "HTTP Error: HTTP GET error on 'https://bucket/data.parquet' (HTTP 503)"
        ));
        assert!(is_transient_message("IO Error: Could not establish connection"));
    }

    #[test]
    fn client_errors_and_quoted_uris_are_not_transient() {
        assert!(!is_transient_message(
            "HTTP Error: HTTP GET error on 'https://bucket/metadata/version-hint.text' (HTTP 403)"
        ));
        assert!(!is_transient_message(
            "HTTP Error: HTTP HEAD error on 'https://bucket/drivestats' (HTTP 404)"
        ));
        assert!(!is_transient_message(
            "Binder Error: Referenced column \"modle\" not found in FROM clause of iceberg_scan('https://example.org/drivestats')"
        ));
        assert!(is_transient_message(
            "HTTP Error: HTTP GET error on 'https://bucket/x' (HTTP 429)"
        ));
    }

    #[test]
    fn status_codes_are_read_from_diagnostics() {
        assert_eq!(http_status("http get error on 'x' (http 403)"), Some(403));
        assert_eq!(http_status("http get error on 'https://a/b'"), None);
        assert_eq!(http_status("see http 2 for details"), None);
    }

    #[test]
    fn query_errors_are_neither_setup_nor_transient() {
        let err = DriveStatsError::query("empty model filter");
        assert!(!err.is_setup());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "invalid query: empty model filter");
    }
}
