//! Parameter-bound query construction against a resolved drive-stats table.
//!
//! User-supplied model text only ever travels as a bound parameter. The few
//! values rendered into the SQL text are typed integers (limits, bucket widths)
//! or operator configuration that is validated/quoted by the table resolver.

use crate::error::{DriveStatsError, DriveStatsResult};
use crate::services::reliability::table::ScannableTable;
use chrono::NaiveDate;
use duckdb::types::ToSqlOutput;
use duckdb::ToSql;
use serde::{Deserialize, Serialize};

const FAILED_ROW: &str = "CAST(failure AS INTEGER) = 1";

/// How a model name is matched.
///
/// Exact filters compare case-sensitively; fuzzy filters are
/// case-insensitive substring matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "match", content = "pattern", rename_all = "snake_case")]
pub enum ModelFilter {
    Exact(String),
    Fuzzy(String),
}

impl ModelFilter {
    pub fn exact(model: impl Into<String>) -> Self {
        Self::Exact(model.into())
    }

    pub fn fuzzy(pattern: impl Into<String>) -> Self {
        Self::Fuzzy(pattern.into())
    }

    pub fn pattern(&self) -> &str {
        match self {
            Self::Exact(value) | Self::Fuzzy(value) => value,
        }
    }

    /// In-process equivalent of the engine predicate.
    pub fn matches(&self, model: &str) -> bool {
        match self {
            Self::Exact(value) => model == value,
            Self::Fuzzy(pattern) => model.to_lowercase().contains(&pattern.to_lowercase()),
        }
    }

    fn validate(&self) -> DriveStatsResult<()> {
        let pattern = self.pattern();
        if pattern.trim().is_empty() {
            return Err(DriveStatsError::query("model filter must not be empty"));
        }
        if pattern.contains('\0') {
            return Err(DriveStatsError::query(
                "model filter must not contain NUL characters",
            ));
        }
        Ok(())
    }

    fn predicate(&self) -> DriveStatsResult<(&'static str, SqlParam)> {
        self.validate()?;
        Ok(match self {
            Self::Exact(model) => ("model = ?", SqlParam::Text(model.clone())),
            Self::Fuzzy(pattern) => (
                r"model ILIKE ? ESCAPE '\'",
                SqlParam::Text(format!("%{}%", escape_like(pattern))),
            ),
        })
    }
}

/// Inclusive calendar-day bounds; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    fn validate(&self) -> DriveStatsResult<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(DriveStatsError::query(format!(
                    "date window start {start} is after end {end}"
                )));
            }
        }
        Ok(())
    }
}

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    BigInt(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        match self {
            Self::Text(value) => value.to_sql(),
            Self::BigInt(value) => value.to_sql(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
    /// Row cap the materializer must enforce for this query, if any.
    pub row_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateGrouping {
    /// One row for everything the predicate matches.
    Total,
    /// One row per model, the `top_n` largest by drive-day volume.
    ByModel { top_n: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    pub filter: Option<ModelFilter>,
    pub window: DateWindow,
    pub grouping: AggregateGrouping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSelection {
    pub filter: Option<ModelFilter>,
    pub failures_only: bool,
    pub window: DateWindow,
    /// Required unless `failures_only` is set.
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineQuery {
    pub filter: ModelFilter,
    pub window: DateWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeHistogramQuery {
    pub filter: ModelFilter,
    pub window: DateWindow,
    pub bucket_hours: u64,
}

#[derive(Default)]
struct Predicates {
    clauses: Vec<String>,
    params: Vec<SqlParam>,
}

impl Predicates {
    fn model(&mut self, filter: Option<&ModelFilter>) -> DriveStatsResult<()> {
        if let Some(filter) = filter {
            let (clause, param) = filter.predicate()?;
            self.clauses.push(clause.to_string());
            self.params.push(param);
        }
        Ok(())
    }

    fn window(&mut self, window: &DateWindow) -> DriveStatsResult<()> {
        window.validate()?;
        if let Some(start) = window.start {
            self.clauses.push("date >= CAST(? AS DATE)".to_string());
            self.params.push(SqlParam::Text(start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = window.end {
            self.clauses.push("date <= CAST(? AS DATE)".to_string());
            self.params.push(SqlParam::Text(end.format("%Y-%m-%d").to_string()));
        }
        Ok(())
    }

    fn raw(&mut self, clause: impl Into<String>) {
        self.clauses.push(clause.into());
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join("\n                  AND "))
        }
    }
}

/// Builds the query shapes the reliability service runs.
pub struct QueryBuilder<'a> {
    table: &'a ScannableTable,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(table: &'a ScannableTable) -> Self {
        Self { table }
    }

    pub fn aggregate(&self, query: &AggregateQuery) -> DriveStatsResult<BuiltQuery> {
        let mut predicates = Predicates::default();
        predicates.model(query.filter.as_ref())?;
        predicates.window(&query.window)?;

        let poh = self.table.power_on_hours_column();
        let measures = format!(
            r#"COUNT(*) AS drive_days,
                    CAST(COALESCE(SUM(CASE WHEN {FAILED_ROW} THEN 1 ELSE 0 END), 0) AS BIGINT) AS failures,
                    MIN(date) AS first_date,
                    MAX(date) AS last_date,
                    AVG(CAST({poh} AS DOUBLE)) FILTER (WHERE {FAILED_ROW}) AS avg_failure_hours"#
        );
        let from = self.table.from_clause();
        let where_sql = predicates.where_sql();

        let (sql, row_limit) = match query.grouping {
            AggregateGrouping::Total => (
                format!(
                    r#"
                SELECT {measures}
                FROM {from}
                {where_sql}
                "#
                ),
                Some(1),
            ),
            AggregateGrouping::ByModel { top_n } => {
                if top_n == 0 {
                    return Err(DriveStatsError::query("top-N size must be at least 1"));
                }
                (
                    format!(
                        r#"
                SELECT model,
                    {measures}
                FROM {from}
                {where_sql}
                GROUP BY model
                ORDER BY drive_days DESC, model
                LIMIT {top_n}
                "#
                    ),
                    Some(top_n),
                )
            }
        };

        Ok(BuiltQuery {
            sql,
            params: predicates.params,
            row_limit,
        })
    }

    pub fn rows(&self, selection: &RowSelection) -> DriveStatsResult<BuiltQuery> {
        if selection.limit.is_none() && !selection.failures_only {
            return Err(DriveStatsError::query(
                "a row limit is required unless the selection is restricted to failures",
            ));
        }

        let mut predicates = Predicates::default();
        predicates.model(selection.filter.as_ref())?;
        predicates.window(&selection.window)?;
        if selection.failures_only {
            predicates.raw(FAILED_ROW);
        }

        let poh = self.table.power_on_hours_column();
        let from = self.table.from_clause();
        let where_sql = predicates.where_sql();
        let limit_sql = selection
            .limit
            // One row past the cap lets the materializer report truncation.
            .map(|limit| format!("LIMIT {}", limit.saturating_add(1)))
            .unwrap_or_default();

        let sql = format!(
            r#"
                SELECT date,
                    serial_number,
                    model,
                    CAST(capacity_bytes AS BIGINT) AS capacity_bytes,
                    CAST(failure AS INTEGER) AS failure,
                    CAST({poh} AS BIGINT) AS power_on_hours
                FROM {from}
                {where_sql}
                ORDER BY date DESC, serial_number
                {limit_sql}
                "#
        );

        Ok(BuiltQuery {
            sql,
            params: predicates.params,
            row_limit: selection.limit,
        })
    }

    /// Monthly drive-days and failures, oldest month first.
    pub fn timeline(&self, query: &TimelineQuery) -> DriveStatsResult<BuiltQuery> {
        let mut predicates = Predicates::default();
        predicates.model(Some(&query.filter))?;
        predicates.window(&query.window)?;

        let from = self.table.from_clause();
        let where_sql = predicates.where_sql();
        let sql = format!(
            r#"
                SELECT CAST(date_trunc('month', date) AS DATE) AS month,
                    COUNT(*) AS drive_days,
                    CAST(COALESCE(SUM(CASE WHEN {FAILED_ROW} THEN 1 ELSE 0 END), 0) AS BIGINT) AS failures
                FROM {from}
                {where_sql}
                GROUP BY 1
                ORDER BY 1
                "#
        );

        Ok(BuiltQuery {
            sql,
            params: predicates.params,
            row_limit: None,
        })
    }

    /// Failure counts bucketed by power-on hours at the failing day.
    pub fn age_histogram(&self, query: &AgeHistogramQuery) -> DriveStatsResult<BuiltQuery> {
        if query.bucket_hours == 0 {
            return Err(DriveStatsError::query("histogram bucket width must be at least 1 hour"));
        }
        let bucket = query.bucket_hours;
        let poh = self.table.power_on_hours_column();

        let mut predicates = Predicates::default();
        predicates.model(Some(&query.filter))?;
        predicates.window(&query.window)?;
        predicates.raw(FAILED_ROW);
        predicates.raw(format!("{poh} IS NOT NULL"));

        let from = self.table.from_clause();
        let where_sql = predicates.where_sql();
        let sql = format!(
            r#"
                SELECT CAST(FLOOR(CAST({poh} AS DOUBLE) / {bucket}) AS BIGINT) * {bucket} AS bucket_start,
                    COUNT(*) AS failures
                FROM {from}
                {where_sql}
                GROUP BY 1
                ORDER BY 1
                "#
        );

        Ok(BuiltQuery {
            sql,
            params: predicates.params,
            row_limit: None,
        })
    }
}

pub(crate) fn quote_literal(input: &str) -> String {
    format!("'{}'", input.replace('\'', "''"))
}

pub(crate) fn is_sql_identifier(input: &str) -> bool {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
