use crate::error::{DriveStatsError, DriveStatsResult};
use crate::services::reliability::connection::{ConnectionHandle, ConnectionManager};
use crate::services::reliability::materialize::{fetch_records, CapacityUnit, MaterializedTable};
use crate::services::reliability::metrics::{
    age_at_failure_stats, compute_report, rank_by_afr, AfrMode, AgeAtFailureStats,
    AgeHistogramBucket, AggregateRow, MonthlyFailurePoint, ReliabilityReport,
};
use crate::services::reliability::query::{
    AgeHistogramQuery, AggregateGrouping, AggregateQuery, BuiltQuery, DateWindow, ModelFilter,
    QueryBuilder, RowSelection, TimelineQuery,
};
use crate::services::reliability::table::{ScannableTable, TableResolver};
use duckdb::{params_from_iter, Connection, Row};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliabilityServiceOptions {
    pub dataset_uri: String,
    /// Rows returned when a request names no limit.
    pub default_row_limit: u64,
    /// Upper bound applied to every caller-supplied row limit.
    pub max_row_limit: u64,
    pub capacity_unit: CapacityUnit,
}

/// Whether a query matched anything. Zero rows is a valid answer, not a
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Empty,
    Rows,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleModelRequest {
    pub filter: ModelFilter,
    pub window: DateWindow,
    /// Rows returned for inspection (newest first); `None` uses the
    /// configured default.
    pub limit: Option<u64>,
    pub afr_mode: AfrMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SingleModelReport {
    pub outcome: QueryOutcome,
    pub report: ReliabilityReport,
    pub rows: MaterializedTable,
    pub capacity_unit: CapacityUnit,
    /// Mean capacity of the returned rows in `capacity_unit`.
    pub average_capacity: Option<f64>,
    /// Over the failure rows present in `rows`.
    pub sample_age_at_failure: Option<AgeAtFailureStats>,
}

/// The three report modes the presentation layer can ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportRequest {
    SingleModel(SingleModelRequest),
    Comparison {
        filters: Vec<ModelFilter>,
        window: DateWindow,
    },
    TopByVolume {
        n: u64,
        window: DateWindow,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", content = "result", rename_all = "snake_case")]
pub enum ReportResponse {
    SingleModel(SingleModelReport),
    Comparison(Vec<ReliabilityReport>),
    TopByVolume(Vec<ReliabilityReport>),
}

/// Runs reliability queries against the drive-stats table, one at a time per
/// session, on the blocking pool.
#[derive(Clone)]
pub struct ReliabilityQueryService {
    connections: Arc<ConnectionManager>,
    resolver: Arc<TableResolver>,
    options: ReliabilityServiceOptions,
    semaphore: Arc<Semaphore>,
}

impl ReliabilityQueryService {
    pub fn new(
        connections: Arc<ConnectionManager>,
        resolver: Arc<TableResolver>,
        options: ReliabilityServiceOptions,
    ) -> Self {
        Self {
            connections,
            resolver,
            options,
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn options(&self) -> &ReliabilityServiceOptions {
        &self.options
    }

    /// Establishes the session and resolves the table without querying it, so
    /// setup failures surface before any report is requested.
    pub async fn warm_up(&self) -> DriveStatsResult<Arc<ScannableTable>> {
        self.run_blocking("warm_up", |_, table| Ok(Arc::new(table.clone())))
            .await
    }

    pub async fn run(&self, request: ReportRequest) -> DriveStatsResult<ReportResponse> {
        match request {
            ReportRequest::SingleModel(request) => self
                .single_model_report(request)
                .await
                .map(ReportResponse::SingleModel),
            ReportRequest::Comparison { filters, window } => self
                .fleet_comparison(filters, window)
                .await
                .map(ReportResponse::Comparison),
            ReportRequest::TopByVolume { n, window } => self
                .top_n_by_volume(n, window)
                .await
                .map(ReportResponse::TopByVolume),
        }
    }

    pub async fn single_model_report(
        &self,
        request: SingleModelRequest,
    ) -> DriveStatsResult<SingleModelReport> {
        let limit = self.clamp_limit(request.limit.unwrap_or(self.options.default_row_limit));
        if limit == 0 && request.afr_mode == AfrMode::SampledSubset {
            return Err(DriveStatsError::query(
                "sampled AFR needs a row limit of at least 1",
            ));
        }
        let unit = self.options.capacity_unit;

        self.run_blocking("single_model", move |handle, table| {
            let builder = QueryBuilder::new(table);
            let rows_query = builder.rows(&RowSelection {
                filter: Some(request.filter.clone()),
                failures_only: false,
                window: request.window,
                limit: Some(limit),
            })?;
            let aggregate_query = match request.afr_mode {
                AfrMode::FullAggregate => Some(builder.aggregate(&AggregateQuery {
                    filter: Some(request.filter.clone()),
                    window: request.window,
                    grouping: AggregateGrouping::Total,
                })?),
                AfrMode::SampledSubset => None,
            };

            let attempts = handle.settings().engine_attempts();
            let label = Some(request.filter.pattern().to_string());
            let conn = handle.lock()?;
            let rows = fetch_records(&conn, &rows_query, attempts)?;
            let aggregate = match aggregate_query {
                Some(query) => query_all(&conn, &query, attempts, |row| {
                    AggregateRow::from_row(row, 0, label.clone())
                })?
                .into_iter()
                .next()
                .unwrap_or_else(|| AggregateRow {
                    model: label.clone(),
                    ..AggregateRow::default()
                }),
                None => AggregateRow::from_sample(&rows, label.clone()),
            };
            drop(conn);

            let report = compute_report(&aggregate, request.afr_mode);
            let outcome = if report.is_empty() {
                tracing::info!(filter = ?request.filter, "no drive-days matched filter");
                QueryOutcome::Empty
            } else {
                QueryOutcome::Rows
            };
            tracing::info!(
                filter = ?request.filter,
                afr_mode = ?request.afr_mode,
                drive_days = report.total_drive_days,
                failures = report.total_failures,
                rows = rows.len(),
                truncated = rows.truncated,
                "single model report computed"
            );

            Ok(SingleModelReport {
                outcome,
                average_capacity: rows.average_capacity(unit),
                sample_age_at_failure: age_at_failure_stats(rows.failure_rows()),
                report,
                rows,
                capacity_unit: unit,
            })
        })
        .await
    }

    /// Full-aggregate report per filter, ranked by AFR ascending.
    pub async fn fleet_comparison(
        &self,
        filters: Vec<ModelFilter>,
        window: DateWindow,
    ) -> DriveStatsResult<Vec<ReliabilityReport>> {
        if filters.is_empty() {
            return Err(DriveStatsError::query(
                "fleet comparison needs at least one model filter",
            ));
        }

        self.run_blocking("fleet_comparison", move |handle, table| {
            let builder = QueryBuilder::new(table);
            let queries = filters
                .iter()
                .map(|filter| {
                    builder.aggregate(&AggregateQuery {
                        filter: Some(filter.clone()),
                        window,
                        grouping: AggregateGrouping::Total,
                    })
                })
                .collect::<DriveStatsResult<Vec<_>>>()?;

            let attempts = handle.settings().engine_attempts();
            let conn = handle.lock()?;
            let mut reports = Vec::with_capacity(filters.len());
            for (filter, query) in filters.iter().zip(&queries) {
                let label = Some(filter.pattern().to_string());
                let aggregate = query_all(&conn, query, attempts, |row| {
                    AggregateRow::from_row(row, 0, label.clone())
                })?
                .into_iter()
                .next()
                .unwrap_or_else(|| AggregateRow {
                    model: label.clone(),
                    ..AggregateRow::default()
                });
                reports.push(compute_report(&aggregate, AfrMode::FullAggregate));
            }
            drop(conn);

            tracing::info!(models = reports.len(), "fleet comparison computed");
            Ok(rank_by_afr(reports))
        })
        .await
    }

    /// The `n` models with the most drive-days, largest first.
    pub async fn top_n_by_volume(
        &self,
        n: u64,
        window: DateWindow,
    ) -> DriveStatsResult<Vec<ReliabilityReport>> {
        let n = self.clamp_limit(n);
        self.run_blocking("top_n_by_volume", move |handle, table| {
            let query = QueryBuilder::new(table).aggregate(&AggregateQuery {
                filter: None,
                window,
                grouping: AggregateGrouping::ByModel { top_n: n },
            })?;
            let attempts = handle.settings().engine_attempts();
            let conn = handle.lock()?;
            let rows = query_all(&conn, &query, attempts, |row| {
                let model: Option<String> = row.get(0)?;
                AggregateRow::from_row(row, 1, model)
            })?;
            Ok(rows
                .iter()
                .map(|row| compute_report(row, AfrMode::FullAggregate))
                .collect())
        })
        .await
    }

    /// Failure rows, newest first. `limit` is optional because the predicate
    /// is failure-restricted.
    pub async fn failure_rows(
        &self,
        filter: Option<ModelFilter>,
        window: DateWindow,
        limit: Option<u64>,
    ) -> DriveStatsResult<MaterializedTable> {
        let limit = limit.map(|limit| self.clamp_limit(limit));
        self.run_blocking("failure_rows", move |handle, table| {
            let query = QueryBuilder::new(table).rows(&RowSelection {
                filter,
                failures_only: true,
                window,
                limit,
            })?;
            let attempts = handle.settings().engine_attempts();
            let conn = handle.lock()?;
            fetch_records(&conn, &query, attempts)
        })
        .await
    }

    /// Age-at-failure statistics over every failure the filter matches.
    pub async fn failure_age_summary(
        &self,
        filter: ModelFilter,
        window: DateWindow,
    ) -> DriveStatsResult<Option<AgeAtFailureStats>> {
        let failures = self.failure_rows(Some(filter), window, None).await?;
        Ok(age_at_failure_stats(failures.failure_rows()))
    }

    pub async fn failure_timeline(
        &self,
        filter: ModelFilter,
        window: DateWindow,
    ) -> DriveStatsResult<Vec<MonthlyFailurePoint>> {
        self.run_blocking("failure_timeline", move |handle, table| {
            let query = QueryBuilder::new(table).timeline(&TimelineQuery { filter, window })?;
            let attempts = handle.settings().engine_attempts();
            let conn = handle.lock()?;
            query_all(&conn, &query, attempts, MonthlyFailurePoint::from_row)
        })
        .await
    }

    pub async fn failure_age_histogram(
        &self,
        filter: ModelFilter,
        window: DateWindow,
        bucket_hours: u64,
    ) -> DriveStatsResult<Vec<AgeHistogramBucket>> {
        self.run_blocking("failure_age_histogram", move |handle, table| {
            let query = QueryBuilder::new(table).age_histogram(&AgeHistogramQuery {
                filter,
                window,
                bucket_hours,
            })?;
            let attempts = handle.settings().engine_attempts();
            let conn = handle.lock()?;
            query_all(&conn, &query, attempts, |row| {
                AgeHistogramBucket::from_row(row, bucket_hours)
            })
        })
        .await
    }

    fn clamp_limit(&self, requested: u64) -> u64 {
        let max = self.options.max_row_limit;
        if requested > max {
            tracing::warn!(requested, max, "row limit clamped to configured maximum");
            max
        } else {
            requested
        }
    }

    async fn run_blocking<T, F>(&self, label: &'static str, work: F) -> DriveStatsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ConnectionHandle, &ScannableTable) -> DriveStatsResult<T> + Send + 'static,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DriveStatsError::Task("query gate closed".to_string()))?;

        let connections = self.connections.clone();
        let resolver = self.resolver.clone();
        let dataset_uri = self.options.dataset_uri.clone();
        tokio::task::spawn_blocking(move || -> DriveStatsResult<T> {
            let started = Instant::now();
            let handle = connections.acquire()?;
            let table = resolver.resolve(&handle, &dataset_uri)?;
            let result = work(&handle, &table);
            tracing::debug!(
                query = label,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "reliability query finished"
            );
            result
        })
        .await?
    }
}

fn query_all<T, F>(
    conn: &Connection,
    query: &BuiltQuery,
    attempts: u64,
    map: F,
) -> DriveStatsResult<Vec<T>>
where
    F: FnMut(&Row<'_>) -> duckdb::Result<T>,
{
    let mut stmt = conn
        .prepare(&query.sql)
        .map_err(|err| DriveStatsError::from_engine(err, attempts))?;
    let rows = stmt
        .query_map(params_from_iter(query.params.iter()), map)
        .map_err(|err| DriveStatsError::from_engine(err, attempts))?;
    rows.collect::<duckdb::Result<Vec<_>>>()
        .map_err(|err| DriveStatsError::from_engine(err, attempts))
}
