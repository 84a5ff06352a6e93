use anyhow::{Context, Result};
use clap::Parser;
use drivestats_core::cli::{self, Command};
use drivestats_core::config::DriveStatsConfig;
use drivestats_core::error::DriveStatsError;
use drivestats_core::services::reliability::{
    export, metrics, security, ConnectionManager, QueryOutcome, ReliabilityQueryService,
    SingleModelRequest, TableResolver,
};
use serde::Serialize;
use std::sync::Arc;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Keeps the three failure kinds distinguishable for whoever reads the log.
fn explain(err: DriveStatsError) -> anyhow::Error {
    let summary = match &err {
        DriveStatsError::Setup { stage, .. } => {
            format!("engine setup failed at {stage}; no queries were run")
        }
        DriveStatsError::TransientNetwork { attempts, .. } => {
            format!("remote table unreachable after {attempts} attempts")
        }
        DriveStatsError::Query(_) => "request rejected".to_string(),
        DriveStatsError::Execution(_) => "query failed in the engine".to_string(),
        DriveStatsError::Export(_) => "export failed".to_string(),
        DriveStatsError::Task(_) => "query task failed".to_string(),
    };
    tracing::error!(error = %err, "{summary}");
    anyhow::Error::new(err).context(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    security::apply_umask();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = DriveStatsConfig::from_env()?;
    if let Some(uri) = args.dataset_uri.as_deref() {
        config.dataset_uri = uri.trim().to_string();
    }
    match &args.command {
        Command::Report(report) => {
            if let Some(unit) = report.capacity_unit {
                config.capacity_unit = unit.into();
            }
        }
        Command::Failures(failures) => {
            if let Some(unit) = failures.capacity_unit {
                config.capacity_unit = unit.into();
            }
        }
        _ => {}
    }
    config.validate().context("invalid drive stats configuration")?;

    let service = ReliabilityQueryService::new(
        Arc::new(ConnectionManager::new(config.connection_settings())),
        Arc::new(TableResolver::new(config.resolver_options())),
        config.service_options(),
    );
    let unit = config.capacity_unit;

    match args.command {
        Command::Check => {
            let table = service.warm_up().await.map_err(explain)?;
            print_json(&serde_json::json!({
                "dataset_uri": table.uri(),
                "format": table.format(),
                "power_on_hours_column": table.power_on_hours_column(),
                "columns": table.columns(),
            }))?;
        }
        Command::Report(report) => {
            let request = SingleModelRequest {
                filter: report.model.filter(),
                window: report.model.window.window(),
                limit: report.limit,
                afr_mode: report.afr_mode.map(Into::into).unwrap_or(config.afr_mode),
            };
            let result = service
                .single_model_report(request)
                .await
                .map_err(explain)?;
            if result.outcome == QueryOutcome::Empty {
                tracing::warn!(
                    model = %report.model.model,
                    fuzzy = report.model.fuzzy,
                    "no drive-days matched this model; check the name or use --fuzzy"
                );
            }
            if let Some(path) = report.export.as_deref() {
                export::export_rows_csv(path, &result.rows.rows, unit).map_err(explain)?;
            }
            print_json(&result)?;
        }
        Command::Compare(compare) => {
            let reports = service
                .fleet_comparison(compare.filters(), compare.window.window())
                .await
                .map_err(explain)?;
            print_json(&reports)?;
        }
        Command::Top(top) => {
            let reports = service
                .top_n_by_volume(top.n, top.window.window())
                .await
                .map_err(explain)?;
            print_json(&reports)?;
        }
        Command::Failures(failures) => {
            let rows = service
                .failure_rows(failures.filter(), failures.window.window(), failures.limit)
                .await
                .map_err(explain)?;
            if rows.is_empty() {
                tracing::warn!("no failure rows matched");
            }
            if let Some(path) = failures.export.as_deref() {
                export::export_rows_csv(path, &rows.rows, unit).map_err(explain)?;
            }
            let age_stats = failures
                .age_stats
                .then(|| metrics::age_at_failure_stats(rows.failure_rows()))
                .flatten();
            print_json(&serde_json::json!({
                "rows": rows,
                "capacity_unit": unit,
                "age_at_failure": age_stats,
            }))?;
        }
        Command::Timeline(model) => {
            let points = service
                .failure_timeline(model.filter(), model.window.window())
                .await
                .map_err(explain)?;
            print_json(&points)?;
        }
        Command::Histogram(histogram) => {
            let buckets = service
                .failure_age_histogram(
                    histogram.model.filter(),
                    histogram.model.window.window(),
                    histogram.bucket_hours,
                )
                .await
                .map_err(explain)?;
            print_json(&buckets)?;
        }
    }

    Ok(())
}
