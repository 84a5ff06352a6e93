use chrono::NaiveDate;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::services::reliability::materialize::CapacityUnit;
use crate::services::reliability::metrics::AfrMode;
use crate::services::reliability::query::{DateWindow, ModelFilter};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "drivestats",
    version,
    about = "Drive reliability reports over the Drive Stats table"
)]
pub struct Args {
    /// Overrides DRIVESTATS_DATASET_URI.
    #[arg(long, global = true)]
    pub dataset_uri: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Reliability report and newest drive-day rows for one model.
    Report(ReportArgs),
    /// Side-by-side reports for several models, lowest AFR first.
    Compare(CompareArgs),
    /// Models with the most drive-days.
    Top(TopArgs),
    /// Failure rows, optionally exported as CSV.
    Failures(FailuresArgs),
    /// Monthly drive-days and failures for one model.
    Timeline(ModelArgs),
    /// Failure counts bucketed by power-on hours.
    Histogram(HistogramArgs),
    /// Resolve the table and exit.
    Check,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct WindowArgs {
    /// First day included (YYYY-MM-DD).
    #[arg(long)]
    pub start: Option<NaiveDate>,
    /// Last day included (YYYY-MM-DD).
    #[arg(long)]
    pub end: Option<NaiveDate>,
}

impl WindowArgs {
    pub fn window(&self) -> DateWindow {
        DateWindow {
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ModelArgs {
    #[arg(long)]
    pub model: String,
    /// Case-insensitive substring match instead of exact match.
    #[arg(long, default_value_t = false)]
    pub fuzzy: bool,
    #[command(flatten)]
    pub window: WindowArgs,
}

impl ModelArgs {
    pub fn filter(&self) -> ModelFilter {
        model_filter(&self.model, self.fuzzy)
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ReportArgs {
    #[command(flatten)]
    pub model: ModelArgs,
    /// Rows returned; defaults to DRIVESTATS_DEFAULT_ROW_LIMIT.
    #[arg(long)]
    pub limit: Option<u64>,
    #[arg(long, value_enum)]
    pub afr_mode: Option<AfrModeArg>,
    #[arg(long, value_enum)]
    pub capacity_unit: Option<CapacityUnitArg>,
    /// Writes the returned rows to this CSV file.
    #[arg(long)]
    pub export: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CompareArgs {
    /// Repeat for each model to compare.
    #[arg(long = "model", required = true)]
    pub models: Vec<String>,
    #[arg(long, default_value_t = false)]
    pub fuzzy: bool,
    #[command(flatten)]
    pub window: WindowArgs,
}

impl CompareArgs {
    pub fn filters(&self) -> Vec<ModelFilter> {
        self.models
            .iter()
            .map(|model| model_filter(model, self.fuzzy))
            .collect()
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TopArgs {
    #[arg(long, default_value_t = 10)]
    pub n: u64,
    #[command(flatten)]
    pub window: WindowArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct FailuresArgs {
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long, default_value_t = false)]
    pub fuzzy: bool,
    #[command(flatten)]
    pub window: WindowArgs,
    #[arg(long)]
    pub limit: Option<u64>,
    #[arg(long, value_enum)]
    pub capacity_unit: Option<CapacityUnitArg>,
    #[arg(long)]
    pub export: Option<PathBuf>,
    /// Also report age-at-failure statistics over the returned rows.
    #[arg(long, default_value_t = false)]
    pub age_stats: bool,
}

impl FailuresArgs {
    pub fn filter(&self) -> Option<ModelFilter> {
        self.model
            .as_deref()
            .map(|model| model_filter(model, self.fuzzy))
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct HistogramArgs {
    #[command(flatten)]
    pub model: ModelArgs,
    /// Bucket width in power-on hours.
    #[arg(long, default_value_t = 8_760)]
    pub bucket_hours: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfrModeArg {
    Full,
    Sampled,
}

impl From<AfrModeArg> for AfrMode {
    fn from(value: AfrModeArg) -> Self {
        match value {
            AfrModeArg::Full => AfrMode::FullAggregate,
            AfrModeArg::Sampled => AfrMode::SampledSubset,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityUnitArg {
    Decimal,
    Binary,
}

impl From<CapacityUnitArg> for CapacityUnit {
    fn from(value: CapacityUnitArg) -> Self {
        match value {
            CapacityUnitArg::Decimal => CapacityUnit::DecimalTerabytes,
            CapacityUnitArg::Binary => CapacityUnit::BinaryTebibytes,
        }
    }
}

fn model_filter(model: &str, fuzzy: bool) -> ModelFilter {
    if fuzzy {
        ModelFilter::fuzzy(model.trim())
    } else {
        ModelFilter::exact(model.trim())
    }
}
