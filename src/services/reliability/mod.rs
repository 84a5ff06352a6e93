pub mod connection;
pub mod duckdb_service;
pub mod export;
pub mod materialize;
pub mod metrics;
pub mod query;
pub mod security;
pub mod table;

pub use connection::{ConnectionManager, ConnectionSettings, RemoteAccess, UrlStyle};
pub use duckdb_service::{
    QueryOutcome, ReliabilityQueryService, ReliabilityServiceOptions, ReportRequest,
    ReportResponse, SingleModelReport, SingleModelRequest,
};
pub use materialize::{CapacityUnit, DriveDayRecord, MaterializedTable};
pub use metrics::{AfrMode, ReliabilityReport};
pub use query::{DateWindow, ModelFilter};
pub use table::{ScannableTable, TableFormat, TableResolver, TableResolverOptions};
