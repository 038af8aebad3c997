//! Acquisition side of the screener: configuration, the retry ledger,
//! period completion tracking, the scheduler loops and Parquet export.

use mf_sources::ProviderError;
use mf_storage::StoreError;
use thiserror::Error;

mod completion;
mod config;
mod export;
mod ledger;
mod runtime;
mod scheduler;
mod stop;

pub use completion::PeriodCompletionTracker;
pub use config::{SyncConfig, MAX_FETCH_CONCURRENCY};
pub use export::{export_period_snapshot, ExportSummary, ParquetManifest, ParquetManifestFile, SNAPSHOT_SCHEMA_VERSION};
pub use ledger::RetryLedger;
pub use runtime::{connect_cache, SyncRuntime};
pub use scheduler::{
    AcquisitionScheduler, FailureCache, RetrySweepSummary, SchedulerSettings, UnitOutcome, YearSummary,
};
pub use stop::{stop_channel, StopHandle, StopSignal};

pub const CRATE_NAME: &str = "mf-sync";

/// Errors that abort a scheduler iteration. The loops log them and back off.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("symbol universe unavailable: {0}")]
    Universe(#[from] ProviderError),
}
