use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mf_core::{
    AttemptStatus, FailedAttempt, FundamentalsRecord, Period, PeriodCompletion, PeriodFilter,
    PeriodSummary, RecordKey,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Durable keyed storage for fundamentals, failure tracking and period
/// completion. Reads used by the ranking path never take write locks.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite the record for its identity. An existing row keeps
    /// its `fetched_at`; every financial field is replaced.
    async fn upsert_record(&self, record: &FundamentalsRecord) -> StoreResult<UpsertOutcome>;

    async fn get_record(&self, key: &RecordKey) -> StoreResult<Option<FundamentalsRecord>>;

    /// True when any row exists for (symbol, year), whatever its month.
    async fn has_record_for_year(&self, symbol: &str, year: i32) -> StoreResult<bool>;

    /// Rows matching the filter, ordered by symbol then month.
    async fn records_for(&self, filter: PeriodFilter) -> StoreResult<Vec<FundamentalsRecord>>;

    async fn count_records(&self, filter: PeriodFilter) -> StoreResult<u64>;

    /// Year descending, then month descending with annual rows last.
    async fn available_periods(&self) -> StoreResult<Vec<PeriodSummary>>;

    async fn get_failed_attempt(&self, key: &RecordKey) -> StoreResult<Option<FailedAttempt>>;

    async fn put_failed_attempt(&self, attempt: &FailedAttempt) -> StoreResult<()>;

    /// `pending` entries with `next_retry <= now`, oldest first, ties by symbol.
    async fn due_failed_attempts(&self, now: DateTime<Utc>) -> StoreResult<Vec<FailedAttempt>>;

    async fn failed_attempts_with_status(&self, status: AttemptStatus) -> StoreResult<Vec<FailedAttempt>>;

    async fn count_failed_attempts(&self, period: Period, statuses: &[AttemptStatus]) -> StoreResult<u64>;

    async fn get_period_completion(&self, period: Period) -> StoreResult<Option<PeriodCompletion>>;

    async fn put_period_completion(&self, completion: &PeriodCompletion) -> StoreResult<()>;

    /// Year descending, then month descending.
    async fn period_completions(&self) -> StoreResult<Vec<PeriodCompletion>>;
}

/// Ordering used by every store for `available_periods` / `period_completions`.
pub(crate) fn period_desc(a: &Period, b: &Period) -> std::cmp::Ordering {
    b.year
        .cmp(&a.year)
        .then_with(|| b.month.unwrap_or(0).cmp(&a.month.unwrap_or(0)))
}
