use std::sync::Arc;

use chrono::{DateTime, Utc};
use mf_core::{CompletionCounts, Period, PeriodCompletion, PeriodFilter};
use mf_storage::{RecordStore, StoreResult};
use tracing::info;

use crate::RetryLedger;

#[derive(Clone)]
pub struct PeriodCompletionTracker {
    store: Arc<dyn RecordStore>,
    ledger: RetryLedger,
}

impl PeriodCompletionTracker {
    pub fn new(store: Arc<dyn RecordStore>, ledger: RetryLedger) -> Self {
        Self { store, ledger }
    }

    /// Creates the period row, or re-targets an existing one for a new pass.
    pub async fn begin(&self, period: Period, total_symbols: u64, now: DateTime<Utc>) -> StoreResult<PeriodCompletion> {
        let completion = match self.store.get_period_completion(period).await? {
            Some(mut existing) => {
                existing.retarget(total_symbols, now);
                existing
            }
            None => PeriodCompletion::begin(period, total_symbols, now),
        };
        self.store.put_period_completion(&completion).await?;
        Ok(completion)
    }

    pub async fn recompute(&self, period: Period, now: DateTime<Utc>) -> StoreResult<PeriodCompletion> {
        self.recompute_with_deferred(period, 0, now).await
    }

    /// Like [`recompute`](Self::recompute), counting `deferred` identities
    /// whose outcome is still waiting to be persisted as pending.
    pub async fn recompute_with_deferred(
        &self,
        period: Period,
        deferred: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<PeriodCompletion> {
        let successful = self.store.count_records(PeriodFilter::Exact(period)).await?;
        let (pending, permanently_failed) = self.ledger.open_counts(period).await?;
        let pending = pending + deferred;

        let mut completion = match self.store.get_period_completion(period).await? {
            Some(existing) => existing,
            None => PeriodCompletion::begin(period, 0, now),
        };
        let was_complete = completion.is_complete();
        completion.apply_counts(
            CompletionCounts {
                successful,
                pending,
                permanently_failed,
            },
            now,
        );
        self.store.put_period_completion(&completion).await?;

        if completion.is_complete() && !was_complete {
            info!(
                %period,
                status = completion.status.as_str(),
                successful,
                permanently_failed,
                total = completion.total_symbols,
                "period complete"
            );
        }
        Ok(completion)
    }
}
