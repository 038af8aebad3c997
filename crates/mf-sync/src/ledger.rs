use std::sync::Arc;

use chrono::{DateTime, Utc};
use mf_core::{AttemptStatus, FailedAttempt, Period, RecordKey, RetryPolicy};
use mf_storage::{RecordStore, StoreResult};
use tracing::{debug, info};

/// Failure bookkeeping per (symbol, period), persisted through the record
/// store.
#[derive(Clone)]
pub struct RetryLedger {
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
}

impl RetryLedger {
    pub fn new(store: Arc<dyn RecordStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn record_failure(
        &self,
        symbol: &str,
        period: Period,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<FailedAttempt> {
        let key = RecordKey::new(symbol, period);
        let attempt = match self.store.get_failed_attempt(&key).await? {
            Some(mut existing) => {
                if existing.status.is_terminal() {
                    return Ok(existing);
                }
                existing.register_failure(error, &self.policy, now);
                existing
            }
            None => FailedAttempt::first_failure(key, error, &self.policy, now),
        };
        self.store.put_failed_attempt(&attempt).await?;
        if attempt.status == AttemptStatus::Failed {
            info!(key = %attempt.key, retries = attempt.retry_count, "retries exhausted");
        } else {
            debug!(key = %attempt.key, retries = attempt.retry_count, "failure recorded");
        }
        Ok(attempt)
    }

    /// Returns `true` when an open entry was closed.
    pub async fn record_success(&self, symbol: &str, period: Period, now: DateTime<Utc>) -> StoreResult<bool> {
        let key = RecordKey::new(symbol, period);
        let Some(mut attempt) = self.store.get_failed_attempt(&key).await? else {
            return Ok(false);
        };
        if !attempt.mark_completed(now) {
            return Ok(false);
        }
        self.store.put_failed_attempt(&attempt).await?;
        Ok(true)
    }

    pub async fn due_for_retry(&self, now: DateTime<Utc>) -> StoreResult<Vec<FailedAttempt>> {
        self.store.due_failed_attempts(now).await
    }

    pub async fn mark_retrying(&self, attempt: &mut FailedAttempt, now: DateTime<Utc>) -> StoreResult<()> {
        attempt.mark_retrying(now);
        self.store.put_failed_attempt(attempt).await
    }

    /// Puts a retrying entry back in the queue when its attempt could not be
    /// finished.
    pub async fn release(&self, attempt: &mut FailedAttempt, now: DateTime<Utc>) -> StoreResult<()> {
        if attempt.reconcile_interrupted(now) {
            self.store.put_failed_attempt(attempt).await?;
        }
        Ok(())
    }

    /// Entries left `retrying` by an interrupted process become due again.
    pub async fn reconcile_interrupted(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut reconciled = 0;
        for mut attempt in self.store.failed_attempts_with_status(AttemptStatus::Retrying).await? {
            if attempt.reconcile_interrupted(now) {
                self.store.put_failed_attempt(&attempt).await?;
                reconciled += 1;
            }
        }
        if reconciled > 0 {
            info!(reconciled, "interrupted retries returned to pending");
        }
        Ok(reconciled)
    }

    /// `(pending + retrying, failed)` for one period.
    pub async fn open_counts(&self, period: Period) -> StoreResult<(u64, u64)> {
        let pending = self
            .store
            .count_failed_attempts(period, &[AttemptStatus::Pending, AttemptStatus::Retrying])
            .await?;
        let failed = self.store.count_failed_attempts(period, &[AttemptStatus::Failed]).await?;
        Ok((pending, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use mf_storage::MemoryRecordStore;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).single().unwrap() + ChronoDuration::seconds(secs)
    }

    fn ledger() -> (RetryLedger, Arc<MemoryRecordStore>) {
        let store = Arc::new(MemoryRecordStore::new());
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_secs(3),
        };
        (RetryLedger::new(store.clone(), policy), store)
    }

    #[tokio::test]
    async fn failures_count_up_to_the_cap_and_then_stop() {
        let (ledger, _) = ledger();
        let period = Period::annual(2023);

        let first = ledger.record_failure("ACME", period, "timeout", ts(0)).await.unwrap();
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.status, AttemptStatus::Pending);
        assert_eq!(first.next_retry, Some(ts(3)));

        ledger.record_failure("ACME", period, "timeout", ts(5)).await.unwrap();
        let third = ledger.record_failure("ACME", period, "still down", ts(10)).await.unwrap();
        assert_eq!(third.retry_count, 3);
        assert_eq!(third.status, AttemptStatus::Failed);
        assert_eq!(third.next_retry, None);

        let after = ledger.record_failure("ACME", period, "again", ts(20)).await.unwrap();
        assert_eq!(after.retry_count, 3);
        assert_eq!(after.error_message, "still down");
        assert_eq!(ledger.open_counts(period).await.unwrap(), (0, 1));
    }

    #[tokio::test]
    async fn success_closes_entry_once() {
        let (ledger, store) = ledger();
        let period = Period::annual(2023);
        assert!(!ledger.record_success("ACME", period, ts(0)).await.unwrap());

        ledger.record_failure("ACME", period, "timeout", ts(0)).await.unwrap();
        assert!(ledger.record_success("ACME", period, ts(4)).await.unwrap());
        assert!(!ledger.record_success("ACME", period, ts(8)).await.unwrap());

        let stored = store
            .get_failed_attempt(&RecordKey::new("ACME", period))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, AttemptStatus::Completed);
        assert_eq!(stored.completed_at, Some(ts(4)));
        assert_eq!(ledger.open_counts(period).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn interrupted_retries_are_reconciled_to_due() {
        let (ledger, _) = ledger();
        let period = Period::annual(2022);
        ledger.record_failure("ACME", period, "timeout", ts(0)).await.unwrap();

        let mut due = ledger.due_for_retry(ts(3)).await.unwrap();
        assert_eq!(due.len(), 1);
        ledger.mark_retrying(&mut due[0], ts(3)).await.unwrap();
        assert!(ledger.due_for_retry(ts(100)).await.unwrap().is_empty());
        assert_eq!(ledger.open_counts(period).await.unwrap(), (1, 0));

        assert_eq!(ledger.reconcile_interrupted(ts(200)).await.unwrap(), 1);
        let due = ledger.due_for_retry(ts(200)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, AttemptStatus::Pending);
    }
}
