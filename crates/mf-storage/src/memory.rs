//! In-process record store for tests and database-less dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mf_core::{
    AttemptStatus, FailedAttempt, FundamentalsRecord, Period, PeriodCompletion, PeriodFilter,
    PeriodSummary, RecordKey,
};
use tokio::sync::RwLock;

use crate::store::{period_desc, RecordStore, StoreError, StoreResult, UpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<RecordKey, FundamentalsRecord>>,
    failures: RwLock<BTreeMap<RecordKey, FailedAttempt>>,
    completions: RwLock<BTreeMap<Period, PeriodCompletion>>,
    writes_unavailable: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with [`StoreError::Unavailable`], mimicking a
    /// lost database connection.
    pub fn set_writes_unavailable(&self, unavailable: bool) {
        self.writes_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.writes_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store writes disabled".into()));
        }
        Ok(())
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_record(&self, record: &FundamentalsRecord) -> StoreResult<UpsertOutcome> {
        self.check_writable()?;
        let mut records = self.records.write().await;
        let key = record.key();
        match records.get_mut(&key) {
            Some(existing) => {
                let fetched_at = existing.fetched_at;
                *existing = record.clone();
                existing.fetched_at = fetched_at;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                records.insert(key, record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get_record(&self, key: &RecordKey) -> StoreResult<Option<FundamentalsRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn has_record_for_year(&self, symbol: &str, year: i32) -> StoreResult<bool> {
        Ok(self
            .records
            .read()
            .await
            .keys()
            .any(|k| k.symbol == symbol && k.period.year == year))
    }

    async fn records_for(&self, filter: PeriodFilter) -> StoreResult<Vec<FundamentalsRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(&r.period))
            .cloned()
            .collect())
    }

    async fn count_records(&self, filter: PeriodFilter) -> StoreResult<u64> {
        Ok(self
            .records
            .read()
            .await
            .keys()
            .filter(|k| filter.matches(&k.period))
            .count() as u64)
    }

    async fn available_periods(&self) -> StoreResult<Vec<PeriodSummary>> {
        let records = self.records.read().await;
        let mut by_period: BTreeMap<Period, PeriodSummary> = BTreeMap::new();
        for record in records.values() {
            let entry = by_period.entry(record.period).or_insert(PeriodSummary {
                period: record.period,
                stock_count: 0,
                last_updated: None,
            });
            entry.stock_count += 1;
            entry.last_updated = entry.last_updated.max(Some(record.updated_at));
        }
        let mut out = by_period.into_values().collect::<Vec<_>>();
        out.sort_by(|a, b| period_desc(&a.period, &b.period));
        Ok(out)
    }

    async fn get_failed_attempt(&self, key: &RecordKey) -> StoreResult<Option<FailedAttempt>> {
        Ok(self.failures.read().await.get(key).cloned())
    }

    async fn put_failed_attempt(&self, attempt: &FailedAttempt) -> StoreResult<()> {
        self.check_writable()?;
        self.failures
            .write()
            .await
            .insert(attempt.key.clone(), attempt.clone());
        Ok(())
    }

    async fn due_failed_attempts(&self, now: DateTime<Utc>) -> StoreResult<Vec<FailedAttempt>> {
        let mut due = self
            .failures
            .read()
            .await
            .values()
            .filter(|a| a.is_due(now))
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by(|a, b| {
            a.next_retry
                .cmp(&b.next_retry)
                .then_with(|| a.key.symbol.cmp(&b.key.symbol))
                .then_with(|| a.key.period.cmp(&b.key.period))
        });
        Ok(due)
    }

    async fn failed_attempts_with_status(&self, status: AttemptStatus) -> StoreResult<Vec<FailedAttempt>> {
        Ok(self
            .failures
            .read()
            .await
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect())
    }

    async fn count_failed_attempts(&self, period: Period, statuses: &[AttemptStatus]) -> StoreResult<u64> {
        Ok(self
            .failures
            .read()
            .await
            .values()
            .filter(|a| a.key.period == period && statuses.contains(&a.status))
            .count() as u64)
    }

    async fn get_period_completion(&self, period: Period) -> StoreResult<Option<PeriodCompletion>> {
        Ok(self.completions.read().await.get(&period).cloned())
    }

    async fn put_period_completion(&self, completion: &PeriodCompletion) -> StoreResult<()> {
        self.check_writable()?;
        self.completions
            .write()
            .await
            .insert(completion.period, completion.clone());
        Ok(())
    }

    async fn period_completions(&self) -> StoreResult<Vec<PeriodCompletion>> {
        let mut out = self.completions.read().await.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| period_desc(&a.period, &b.period));
        Ok(out)
    }
}
