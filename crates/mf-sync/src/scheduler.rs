use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use mf_core::{FundamentalsRecord, Period, PeriodCompletion, RecordKey};
use mf_query::CACHE_KEY_PREFIX;
use mf_sources::{SourceChain, SourcesExhausted, SymbolUniverseProvider};
use mf_storage::{Cache, RecordStore, StoreError, UpsertOutcome};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{PeriodCompletionTracker, RetryLedger, SchedulerError, StopSignal, SyncConfig};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Newest first.
    pub years: Vec<i32>,
    pub batch_window_start: u32,
    pub batch_window_end: u32,
    pub fetch_concurrency: usize,
    pub batch_size: usize,
    pub batch_cooldown: Duration,
    pub poll_interval: Duration,
    pub retry_check_interval: Duration,
    pub retry_inter_attempt: Duration,
    pub max_drain_cycles: usize,
    pub drain_cycle_sleep: Duration,
    pub error_backoff: Duration,
    pub continuous_unit_delay: Duration,
    pub continuous_cooldown: Duration,
    pub progress_every: u64,
    pub failure_cache_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            years: (2017..=2024).rev().collect(),
            batch_window_start: 3,
            batch_window_end: 10,
            fetch_concurrency: 1,
            batch_size: 100,
            batch_cooldown: Duration::from_secs(300),
            poll_interval: Duration::from_secs(60),
            retry_check_interval: Duration::from_secs(5),
            retry_inter_attempt: Duration::from_secs(1),
            max_drain_cycles: 100,
            drain_cycle_sleep: Duration::from_secs(5),
            error_backoff: Duration::from_secs(600),
            continuous_unit_delay: Duration::from_secs(60),
            continuous_cooldown: Duration::from_secs(3600),
            progress_every: 10,
            failure_cache_capacity: 10_000,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            years: config.years(),
            batch_window_start: config.batch_window_start,
            batch_window_end: config.batch_window_end,
            fetch_concurrency: config.fetch_concurrency,
            batch_size: config.batch_size,
            batch_cooldown: Duration::from_secs(config.batch_cooldown_secs),
            ..Self::default()
        }
    }

    pub fn in_batch_window(&self, hour: u32) -> bool {
        if self.batch_window_start <= self.batch_window_end {
            hour >= self.batch_window_start && hour < self.batch_window_end
        } else {
            hour >= self.batch_window_start || hour < self.batch_window_end
        }
    }

    /// Once per calendar day, inside the window.
    pub fn batch_due(&self, now: DateTime<Local>, last_batch: Option<NaiveDate>) -> bool {
        self.in_batch_window(now.hour()) && last_batch != Some(now.date_naive())
    }
}

/// Identities that failed during this process lifetime. Bounded; the
/// oldest entry is evicted first. Not persisted.
#[derive(Debug)]
pub struct FailureCache {
    capacity: usize,
    order: VecDeque<(String, i32)>,
    members: HashSet<(String, i32)>,
}

impl FailureCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn insert(&mut self, symbol: &str, year: i32) {
        let key = (symbol.to_string(), year);
        if !self.members.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, symbol: &str, year: i32) -> bool {
        self.members.contains(&(symbol.to_string(), year))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct YearSummary {
    pub year: i32,
    pub symbols: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub write_errors: usize,
    pub drain_cycles: usize,
    pub pending_after_drain: u64,
    pub stopped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweepSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub write_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Stored,
    Failed,
    WriteFailed,
}

#[derive(Debug, Default)]
struct WriteTally {
    succeeded: usize,
    failed: usize,
    write_errors: usize,
}

/// Drives acquisition: the daily bulk pass, the retry sweep and the
/// one-unit-at-a-time continuous mode. All writes go through this task.
pub struct AcquisitionScheduler {
    chain: Arc<SourceChain>,
    store: Arc<dyn RecordStore>,
    ledger: RetryLedger,
    tracker: PeriodCompletionTracker,
    universe: Arc<dyn SymbolUniverseProvider>,
    cache: Arc<dyn Cache>,
    settings: SchedulerSettings,
    stop: StopSignal,
    /// Identities whose outcome could not be persisted. Re-fetched by the
    /// next retry sweep.
    deferred: Mutex<BTreeSet<RecordKey>>,
}

impl AcquisitionScheduler {
    pub fn new(
        chain: Arc<SourceChain>,
        store: Arc<dyn RecordStore>,
        ledger: RetryLedger,
        universe: Arc<dyn SymbolUniverseProvider>,
        cache: Arc<dyn Cache>,
        settings: SchedulerSettings,
    ) -> Self {
        let tracker = PeriodCompletionTracker::new(store.clone(), ledger.clone());
        Self {
            chain,
            store,
            ledger,
            tracker,
            universe,
            cache,
            settings,
            stop: StopSignal::never(),
            deferred: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &PeriodCompletionTracker {
        &self.tracker
    }

    pub async fn reconcile_on_startup(&self) -> Result<usize, SchedulerError> {
        Ok(self.ledger.reconcile_interrupted(Utc::now()).await?)
    }

    /// Daily bulk pass plus the periodic retry sweep, until stopped.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        self.reconcile_on_startup().await?;
        info!(
            years = ?self.settings.years,
            window_start = self.settings.batch_window_start,
            window_end = self.settings.batch_window_end,
            "acquisition scheduler started"
        );

        let mut last_batch: Option<NaiveDate> = None;
        let mut last_retry_check: Option<Instant> = None;
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let pause = match self.tick(&mut last_batch, &mut last_retry_check).await {
                Ok(()) => self.settings.poll_interval,
                Err(err) => {
                    error!(
                        error = %err,
                        backoff_secs = self.settings.error_backoff.as_secs(),
                        "scheduler iteration failed"
                    );
                    self.settings.error_backoff
                }
            };
            if self.stop.sleep_or_stop(pause).await {
                break;
            }
        }
        info!("acquisition scheduler stopped");
        Ok(())
    }

    async fn tick(
        &self,
        last_batch: &mut Option<NaiveDate>,
        last_retry_check: &mut Option<Instant>,
    ) -> Result<(), SchedulerError> {
        let now = Local::now();
        if self.settings.batch_due(now, *last_batch) {
            info!(date = %now.date_naive(), "daily batch window open");
            self.run_bulk_pass().await?;
            if !self.stop.is_stopped() {
                *last_batch = Some(now.date_naive());
            }
        }

        let sweep_due = last_retry_check.map_or(true, |at| at.elapsed() >= self.settings.retry_check_interval);
        if sweep_due && !self.stop.is_stopped() {
            self.retry_sweep().await?;
            *last_retry_check = Some(Instant::now());
        }
        Ok(())
    }

    /// Every configured year, newest first.
    pub async fn run_bulk_pass(&self) -> Result<Vec<YearSummary>, SchedulerError> {
        let mut summaries = Vec::with_capacity(self.settings.years.len());
        for &year in &self.settings.years {
            if self.stop.is_stopped() {
                break;
            }
            let summary = self
                .process_year(year)
                .instrument(info_span!("bulk_year", year))
                .await?;
            let stopped = summary.stopped;
            summaries.push(summary);
            if stopped {
                break;
            }
        }
        Ok(summaries)
    }

    /// Fetch the whole universe for `year`, then drain its retries.
    pub async fn process_year(&self, year: i32) -> Result<YearSummary, SchedulerError> {
        let symbols = self.universe.list().await?;
        let period = Period::annual(year);
        self.tracker.begin(period, symbols.len() as u64, Utc::now()).await?;
        info!(year, symbols = symbols.len(), "bulk pass started");

        let mut summary = YearSummary {
            year,
            symbols: symbols.len(),
            ..YearSummary::default()
        };
        let chunk_size = self.settings.batch_size.max(1);
        for (idx, chunk) in symbols.chunks(chunk_size).enumerate() {
            if idx > 0 {
                info!(year, cooldown_secs = self.settings.batch_cooldown.as_secs(), "chunk cooldown");
                if self.stop.sleep_or_stop(self.settings.batch_cooldown).await {
                    summary.stopped = true;
                    break;
                }
            }
            if self.stop.is_stopped() {
                summary.stopped = true;
                break;
            }

            let results = self.fetch_chunk(chunk, year).await;
            let tally = self.apply_results(period, results).await;
            summary.succeeded += tally.succeeded;
            summary.failed += tally.failed;
            summary.write_errors += tally.write_errors;
            info!(
                year,
                chunk = idx + 1,
                succeeded = tally.succeeded,
                failed = tally.failed,
                "chunk processed"
            );
        }

        self.refresh_completion(period).await?;
        self.invalidate_cache().await;

        if !summary.stopped {
            let (cycles, pending) = self.drain_year(period).await?;
            summary.drain_cycles = cycles;
            summary.pending_after_drain = pending;
            summary.stopped = self.stop.is_stopped();
        }
        info!(
            year,
            succeeded = summary.succeeded,
            failed = summary.failed,
            pending = summary.pending_after_drain,
            "bulk pass finished"
        );
        Ok(summary)
    }

    async fn fetch_chunk(
        &self,
        chunk: &[String],
        year: i32,
    ) -> Vec<(String, Result<FundamentalsRecord, SourcesExhausted>)> {
        let semaphore = Arc::new(Semaphore::new(self.settings.fetch_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for symbol in chunk {
            let chain = self.chain.clone();
            let semaphore = semaphore.clone();
            let symbol = symbol.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = chain.fetch_detailed(&symbol, year).await;
                (symbol, outcome)
            });
        }

        let mut results = Vec::with_capacity(chunk.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(error = %err, year, "fetch task aborted"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    async fn apply_results(
        &self,
        period: Period,
        results: Vec<(String, Result<FundamentalsRecord, SourcesExhausted>)>,
    ) -> WriteTally {
        let mut tally = WriteTally::default();
        for (symbol, outcome) in results {
            match self.apply_outcome(&symbol, period, outcome).await {
                UnitOutcome::Stored => tally.succeeded += 1,
                UnitOutcome::Failed => tally.failed += 1,
                UnitOutcome::WriteFailed => {
                    tally.write_errors += 1;
                    self.defer(RecordKey::new(symbol, period)).await;
                }
            }
        }
        tally
    }

    /// Persist one fetch outcome. Any storage error, including a ledger
    /// write after a stored record, yields `WriteFailed` and the caller
    /// defers the identity.
    async fn apply_outcome(
        &self,
        symbol: &str,
        period: Period,
        outcome: Result<FundamentalsRecord, SourcesExhausted>,
    ) -> UnitOutcome {
        let now = Utc::now();
        match outcome {
            Ok(mut record) => {
                record.period = period;
                match self.store.upsert_record(&record).await {
                    Ok(written) => {
                        if written == UpsertOutcome::Updated {
                            info!(symbol, %period, "record refreshed");
                        }
                        match self.ledger.record_success(symbol, period, now).await {
                            Ok(_) => UnitOutcome::Stored,
                            Err(err) => {
                                warn!(symbol, %period, error = %err, "ledger success write failed");
                                UnitOutcome::WriteFailed
                            }
                        }
                    }
                    Err(err) => {
                        warn!(symbol, %period, error = %err, "record write failed");
                        UnitOutcome::WriteFailed
                    }
                }
            }
            Err(exhausted) => match self
                .ledger
                .record_failure(symbol, period, &exhausted.to_string(), now)
                .await
            {
                Ok(_) => UnitOutcome::Failed,
                Err(err) => {
                    warn!(symbol, %period, error = %err, "ledger failure write failed");
                    UnitOutcome::WriteFailed
                }
            },
        }
    }

    /// Retry cycles until the period has nothing pending. Returns the
    /// cycles run and what is still pending.
    async fn drain_year(&self, period: Period) -> Result<(usize, u64), SchedulerError> {
        let mut cycles = 0;
        let mut pending = self.refresh_completion(period).await?.pending_retries;
        while pending > 0 && cycles < self.settings.max_drain_cycles {
            if self.stop.is_stopped() {
                break;
            }
            cycles += 1;
            let sweep = self.retry_sweep().await?;
            pending = self.refresh_completion(period).await?.pending_retries;
            info!(%period, cycle = cycles, retried = sweep.attempted, pending, "drain cycle");
            if pending == 0 {
                break;
            }
            if self.stop.sleep_or_stop(self.settings.drain_cycle_sleep).await {
                break;
            }
        }
        if pending > 0 {
            warn!(%period, pending, cycles, "pending retries remain after drain");
        }
        Ok((cycles, pending))
    }

    async fn refresh_completion(&self, period: Period) -> Result<PeriodCompletion, StoreError> {
        let deferred = self.deferred.lock().await.iter().filter(|key| key.period == period).count();
        self.tracker.recompute_with_deferred(period, deferred as u64, Utc::now()).await
    }

    async fn defer(&self, key: RecordKey) {
        self.deferred.lock().await.insert(key);
    }

    pub async fn deferred_count(&self) -> usize {
        self.deferred.lock().await.len()
    }

    /// Retry every deferred identity and every due ledger entry once.
    pub async fn retry_sweep(&self) -> Result<RetrySweepSummary, SchedulerError> {
        let mut summary = RetrySweepSummary::default();
        let mut touched = BTreeSet::new();
        self.retry_deferred(&mut summary, &mut touched).await;

        let due = if self.stop.is_stopped() {
            Vec::new()
        } else {
            self.ledger.due_for_retry(Utc::now()).await?
        };
        if due.is_empty() && summary.attempted == 0 {
            return Ok(summary);
        }
        info!(due = due.len(), deferred = summary.attempted, "retry sweep started");

        for (idx, mut attempt) in due.into_iter().enumerate() {
            if idx > 0 && self.stop.sleep_or_stop(self.settings.retry_inter_attempt).await {
                break;
            }
            if self.stop.is_stopped() {
                break;
            }
            if let Err(err) = self.ledger.mark_retrying(&mut attempt, Utc::now()).await {
                warn!(key = %attempt.key, error = %err, "could not mark retry");
                summary.write_errors += 1;
                continue;
            }

            let symbol = attempt.key.symbol.clone();
            let period = attempt.key.period;
            summary.attempted += 1;
            touched.insert(period);

            let outcome = self.chain.fetch_detailed(&symbol, period.year).await;
            match self.apply_outcome(&symbol, period, outcome).await {
                UnitOutcome::Stored => summary.succeeded += 1,
                UnitOutcome::Failed => summary.failed += 1,
                UnitOutcome::WriteFailed => {
                    summary.write_errors += 1;
                    if let Err(err) = self.ledger.release(&mut attempt, Utc::now()).await {
                        warn!(key = %attempt.key, error = %err, "retry not released, deferring");
                        self.defer(attempt.key.clone()).await;
                    }
                }
            }
        }

        for period in touched {
            self.refresh_completion(period).await?;
        }
        if summary.succeeded > 0 {
            self.invalidate_cache().await;
        }
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "retry sweep finished"
        );
        Ok(summary)
    }

    async fn retry_deferred(&self, summary: &mut RetrySweepSummary, touched: &mut BTreeSet<Period>) {
        let pending = std::mem::take(&mut *self.deferred.lock().await);
        let mut remaining = pending.into_iter();
        while let Some(key) = remaining.next() {
            if self.stop.is_stopped() {
                let mut deferred = self.deferred.lock().await;
                deferred.insert(key);
                deferred.extend(remaining);
                return;
            }
            summary.attempted += 1;
            touched.insert(key.period);
            let outcome = self.chain.fetch_detailed(&key.symbol, key.period.year).await;
            match self.apply_outcome(&key.symbol, key.period, outcome).await {
                UnitOutcome::Stored => summary.succeeded += 1,
                UnitOutcome::Failed => summary.failed += 1,
                UnitOutcome::WriteFailed => {
                    summary.write_errors += 1;
                    self.defer(key).await;
                }
            }
        }
    }

    async fn invalidate_cache(&self) {
        self.cache.delete_prefix(CACHE_KEY_PREFIX).await;
    }

    /// Walks symbol x year one unit at a time, skipping what is stored and
    /// what already failed in this process, until stopped.
    pub async fn run_continuous(&self) -> Result<(), SchedulerError> {
        self.reconcile_on_startup().await?;
        let mut failures = FailureCache::new(self.settings.failure_cache_capacity);
        let mut processed = 0u64;
        let mut stored = 0u64;
        info!(years = ?self.settings.years, "continuous acquisition started");

        'scan: loop {
            if self.stop.is_stopped() {
                break;
            }
            let symbols = match self.universe.list().await {
                Ok(symbols) => symbols,
                Err(err) => {
                    error!(error = %err, "symbol universe unavailable");
                    if self.stop.sleep_or_stop(self.settings.error_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                if self.stop.is_stopped() {
                    break 'scan;
                }
                let next = match self.next_unit(&symbols, &failures).await {
                    Ok(next) => next,
                    Err(err) => {
                        error!(error = %err, "continuous iteration failed");
                        if self.stop.sleep_or_stop(self.settings.error_backoff).await {
                            break 'scan;
                        }
                        continue;
                    }
                };
                let Some((symbol, year)) = next else {
                    info!(
                        processed,
                        stored,
                        cooldown_secs = self.settings.continuous_cooldown.as_secs(),
                        "every unit visited, cooling down"
                    );
                    if self.stop.sleep_or_stop(self.settings.continuous_cooldown).await {
                        break 'scan;
                    }
                    continue 'scan;
                };

                match self.fetch_unit(&symbol, year, &mut failures).await {
                    UnitOutcome::Stored => stored += 1,
                    UnitOutcome::Failed | UnitOutcome::WriteFailed => {}
                }
                processed += 1;
                if processed % self.settings.progress_every.max(1) == 0 {
                    let stats = self.chain.stats();
                    info!(
                        processed,
                        stored,
                        session_failures = failures.len(),
                        success_rate = stats.success_rate,
                        "continuous progress"
                    );
                }
                if self.stop.sleep_or_stop(self.settings.continuous_unit_delay).await {
                    break 'scan;
                }
            }
        }
        info!(processed, stored, "continuous acquisition stopped");
        Ok(())
    }

    /// First (symbol, year) with no stored record of any month that has not
    /// failed in this process.
    pub async fn next_unit(
        &self,
        symbols: &[String],
        failures: &FailureCache,
    ) -> Result<Option<(String, i32)>, SchedulerError> {
        for symbol in symbols {
            for &year in &self.settings.years {
                if failures.contains(symbol, year) {
                    continue;
                }
                if self.store.has_record_for_year(symbol, year).await? {
                    continue;
                }
                return Ok(Some((symbol.clone(), year)));
            }
        }
        Ok(None)
    }

    pub async fn fetch_unit(&self, symbol: &str, year: i32, failures: &mut FailureCache) -> UnitOutcome {
        let period = Period::annual(year);
        let outcome = self
            .chain
            .fetch_detailed(symbol, year)
            .instrument(info_span!("continuous_unit", symbol, year))
            .await;
        let result = self.apply_outcome(symbol, period, outcome).await;
        match result {
            UnitOutcome::Stored => {
                if let Err(err) = self.refresh_completion(period).await {
                    warn!(%period, error = %err, "completion not refreshed");
                }
                self.invalidate_cache().await;
            }
            UnitOutcome::Failed => failures.insert(symbol, year),
            UnitOutcome::WriteFailed => self.defer(RecordKey::new(symbol, period)).await,
        }
        result
    }
}
