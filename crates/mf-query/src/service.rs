use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mf_core::{FundamentalsRecord, PeriodCompletion, PeriodFilter, PeriodSummary, RankedStock};
use mf_storage::{Cache, CacheStats, RecordStore, StoreResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{rank_all, RankCriteria};

/// Every key the query service writes starts with this.
pub const CACHE_KEY_PREFIX: &str = "stocks:";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(86_400);
/// Pending retries at or above this mark the dataset as needing attention.
pub const HEALTHY_PENDING_LIMIT: u64 = 100;

pub fn cache_key(filter: &PeriodFilter) -> String {
    match filter {
        PeriodFilter::Year(year) => format!("{CACHE_KEY_PREFIX}year:{year}:all"),
        PeriodFilter::Exact(period) => match period.month {
            Some(month) => format!("{CACHE_KEY_PREFIX}monthly:{}:{month}:all", period.year),
            None => format!("{CACHE_KEY_PREFIX}annual:{}:all", period.year),
        },
    }
}

/// Prefixes covering every record set of `year`: the whole year, its
/// annual rows and each of its months.
pub fn year_cache_prefixes(year: i32) -> [String; 3] {
    [
        format!("{CACHE_KEY_PREFIX}year:{year}:"),
        format!("{CACHE_KEY_PREFIX}annual:{year}:"),
        format!("{CACHE_KEY_PREFIX}monthly:{year}:"),
    ]
}

#[derive(Debug, Clone)]
pub struct TopStocksQuery {
    pub year: i32,
    pub month: Option<u32>,
    /// Rank the whole year when the requested month has no rows.
    pub fallback_to_yearly: bool,
    pub criteria: RankCriteria,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingResult {
    pub year: i32,
    /// Month actually ranked; `None` when the year was used.
    pub month: Option<u32>,
    pub requested_month: Option<u32>,
    pub fallback_to_yearly: bool,
    pub total_in_database: u64,
    pub total_after_filter: usize,
    pub stocks: Vec<RankedStock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RankingOutcome {
    NoDataForPeriod,
    NoMatches { total_in_database: u64 },
    Ranked(RankingResult),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionSummary {
    pub total_periods: usize,
    pub completed_periods: usize,
    pub in_progress_periods: usize,
    pub total_pending_retries: u64,
    pub overall_health: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionReport {
    pub periods: Vec<PeriodCompletion>,
    pub summary: CompletionSummary,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmReport {
    pub year: i32,
    /// Non-empty record sets now cached for the year.
    pub record_sets: usize,
    pub stocks: u64,
}

pub fn summarize_completion(periods: &[PeriodCompletion]) -> CompletionSummary {
    let total_pending_retries = periods.iter().map(|p| p.pending_retries).sum::<u64>();
    CompletionSummary {
        total_periods: periods.len(),
        completed_periods: periods.iter().filter(|p| p.is_complete()).count(),
        in_progress_periods: periods.iter().filter(|p| !p.is_complete()).count(),
        total_pending_retries,
        overall_health: if total_pending_retries < HEALTHY_PENDING_LIMIT {
            "healthy"
        } else {
            "needs_attention"
        },
    }
}

/// Read side: ranking and dataset status over the record store, with an
/// optional cache in front of period record sets.
#[derive(Clone)]
pub struct StockQueryService {
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn Cache>,
    cache_ttl: Duration,
}

impl StockQueryService {
    pub fn new(store: Arc<dyn RecordStore>, cache: Arc<dyn Cache>) -> Self {
        Self {
            store,
            cache,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    async fn records(&self, filter: PeriodFilter) -> StoreResult<Vec<FundamentalsRecord>> {
        let key = cache_key(&filter);
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_str::<Vec<FundamentalsRecord>>(&cached) {
                Ok(records) => {
                    debug!(key, count = records.len(), "record set served from cache");
                    return Ok(records);
                }
                Err(err) => warn!(key, error = %err, "discarding unreadable cache entry"),
            }
        }

        let records = self.store.records_for(filter).await?;
        if !records.is_empty() {
            match serde_json::to_string(&records) {
                Ok(body) => self.cache.set(&key, &body, self.cache_ttl).await,
                Err(err) => warn!(key, error = %err, "record set not cached"),
            }
        }
        Ok(records)
    }

    pub async fn get_top_stocks(&self, query: &TopStocksQuery) -> StoreResult<RankingOutcome> {
        let mut filter = PeriodFilter::for_request(query.year, query.month);
        let mut records = self.records(filter).await?;
        let mut used_month = query.month;

        if records.is_empty() && query.month.is_some() && query.fallback_to_yearly {
            info!(year = query.year, month = query.month, "no monthly rows, falling back to yearly data");
            filter = PeriodFilter::Year(query.year);
            records = self.records(filter).await?;
            used_month = None;
        }

        if records.is_empty() {
            return Ok(RankingOutcome::NoDataForPeriod);
        }

        let total_in_database = records.len() as u64;
        let mut stocks = rank_all(&records, &query.criteria);
        if stocks.is_empty() {
            return Ok(RankingOutcome::NoMatches { total_in_database });
        }
        let total_after_filter = stocks.len();
        stocks.truncate(query.criteria.top_n);
        info!(
            year = query.year,
            month = used_month,
            total_in_database,
            total_after_filter,
            returned = stocks.len(),
            "ranking computed"
        );

        Ok(RankingOutcome::Ranked(RankingResult {
            year: query.year,
            month: used_month,
            requested_month: query.month,
            fallback_to_yearly: query.month.is_some() && used_month.is_none(),
            total_in_database,
            total_after_filter,
            stocks,
        }))
    }

    pub async fn get_stock_count(&self, year: i32, month: Option<u32>) -> StoreResult<u64> {
        self.store.count_records(PeriodFilter::for_request(year, month)).await
    }

    pub async fn get_available_periods(&self) -> StoreResult<Vec<PeriodSummary>> {
        self.store.available_periods().await
    }

    pub async fn get_completion_status(&self) -> StoreResult<CompletionReport> {
        let mut periods = self.store.period_completions().await?;
        periods.sort_by(|a, b| b.period.cmp(&a.period));
        Ok(CompletionReport {
            summary: summarize_completion(&periods),
            periods,
            generated_at: Utc::now(),
        })
    }

    /// Drops every cached record set.
    pub async fn invalidate_cache(&self) {
        self.cache.delete_prefix(CACHE_KEY_PREFIX).await;
    }

    pub async fn invalidate_year(&self, year: i32) {
        for prefix in year_cache_prefixes(year) {
            self.cache.delete_prefix(&prefix).await;
        }
    }

    /// Reloads the year's record set and every stored period of that year
    /// into the cache.
    pub async fn warm_cache(&self, year: i32) -> StoreResult<WarmReport> {
        self.invalidate_year(year).await;
        let mut filters = vec![PeriodFilter::Year(year)];
        filters.extend(
            self.store
                .available_periods()
                .await?
                .into_iter()
                .filter(|summary| summary.period.year == year)
                .map(|summary| PeriodFilter::Exact(summary.period)),
        );

        let mut report = WarmReport {
            year,
            record_sets: 0,
            stocks: 0,
        };
        for filter in filters {
            let records = self.records(filter).await?;
            if records.is_empty() {
                continue;
            }
            report.record_sets += 1;
            if filter == PeriodFilter::Year(year) {
                report.stocks = records.len() as u64;
            }
        }
        info!(year, record_sets = report.record_sets, stocks = report.stocks, "cache warmed");
        Ok(report)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}
