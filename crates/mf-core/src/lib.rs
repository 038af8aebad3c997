//! Core domain model for the Magic Formula screener: periods, fundamentals
//! records, retry bookkeeping and period completion state.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mf-core";

pub const DEFAULT_MIN_MARKET_CAP: f64 = 1_000_000_000.0;
pub const DEFAULT_EXCLUDED_SECTORS: [&str; 3] = ["Financial Services", "Financial", "Utilities"];

/// Reporting window. `month == None` means annual data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: Option<u32>,
}

impl Period {
    pub fn annual(year: i32) -> Self {
        Self { year, month: None }
    }

    pub fn monthly(year: i32, month: u32) -> Self {
        Self {
            year,
            month: Some(month),
        }
    }

    pub fn is_annual(&self) -> bool {
        self.month.is_none()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(month) => write!(f, "{}-{:02}", self.year, month),
            None => write!(f, "{}", self.year),
        }
    }
}

/// Selects stored rows by period. `Year` matches every row of the year
/// regardless of month; `Exact` matches the identity's month (or annual rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodFilter {
    Year(i32),
    Exact(Period),
}

impl PeriodFilter {
    pub fn for_request(year: i32, month: Option<u32>) -> Self {
        match month {
            Some(month) => Self::Exact(Period::monthly(year, month)),
            None => Self::Year(year),
        }
    }

    pub fn matches(&self, period: &Period) -> bool {
        match self {
            Self::Year(year) => period.year == *year,
            Self::Exact(p) => p == period,
        }
    }
}

/// Identity shared by fundamentals records and failed attempts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub symbol: String,
    pub period: Period,
}

impl RecordKey {
    pub fn new(symbol: impl Into<String>, period: Period) -> Self {
        Self {
            symbol: symbol.into(),
            period,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.period)
    }
}

/// Normalized provider output before validation. Every provider converges on
/// this shape; the chain turns it into a [`FundamentalsRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub symbol: String,
    pub year: i32,
    pub company_name: String,
    pub sector: Option<String>,
    pub ebit: f64,
    pub enterprise_value: f64,
    pub tangible_capital: f64,
    pub market_cap: f64,
    pub current_price: Option<f64>,
}

/// Screening thresholds shared by the source chain and the ranking engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningCriteria {
    pub min_market_cap: f64,
    pub excluded_sectors: Vec<String>,
}

impl Default for ScreeningCriteria {
    fn default() -> Self {
        Self {
            min_market_cap: DEFAULT_MIN_MARKET_CAP,
            excluded_sectors: DEFAULT_EXCLUDED_SECTORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ScreeningCriteria {
    /// Exact or substring match, so "Financial Services" also catches
    /// "Financial Services - Banks" style provider labels.
    pub fn is_sector_excluded(&self, sector: Option<&str>) -> bool {
        let Some(sector) = sector.map(str::trim).filter(|s| !s.is_empty()) else {
            return false;
        };
        self.excluded_sectors
            .iter()
            .any(|excluded| sector == excluded || sector.contains(excluded.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("ebit {0} is not positive")]
    NonPositiveEbit(f64),
    #[error("market cap {market_cap} below minimum {minimum}")]
    MarketCapTooSmall { market_cap: f64, minimum: f64 },
    #[error("enterprise value {0} is not positive")]
    NonPositiveEnterpriseValue(f64),
    #[error("tangible capital {0} is not positive")]
    NonPositiveTangibleCapital(f64),
    #[error("sector {0:?} is excluded")]
    ExcludedSector(String),
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

pub fn earnings_yield(ebit: f64, enterprise_value: f64) -> f64 {
    ebit / enterprise_value * 100.0
}

pub fn return_on_capital(ebit: f64, tangible_capital: f64) -> f64 {
    ebit / tangible_capital * 100.0
}

/// Stored fundamentals for one (symbol, year, month) identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsRecord {
    pub symbol: String,
    pub period: Period,
    pub company_name: String,
    pub sector: Option<String>,
    pub ebit: f64,
    pub enterprise_value: f64,
    pub tangible_capital: f64,
    pub earnings_yield: f64,
    pub return_on_capital: f64,
    pub market_cap: f64,
    pub current_price: Option<f64>,
    pub data_source: String,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FundamentalsRecord {
    /// Validate a provider report and build the record. Earnings yield and
    /// return on capital are always derived here, never taken from upstream.
    pub fn from_report(
        report: ProviderReport,
        period: Period,
        data_source: impl Into<String>,
        criteria: &ScreeningCriteria,
        now: DateTime<Utc>,
    ) -> Result<Self, Rejection> {
        validate_report(&report, criteria)?;
        Ok(Self {
            earnings_yield: earnings_yield(report.ebit, report.enterprise_value),
            return_on_capital: return_on_capital(report.ebit, report.tangible_capital),
            symbol: report.symbol,
            period,
            company_name: report.company_name,
            sector: report.sector,
            ebit: report.ebit,
            enterprise_value: report.enterprise_value,
            tangible_capital: report.tangible_capital,
            market_cap: report.market_cap,
            current_price: report.current_price,
            data_source: data_source.into(),
            fetched_at: now,
            updated_at: now,
        })
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.symbol.clone(), self.period)
    }

    /// Re-derive the ratio fields from the stored inputs.
    pub fn recompute_ratios(&mut self) {
        self.earnings_yield = earnings_yield(self.ebit, self.enterprise_value);
        self.return_on_capital = return_on_capital(self.ebit, self.tangible_capital);
    }
}

pub fn validate_report(report: &ProviderReport, criteria: &ScreeningCriteria) -> Result<(), Rejection> {
    for (name, value) in [
        ("ebit", report.ebit),
        ("enterprise_value", report.enterprise_value),
        ("tangible_capital", report.tangible_capital),
        ("market_cap", report.market_cap),
    ] {
        if !value.is_finite() {
            return Err(Rejection::NonFinite(name));
        }
    }
    if report.ebit <= 0.0 {
        return Err(Rejection::NonPositiveEbit(report.ebit));
    }
    if report.market_cap < criteria.min_market_cap {
        return Err(Rejection::MarketCapTooSmall {
            market_cap: report.market_cap,
            minimum: criteria.min_market_cap,
        });
    }
    if report.enterprise_value <= 0.0 {
        return Err(Rejection::NonPositiveEnterpriseValue(report.enterprise_value));
    }
    if report.tangible_capital <= 0.0 {
        return Err(Rejection::NonPositiveTangibleCapital(report.tangible_capital));
    }
    if criteria.is_sector_excluded(report.sector.as_deref()) {
        return Err(Rejection::ExcludedSector(report.sector.clone().unwrap_or_default()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Retrying,
    Failed,
    Completed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "retrying" => Some(Self::Retrying),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn next_retry_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let backoff = chrono::Duration::from_std(self.backoff).unwrap_or(chrono::Duration::zero());
        now + backoff
    }
}

/// Failure bookkeeping for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub key: RecordKey,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: AttemptStatus,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub next_retry: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FailedAttempt {
    pub fn first_failure(
        key: RecordKey,
        error_message: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let mut attempt = Self {
            key,
            error_message: error_message.into(),
            retry_count: 1,
            max_retries: policy.max_retries,
            status: AttemptStatus::Pending,
            first_attempt: now,
            last_attempt: now,
            next_retry: Some(policy.next_retry_after(now)),
            completed_at: None,
        };
        attempt.exhaust_if_capped();
        attempt
    }

    /// Count another failed attempt. Terminal entries are left alone.
    pub fn register_failure(
        &mut self,
        error_message: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) {
        if self.status.is_terminal() {
            return;
        }
        self.retry_count = self.retry_count.saturating_add(1).min(self.max_retries);
        self.error_message = error_message.into();
        self.last_attempt = now;
        self.status = AttemptStatus::Pending;
        self.next_retry = Some(policy.next_retry_after(now));
        self.exhaust_if_capped();
    }

    fn exhaust_if_capped(&mut self) {
        if self.retry_count >= self.max_retries {
            self.retry_count = self.max_retries;
            self.status = AttemptStatus::Failed;
            self.next_retry = None;
        }
    }

    /// Returns `false` when the entry was already completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == AttemptStatus::Completed {
            return false;
        }
        self.status = AttemptStatus::Completed;
        self.next_retry = None;
        self.completed_at = Some(now);
        true
    }

    pub fn mark_retrying(&mut self, now: DateTime<Utc>) {
        if self.status == AttemptStatus::Pending {
            self.status = AttemptStatus::Retrying;
            self.last_attempt = now;
        }
    }

    /// Bring an entry interrupted mid-retry back into the sweep.
    pub fn reconcile_interrupted(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != AttemptStatus::Retrying {
            return false;
        }
        self.status = AttemptStatus::Pending;
        self.next_retry = Some(now);
        true
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == AttemptStatus::Pending && self.next_retry.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    InProgress,
    Completed,
    CompletedWithFailures,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed_with_failures",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "completed_with_failures" => Some(Self::CompletedWithFailures),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionCounts {
    pub successful: u64,
    pub pending: u64,
    pub permanently_failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodCompletion {
    pub period: Period,
    pub total_symbols: u64,
    pub successful_fetches: u64,
    pub pending_retries: u64,
    pub permanently_failed: u64,
    pub completion_percentage: f64,
    pub status: CompletionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PeriodCompletion {
    pub fn begin(period: Period, total_symbols: u64, now: DateTime<Utc>) -> Self {
        Self {
            period,
            total_symbols,
            successful_fetches: 0,
            pending_retries: 0,
            permanently_failed: 0,
            completion_percentage: 0.0,
            status: CompletionStatus::InProgress,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Explicitly re-target a period for a new pass.
    pub fn retarget(&mut self, total_symbols: u64, now: DateTime<Utc>) {
        self.total_symbols = total_symbols;
        self.status = CompletionStatus::InProgress;
        self.completed_at = None;
        self.started_at = now;
        self.updated_at = now;
    }

    pub fn apply_counts(&mut self, counts: CompletionCounts, now: DateTime<Utc>) {
        self.successful_fetches = counts.successful;
        self.pending_retries = counts.pending;
        self.permanently_failed = counts.permanently_failed;
        let accounted = counts.successful + counts.pending + counts.permanently_failed;
        self.total_symbols = self.total_symbols.max(accounted);
        self.completion_percentage = completion_percentage(self.successful_fetches, self.total_symbols);

        let settled = if self.permanently_failed > 0 {
            CompletionStatus::CompletedWithFailures
        } else {
            CompletionStatus::Completed
        };
        if self.status.is_terminal() {
            // Only `retarget` reopens a finished period.
            if self.pending_retries == 0 {
                self.status = settled;
            }
        } else if self.pending_retries == 0 {
            self.status = settled;
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }
}

pub fn completion_percentage(successful: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64 * 100.0
    }
}

/// One row of a ranking result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedStock {
    pub rank: u32,
    pub ey_rank: u32,
    pub roc_rank: u32,
    pub magic_formula_score: u32,
    #[serde(flatten)]
    pub record: FundamentalsRecord,
}

/// Stored data available for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub period: Period,
    pub stock_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, secs).single().unwrap()
    }

    fn report(ebit: f64, market_cap: f64, ev: f64, tangible: f64, sector: &str) -> ProviderReport {
        ProviderReport {
            symbol: "ACME".into(),
            year: 2023,
            company_name: "Acme Corp".into(),
            sector: Some(sector.to_string()),
            ebit,
            enterprise_value: ev,
            tangible_capital: tangible,
            market_cap,
            current_price: Some(10.0),
        }
    }

    #[test]
    fn period_display_pads_month() {
        assert_eq!(Period::annual(2023).to_string(), "2023");
        assert_eq!(Period::monthly(2023, 6).to_string(), "2023-06");
    }

    #[test]
    fn year_filter_matches_every_month() {
        let filter = PeriodFilter::for_request(2023, None);
        assert!(filter.matches(&Period::annual(2023)));
        assert!(filter.matches(&Period::monthly(2023, 12)));
        assert!(!filter.matches(&Period::annual(2022)));

        let exact = PeriodFilter::for_request(2023, Some(6));
        assert!(exact.matches(&Period::monthly(2023, 6)));
        assert!(!exact.matches(&Period::annual(2023)));
    }

    #[test]
    fn ratios_are_derived_from_inputs() {
        let criteria = ScreeningCriteria::default();
        let record = FundamentalsRecord::from_report(
            report(200.0, 2e9, 2_000.0, 1_000.0, "Technology"),
            Period::annual(2023),
            "polygon",
            &criteria,
            ts(0),
        )
        .unwrap();
        assert_eq!(record.earnings_yield, 10.0);
        assert_eq!(record.return_on_capital, 20.0);
        assert_eq!(record.data_source, "polygon");
    }

    #[test]
    fn validation_rejects_each_failed_check() {
        let criteria = ScreeningCriteria::default();
        let cases = [
            report(0.0, 2e9, 1.0, 1.0, "Technology"),
            report(1.0, 5e8, 1.0, 1.0, "Technology"),
            report(1.0, 2e9, 0.0, 1.0, "Technology"),
            report(1.0, 2e9, 1.0, -3.0, "Technology"),
            report(1.0, 2e9, 1.0, 1.0, "Utilities"),
            report(1.0, 2e9, 1.0, 1.0, "Financial Services - Banks"),
            report(f64::NAN, 2e9, 1.0, 1.0, "Technology"),
        ];
        for case in cases {
            assert!(validate_report(&case, &criteria).is_err(), "{case:?}");
        }
        assert!(validate_report(&report(1.0, 2e9, 1.0, 1.0, "Technology"), &criteria).is_ok());
    }

    #[test]
    fn failed_attempt_caps_retries_and_clears_next_retry() {
        let policy = RetryPolicy::default();
        let mut attempt = FailedAttempt::first_failure(
            RecordKey::new("ACME", Period::annual(2023)),
            "all sources failed",
            &policy,
            ts(0),
        );
        assert_eq!(attempt.retry_count, 1);
        assert_eq!(attempt.status, AttemptStatus::Pending);
        assert_eq!(attempt.next_retry, Some(ts(3)));

        for i in 1..10 {
            attempt.register_failure("still failing", &policy, ts(i));
            assert!(attempt.retry_count <= attempt.max_retries);
        }
        assert_eq!(attempt.retry_count, 5);
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.next_retry, None);
        assert!(!attempt.is_due(ts(59)));
    }

    #[test]
    fn completion_is_irreversible_and_idempotent() {
        let policy = RetryPolicy::default();
        let mut attempt =
            FailedAttempt::first_failure(RecordKey::new("ACME", Period::annual(2023)), "x", &policy, ts(0));
        assert!(attempt.mark_completed(ts(5)));
        assert!(!attempt.mark_completed(ts(9)));
        assert_eq!(attempt.completed_at, Some(ts(5)));

        attempt.register_failure("late failure", &policy, ts(10));
        assert_eq!(attempt.status, AttemptStatus::Completed);
        assert_eq!(attempt.retry_count, 1);
    }

    #[test]
    fn interrupted_retry_is_reconciled_to_pending() {
        let policy = RetryPolicy::default();
        let mut attempt =
            FailedAttempt::first_failure(RecordKey::new("ACME", Period::annual(2023)), "x", &policy, ts(0));
        attempt.mark_retrying(ts(4));
        assert_eq!(attempt.status, AttemptStatus::Retrying);
        assert!(attempt.reconcile_interrupted(ts(30)));
        assert_eq!(attempt.status, AttemptStatus::Pending);
        assert!(attempt.is_due(ts(30)));
    }

    #[test]
    fn completion_arithmetic_and_terminal_rule() {
        let mut completion = PeriodCompletion::begin(Period::annual(2023), 10, ts(0));
        completion.apply_counts(
            CompletionCounts {
                successful: 4,
                pending: 3,
                permanently_failed: 1,
            },
            ts(1),
        );
        assert_eq!(completion.completion_percentage, 40.0);
        assert_eq!(completion.status, CompletionStatus::InProgress);

        completion.apply_counts(
            CompletionCounts {
                successful: 7,
                pending: 0,
                permanently_failed: 3,
            },
            ts(2),
        );
        assert_eq!(completion.status, CompletionStatus::CompletedWithFailures);
        assert_eq!(completion.completed_at, Some(ts(2)));

        completion.apply_counts(
            CompletionCounts {
                successful: 7,
                pending: 0,
                permanently_failed: 3,
            },
            ts(3),
        );
        assert_eq!(completion.completed_at, Some(ts(2)));
    }

    #[test]
    fn total_never_drops_below_accounted_symbols() {
        let mut completion = PeriodCompletion::begin(Period::annual(2023), 2, ts(0));
        completion.apply_counts(
            CompletionCounts {
                successful: 3,
                pending: 1,
                permanently_failed: 0,
            },
            ts(1),
        );
        assert_eq!(completion.total_symbols, 4);
        let accounted = completion.successful_fetches + completion.pending_retries + completion.permanently_failed;
        assert!(accounted <= completion.total_symbols);
        assert_eq!(completion_percentage(0, 0), 0.0);
    }

    #[test]
    fn finished_period_stays_finished_until_retargeted() {
        let mut completion = PeriodCompletion::begin(Period::annual(2024), 2, ts(0));
        completion.apply_counts(
            CompletionCounts {
                successful: 2,
                pending: 0,
                permanently_failed: 0,
            },
            ts(1),
        );
        assert_eq!(completion.status, CompletionStatus::Completed);

        completion.apply_counts(
            CompletionCounts {
                successful: 3,
                pending: 1,
                permanently_failed: 0,
            },
            ts(2),
        );
        assert!(completion.status.is_terminal());
        assert_eq!(completion.completed_at, Some(ts(1)));
        assert_eq!(completion.pending_retries, 1);
        assert_eq!(completion.total_symbols, 4);
        assert_eq!(completion.completion_percentage, 75.0);

        completion.apply_counts(
            CompletionCounts {
                successful: 3,
                pending: 0,
                permanently_failed: 1,
            },
            ts(3),
        );
        assert_eq!(completion.status, CompletionStatus::CompletedWithFailures);
        assert_eq!(completion.completed_at, Some(ts(1)));

        completion.retarget(5, ts(4));
        assert_eq!(completion.status, CompletionStatus::InProgress);
        assert_eq!(completion.completed_at, None);
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            AttemptStatus::Pending,
            AttemptStatus::Retrying,
            AttemptStatus::Failed,
            AttemptStatus::Completed,
        ] {
            assert_eq!(AttemptStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            CompletionStatus::parse("completed_with_failures"),
            Some(CompletionStatus::CompletedWithFailures)
        );
        assert_eq!(serde_json::to_string(&CompletionStatus::InProgress).unwrap(), "\"in_progress\"");
    }
}
