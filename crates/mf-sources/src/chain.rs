use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use mf_core::{FundamentalsRecord, Period, ScreeningCriteria};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{FundamentalsProvider, ProviderError};

pub const DEFAULT_INTER_PROVIDER_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source_id: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Error)]
#[error("all sources failed for {symbol} {year}: {}", describe(.failures))]
pub struct SourcesExhausted {
    pub symbol: String,
    pub year: i32,
    pub failures: Vec<SourceFailure>,
}

fn describe(failures: &[SourceFailure]) -> String {
    if failures.is_empty() {
        return "no configured providers".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.source_id, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatsSnapshot {
    pub total_attempts: u64,
    pub successes: BTreeMap<String, u64>,
    pub all_failed: u64,
    pub success_rate: f64,
}

#[derive(Debug)]
struct SourceStats {
    requests: AtomicU64,
    successes: Vec<(&'static str, AtomicU64)>,
    all_failed: AtomicU64,
}

/// Tries providers in priority order for one (symbol, year) and returns the
/// first report that passes screening as a validated record.
pub struct SourceChain {
    providers: Vec<Box<dyn FundamentalsProvider>>,
    criteria: ScreeningCriteria,
    inter_provider_delay: Duration,
    stats: SourceStats,
}

impl SourceChain {
    pub fn new(providers: Vec<Box<dyn FundamentalsProvider>>, criteria: ScreeningCriteria) -> Self {
        let successes = providers
            .iter()
            .map(|p| (p.source_id(), AtomicU64::new(0)))
            .collect();
        Self {
            providers,
            criteria,
            inter_provider_delay: DEFAULT_INTER_PROVIDER_DELAY,
            stats: SourceStats {
                requests: AtomicU64::new(0),
                successes,
                all_failed: AtomicU64::new(0),
            },
        }
    }

    pub fn with_inter_provider_delay(mut self, delay: Duration) -> Self {
        self.inter_provider_delay = delay;
        self
    }

    pub fn criteria(&self) -> &ScreeningCriteria {
        &self.criteria
    }

    pub fn provider_ids(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.source_id()).collect()
    }

    pub async fn fetch(&self, symbol: &str, year: i32) -> Option<FundamentalsRecord> {
        self.fetch_detailed(symbol, year).await.ok()
    }

    /// Like [`SourceChain::fetch`] but keeps each provider's failure reason.
    pub async fn fetch_detailed(&self, symbol: &str, year: i32) -> Result<FundamentalsRecord, SourcesExhausted> {
        let span = info_span!("source_chain", symbol, year);
        self.fetch_inner(symbol, year).instrument(span).await
    }

    async fn fetch_inner(&self, symbol: &str, year: i32) -> Result<FundamentalsRecord, SourcesExhausted> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let mut failures = Vec::new();
        let mut attempted = false;

        for (idx, provider) in self.providers.iter().enumerate() {
            let source_id = provider.source_id();
            if !provider.is_configured() {
                debug!(source_id, "provider not configured, skipping");
                continue;
            }
            if attempted && !self.inter_provider_delay.is_zero() {
                tokio::time::sleep(self.inter_provider_delay).await;
            }
            attempted = true;

            let outcome = provider.fetch(symbol, year).await.and_then(|report| {
                FundamentalsRecord::from_report(
                    report,
                    Period::annual(year),
                    source_id,
                    &self.criteria,
                    Utc::now(),
                )
                .map_err(ProviderError::from)
            });
            match outcome {
                Ok(record) => {
                    if let Some((_, counter)) = self.stats.successes.get(idx) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    info!(source_id, "fundamentals acquired");
                    return Ok(record);
                }
                Err(err) => {
                    debug!(source_id, error = %err, "provider attempt failed");
                    failures.push(SourceFailure {
                        source_id,
                        message: err.to_string(),
                    });
                }
            }
        }

        self.stats.all_failed.fetch_add(1, Ordering::Relaxed);
        let exhausted = SourcesExhausted {
            symbol: symbol.to_string(),
            year,
            failures,
        };
        warn!(error = %exhausted, "all sources failed");
        Err(exhausted)
    }

    pub fn stats(&self) -> SourceStatsSnapshot {
        let total_attempts = self.stats.requests.load(Ordering::Relaxed);
        let all_failed = self.stats.all_failed.load(Ordering::Relaxed);
        let success_rate = if total_attempts == 0 {
            0.0
        } else {
            total_attempts.saturating_sub(all_failed) as f64 / total_attempts as f64 * 100.0
        };
        SourceStatsSnapshot {
            total_attempts,
            successes: self
                .stats
                .successes
                .iter()
                .map(|(id, n)| (id.to_string(), n.load(Ordering::Relaxed)))
                .collect(),
            all_failed,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mf_core::ProviderReport;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Clone, Copy)]
    enum Script {
        Fail,
        Succeed,
        TinyMarketCap,
    }

    struct ScriptedProvider {
        id: &'static str,
        configured: bool,
        script: Script,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProvider {
        fn boxed(
            id: &'static str,
            configured: bool,
            script: Script,
        ) -> (Box<dyn FundamentalsProvider>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let provider = Self {
                id,
                configured,
                script,
                calls: calls.clone(),
            };
            (Box::new(provider), calls)
        }
    }

    #[async_trait]
    impl FundamentalsProvider for ScriptedProvider {
        fn source_id(&self) -> &'static str {
            self.id
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn fetch(&self, symbol: &str, year: i32) -> Result<ProviderReport, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let market_cap = match self.script {
                Script::Fail => return Err(ProviderError::Upstream("boom".into())),
                Script::Succeed => 5e9,
                Script::TinyMarketCap => 1e6,
            };
            Ok(ProviderReport {
                symbol: symbol.to_string(),
                year,
                company_name: format!("{symbol} Corp"),
                sector: Some("Technology".into()),
                ebit: 100.0,
                enterprise_value: 1_000.0,
                tangible_capital: 400.0,
                market_cap,
                current_price: None,
            })
        }
    }

    #[tokio::test]
    async fn first_success_short_circuits_the_chain() {
        let (a, a_calls) = ScriptedProvider::boxed("a", true, Script::Fail);
        let (b, b_calls) = ScriptedProvider::boxed("b", true, Script::Succeed);
        let (c, c_calls) = ScriptedProvider::boxed("c", true, Script::Succeed);
        let chain = SourceChain::new(vec![a, b, c], ScreeningCriteria::default())
            .with_inter_provider_delay(Duration::ZERO);

        let record = chain.fetch("ACME", 2023).await.expect("record");
        assert_eq!(record.data_source, "b");
        assert_eq!(record.period, Period::annual(2023));
        assert_eq!(record.earnings_yield, 10.0);
        assert_eq!(record.return_on_capital, 25.0);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn screening_rejection_falls_through_to_next_provider() {
        let (a, _) = ScriptedProvider::boxed("a", true, Script::TinyMarketCap);
        let (b, _) = ScriptedProvider::boxed("b", true, Script::Succeed);
        let chain = SourceChain::new(vec![a, b], ScreeningCriteria::default())
            .with_inter_provider_delay(Duration::ZERO);

        let record = chain.fetch("ACME", 2023).await.expect("record");
        assert_eq!(record.data_source, "b");
    }

    #[tokio::test]
    async fn exhaustion_reports_every_attempt_and_counts_failure() {
        let (a, _) = ScriptedProvider::boxed("a", true, Script::Fail);
        let (b, b_calls) = ScriptedProvider::boxed("b", false, Script::Succeed);
        let (c, _) = ScriptedProvider::boxed("c", true, Script::TinyMarketCap);
        let chain = SourceChain::new(vec![a, b, c], ScreeningCriteria::default())
            .with_inter_provider_delay(Duration::ZERO);

        let err = chain.fetch_detailed("ACME", 2023).await.unwrap_err();
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        let sources = err.failures.iter().map(|f| f.source_id).collect::<Vec<_>>();
        assert_eq!(sources, vec!["a", "c"]);
        assert!(err.to_string().contains("market cap"), "{err}");

        let stats = chain.stats();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.all_failed, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_only_separates_attempted_providers() {
        let (a, _) = ScriptedProvider::boxed("a", true, Script::Fail);
        let (b, _) = ScriptedProvider::boxed("b", false, Script::Succeed);
        let (c, _) = ScriptedProvider::boxed("c", true, Script::Succeed);
        let chain = SourceChain::new(vec![a, b, c], ScreeningCriteria::default());

        let started = tokio::time::Instant::now();
        chain.fetch("ACME", 2023).await.expect("record");
        assert_eq!(started.elapsed(), DEFAULT_INTER_PROVIDER_DELAY);

        let stats = chain.stats();
        assert_eq!(stats.successes.get("c"), Some(&1));
        assert_eq!(stats.success_rate, 100.0);
    }
}
