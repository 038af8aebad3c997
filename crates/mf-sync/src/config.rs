use std::path::PathBuf;
use std::time::Duration;

use mf_core::{RetryPolicy, ScreeningCriteria, DEFAULT_EXCLUDED_SECTORS, DEFAULT_MIN_MARKET_CAP};
use mf_sources::{ProviderKeys, SourceRegistry};
use mf_storage::HttpClientConfig;

pub const MAX_FETCH_CONCURRENCY: usize = 5;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub polygon_api_key: Option<String>,
    pub alpha_vantage_api_key: Option<String>,
    pub min_market_cap: f64,
    pub excluded_sectors: Vec<String>,
    pub start_year: i32,
    pub end_year: i32,
    pub batch_window_start: u32,
    pub batch_window_end: u32,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub fetch_concurrency: usize,
    pub batch_size: usize,
    pub batch_cooldown_secs: u64,
    /// Overrides the scraped index universe when set.
    pub symbols: Option<Vec<String>>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub archive_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| text(key).and_then(|v| v.parse::<f64>().ok());
        let int = |key: &str| text(key).and_then(|v| v.parse::<i64>().ok());

        let excluded_sectors = text("MF_EXCLUDED_SECTORS")
            .map(|v| split_csv(&v))
            .unwrap_or_else(|| DEFAULT_EXCLUDED_SECTORS.iter().map(ToString::to_string).collect());

        Self {
            database_url: text("DATABASE_URL")
                .unwrap_or_else(|| "postgres://mf:mf@localhost:5432/magic_formula".to_string()),
            redis_url: text("REDIS_URL"),
            polygon_api_key: text("POLYGON_API_KEY"),
            alpha_vantage_api_key: text("ALPHA_VANTAGE_API_KEY"),
            min_market_cap: parsed("MF_MIN_MARKET_CAP").unwrap_or(DEFAULT_MIN_MARKET_CAP),
            excluded_sectors,
            start_year: int("MF_START_YEAR").map(|v| v as i32).unwrap_or(2024),
            end_year: int("MF_END_YEAR").map(|v| v as i32).unwrap_or(2017),
            batch_window_start: int("MF_BATCH_WINDOW_START").map(|v| v.clamp(0, 23) as u32).unwrap_or(3),
            batch_window_end: int("MF_BATCH_WINDOW_END").map(|v| v.clamp(0, 24) as u32).unwrap_or(10),
            max_retries: int("MF_MAX_RETRIES").map(|v| v.max(1) as u32).unwrap_or(5),
            retry_backoff_secs: int("MF_RETRY_BACKOFF_SECS").map(|v| v.max(0) as u64).unwrap_or(3),
            fetch_concurrency: int("MF_FETCH_CONCURRENCY")
                .map(|v| v.clamp(1, MAX_FETCH_CONCURRENCY as i64) as usize)
                .unwrap_or(1),
            batch_size: int("MF_BATCH_SIZE").map(|v| v.max(1) as usize).unwrap_or(100),
            batch_cooldown_secs: int("MF_BATCH_COOLDOWN_SECS").map(|v| v.max(0) as u64).unwrap_or(300),
            symbols: text("MF_SYMBOLS").map(|v| split_csv(&v)).filter(|v| !v.is_empty()),
            http_timeout_secs: int("MF_HTTP_TIMEOUT_SECS").map(|v| v.max(1) as u64).unwrap_or(20),
            user_agent: text("MF_USER_AGENT").unwrap_or_else(|| "mf-screener/0.1".to_string()),
            archive_dir: text("MF_ARCHIVE_DIR").map(PathBuf::from),
            workspace_root: PathBuf::from("."),
        }
    }

    /// Target years, newest first.
    pub fn years(&self) -> Vec<i32> {
        let (low, high) = if self.start_year <= self.end_year {
            (self.start_year, self.end_year)
        } else {
            (self.end_year, self.start_year)
        };
        (low..=high).rev().collect()
    }

    pub fn screening(&self) -> ScreeningCriteria {
        ScreeningCriteria {
            min_market_cap: self.min_market_cap,
            excluded_sectors: self.excluded_sectors.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }

    pub fn provider_keys(&self) -> ProviderKeys {
        ProviderKeys {
            polygon: self.polygon_api_key.clone(),
            alpha_vantage: self.alpha_vantage_api_key.clone(),
        }
    }

    pub fn http_client_config(&self, registry: &SourceRegistry) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            per_source_concurrency: self.fetch_concurrency,
            pacing: registry.pacing(),
            throttle_markers: registry.throttle_markers(),
            ..HttpClientConfig::default()
        }
    }

    pub fn sources_file(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
