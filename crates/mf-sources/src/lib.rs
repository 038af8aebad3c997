//! Fundamentals providers, the fallback chain that tries them in priority
//! order, and the symbol universe.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mf_core::{ProviderReport, Rejection};
use mf_storage::{FetchError, HttpFetcher, ResponseArchive};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

mod alpha_vantage;
mod chain;
mod placeholder;
mod polygon;
mod registry;
mod universe;
mod wiki;
mod yahoo;

pub use alpha_vantage::{alpha_vantage_report, AlphaVantageProvider, ALPHA_VANTAGE_SOURCE_ID};
pub use chain::{SourceChain, SourceFailure, SourceStatsSnapshot, SourcesExhausted};
pub use placeholder::{
    parse_sp500_constituents, ListedCompany, Sp500PlaceholderProvider, PLACEHOLDER_SOURCE_ID,
};
pub use polygon::{polygon_report, PolygonProvider, POLYGON_SOURCE_ID};
pub use registry::{ProviderConfig, ProviderKeys, RateLimitConfig, SourceRegistry};
pub use universe::{
    extract_symbol_column, merge_index_symbols, normalize_symbol, StaticUniverse,
    SymbolUniverseProvider, WikipediaIndexUniverse, FALLBACK_SYMBOLS,
};
pub use yahoo::{yahoo_report, YahooFinanceProvider, YAHOO_SOURCE_ID};

pub const CRATE_NAME: &str = "mf-sources";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider is not configured")]
    NotConfigured,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("no annual report for fiscal year {0}")]
    NoReportForYear(i32),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("{0} is not listed")]
    NotListed(String),
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),
}

/// One upstream fundamentals source. Implementations normalize their own
/// schema into a [`ProviderReport`]; validation happens in [`SourceChain`].
#[async_trait]
pub trait FundamentalsProvider: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Unconfigured providers are skipped by the chain without an attempt.
    fn is_configured(&self) -> bool {
        true
    }

    async fn fetch(&self, symbol: &str, year: i32) -> Result<ProviderReport, ProviderError>;
}

/// HTTP access shared by the providers. Every successful body is optionally
/// written to the raw response archive.
#[derive(Debug, Clone)]
pub struct ProviderHttp {
    fetcher: Arc<HttpFetcher>,
    archive: Option<ResponseArchive>,
}

impl ProviderHttp {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            fetcher,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn get_json(&self, source_id: &str, symbol: &str, url: &str) -> Result<JsonValue, ProviderError> {
        let resp = self.fetcher.fetch_bytes(source_id, url).await?;
        self.archive_body(source_id, symbol, "json", &resp.body).await;
        serde_json::from_slice(&resp.body).map_err(|err| ProviderError::Fetch(FetchError::Decode(err)))
    }

    pub async fn get_text(&self, source_id: &str, symbol: &str, url: &str) -> Result<String, ProviderError> {
        let resp = self.fetcher.fetch_bytes(source_id, url).await?;
        self.archive_body(source_id, symbol, "html", &resp.body).await;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }

    async fn archive_body(&self, source_id: &str, symbol: &str, ext: &str, body: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        if let Err(err) = archive.store(Utc::now(), source_id, symbol, ext, body).await {
            warn!(error = %err, source_id, symbol, "failed to archive raw response");
        }
    }
}

/// Numeric value from the shapes providers use: bare numbers, numeric
/// strings, `{"value": n}` and `{"raw": n}`. `"None"` and empty strings are
/// absent.
pub(crate) fn json_number(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("none") {
                None
            } else {
                s.parse().ok()
            }
        }
        JsonValue::Object(map) => json_number(map.get("value").or_else(|| map.get("raw"))),
        _ => None,
    }
}

pub(crate) fn json_text(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use serde_json::Value as JsonValue;

    pub fn fixture_path(parts: &[&str]) -> PathBuf {
        let mut path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        for part in parts {
            path = path.join(part);
        }
        path
    }

    pub fn fixture_json(parts: &[&str]) -> JsonValue {
        let path = fixture_path(parts);
        let text = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("parsing {}: {e}", path.display()))
    }

    pub fn fixture_text(parts: &[&str]) -> String {
        let path = fixture_path(parts);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_are_read_from_every_provider_shape() {
        assert_eq!(json_number(Some(&json!(12.5))), Some(12.5));
        assert_eq!(json_number(Some(&json!("1500"))), Some(1500.0));
        assert_eq!(json_number(Some(&json!({"value": 7, "unit": "USD"}))), Some(7.0));
        assert_eq!(json_number(Some(&json!({"raw": 3.0, "fmt": "3.00"}))), Some(3.0));
        assert_eq!(json_number(Some(&json!("None"))), None);
        assert_eq!(json_number(Some(&json!(null))), None);
        assert_eq!(json_number(None), None);
    }
}
