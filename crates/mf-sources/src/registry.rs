//! `sources.yaml`: which providers run, in which order, and how fast.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use mf_storage::ProviderPacing;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    AlphaVantageProvider, FundamentalsProvider, PolygonProvider, ProviderHttp,
    Sp500PlaceholderProvider, YahooFinanceProvider, ALPHA_VANTAGE_SOURCE_ID,
    PLACEHOLDER_SOURCE_ID, POLYGON_SOURCE_ID, YAHOO_SOURCE_ID,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Top-level keys of a 200 JSON body that mean "slow down".
    #[serde(default)]
    pub throttle_markers: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub calls: u32,
    pub per_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub polygon: Option<String>,
    pub alpha_vantage: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// The file when present, otherwise the built-in priority order.
    pub fn load_or_builtin(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        info!(path = %path.display(), "no source registry file, using built-in provider order");
        Ok(Self::builtin())
    }

    pub fn builtin() -> Self {
        let entry = |id: &str, display_name: &str, rate_limit: Option<RateLimitConfig>| ProviderConfig {
            id: id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            base_url: None,
            rate_limit,
            throttle_markers: Vec::new(),
            notes: None,
        };
        Self {
            providers: vec![
                entry(
                    POLYGON_SOURCE_ID,
                    "Polygon.io",
                    Some(RateLimitConfig { calls: 5, per_secs: 60 }),
                ),
                ProviderConfig {
                    throttle_markers: vec!["Note".to_string(), "Information".to_string()],
                    ..entry(
                        ALPHA_VANTAGE_SOURCE_ID,
                        "Alpha Vantage",
                        Some(RateLimitConfig { calls: 5, per_secs: 60 }),
                    )
                },
                entry(YAHOO_SOURCE_ID, "Yahoo Finance", None),
                entry(PLACEHOLDER_SOURCE_ID, "S&P 500 placeholder", None),
            ],
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Pacing keyed by provider id, for the HTTP fetcher.
    pub fn pacing(&self) -> HashMap<String, ProviderPacing> {
        self.enabled()
            .filter_map(|p| {
                p.rate_limit.map(|r| {
                    (
                        p.id.clone(),
                        ProviderPacing::per_window(r.calls, Duration::from_secs(r.per_secs.max(1))),
                    )
                })
            })
            .collect()
    }

    pub fn throttle_markers(&self) -> HashMap<String, Vec<String>> {
        self.enabled()
            .filter(|p| !p.throttle_markers.is_empty())
            .map(|p| (p.id.clone(), p.throttle_markers.clone()))
            .collect()
    }

    /// Enabled providers in file order. Unknown ids are skipped.
    pub fn build_providers(&self, http: &ProviderHttp, keys: &ProviderKeys) -> Vec<Box<dyn FundamentalsProvider>> {
        let mut out: Vec<Box<dyn FundamentalsProvider>> = Vec::new();
        for config in self.enabled() {
            let base_url = config.base_url.clone();
            let provider: Box<dyn FundamentalsProvider> = match config.id.as_str() {
                POLYGON_SOURCE_ID => {
                    let p = PolygonProvider::new(http.clone(), keys.polygon.clone());
                    Box::new(match base_url {
                        Some(url) => p.with_base_url(url),
                        None => p,
                    })
                }
                ALPHA_VANTAGE_SOURCE_ID => {
                    let p = AlphaVantageProvider::new(http.clone(), keys.alpha_vantage.clone());
                    Box::new(match base_url {
                        Some(url) => p.with_base_url(url),
                        None => p,
                    })
                }
                YAHOO_SOURCE_ID => {
                    let p = YahooFinanceProvider::new(http.clone());
                    Box::new(match base_url {
                        Some(url) => p.with_base_url(url),
                        None => p,
                    })
                }
                PLACEHOLDER_SOURCE_ID => {
                    let p = Sp500PlaceholderProvider::new(http.clone());
                    Box::new(match base_url {
                        Some(url) => p.with_url(url),
                        None => p,
                    })
                }
                other => {
                    warn!(source_id = other, "unknown provider in registry, skipping");
                    continue;
                }
            };
            out.push(provider);
        }
        out
    }
}
