use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::wiki::parse_tables;
use crate::{ProviderError, ProviderHttp};

/// Used when the index pages yield too few symbols to be trusted.
pub const FALLBACK_SYMBOLS: [&str; 5] = ["AAPL", "MSFT", "GOOGL", "AMZN", "NVDA"];

const SP500_URL: &str = "https://en.wikipedia.org/wiki/List_of_S%26P_500_companies";
const NASDAQ100_URL: &str = "https://en.wikipedia.org/wiki/Nasdaq-100";
const DOW30_URL: &str = "https://en.wikipedia.org/wiki/Dow_Jones_Industrial_Average";
const UNIVERSE_SOURCE_ID: &str = "wikipedia";

const SYMBOL_HEADERS: &[&str] = &["symbol"];
const TICKER_HEADERS: &[&str] = &["ticker", "symbol"];

#[async_trait]
pub trait SymbolUniverseProvider: Send + Sync {
    /// Deduplicated, sorted symbols to acquire.
    async fn list(&self) -> Result<Vec<String>, ProviderError>;
}

/// `brk.b ` becomes `BRK-B`.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().replace('.', "-").to_ascii_uppercase()
}

pub fn merge_index_symbols(lists: &[Vec<String>]) -> Vec<String> {
    lists
        .iter()
        .flatten()
        .map(|s| normalize_symbol(s))
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Symbols from the first table with a column header containing one of
/// `keywords`.
pub fn extract_symbol_column(html: &str, keywords: &[&str]) -> Result<Vec<String>, ProviderError> {
    let tables = parse_tables(html)?;
    let Some((table, col)) = tables
        .iter()
        .find_map(|t| t.column(keywords).map(|col| (t, col)))
    else {
        return Ok(Vec::new());
    };
    Ok(table
        .rows
        .iter()
        .filter_map(|row| row.get(col))
        .map(|s| normalize_symbol(s))
        .filter(|s| !s.is_empty())
        .collect())
}

#[derive(Debug, Clone)]
pub struct StaticUniverse {
    symbols: Vec<String>,
}

impl StaticUniverse {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let symbols = symbols.into_iter().map(Into::into).collect::<Vec<String>>();
        Self {
            symbols: merge_index_symbols(&[symbols]),
        }
    }

    /// Comma separated list, as in `MF_SYMBOLS=AAPL,MSFT`.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }
}

#[async_trait]
impl SymbolUniverseProvider for StaticUniverse {
    async fn list(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.symbols.clone())
    }
}

/// S&P 500 + NASDAQ-100 + Dow 30 scraped from Wikipedia.
#[derive(Debug, Clone)]
pub struct WikipediaIndexUniverse {
    http: ProviderHttp,
    pages: Vec<(String, &'static [&'static str])>,
    min_expected: usize,
}

impl WikipediaIndexUniverse {
    pub fn new(http: ProviderHttp) -> Self {
        Self {
            http,
            pages: vec![
                (SP500_URL.to_string(), SYMBOL_HEADERS),
                (NASDAQ100_URL.to_string(), TICKER_HEADERS),
                (DOW30_URL.to_string(), TICKER_HEADERS),
            ],
            min_expected: 500,
        }
    }

    pub fn with_pages(mut self, pages: Vec<(String, &'static [&'static str])>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_min_expected(mut self, min_expected: usize) -> Self {
        self.min_expected = min_expected;
        self
    }
}

#[async_trait]
impl SymbolUniverseProvider for WikipediaIndexUniverse {
    async fn list(&self) -> Result<Vec<String>, ProviderError> {
        let mut lists = Vec::with_capacity(self.pages.len());
        for (url, keywords) in &self.pages {
            let html = match self.http.get_text(UNIVERSE_SOURCE_ID, "universe", url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(error = %err, url, "index page fetch failed");
                    continue;
                }
            };
            match extract_symbol_column(&html, keywords) {
                Ok(symbols) if symbols.is_empty() => warn!(url, "no symbol column found"),
                Ok(symbols) => {
                    info!(url, count = symbols.len(), "index symbols loaded");
                    lists.push(symbols);
                }
                Err(err) => warn!(error = %err, url, "index page parse failed"),
            }
        }

        let merged = merge_index_symbols(&lists);
        if merged.len() < self.min_expected {
            warn!(
                found = merged.len(),
                min_expected = self.min_expected,
                "symbol universe too small, using fallback list"
            );
            return Ok(FALLBACK_SYMBOLS.iter().map(ToString::to_string).collect());
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_text;

    #[test]
    fn merge_normalizes_dedups_and_sorts() {
        let merged = merge_index_symbols(&[
            vec!["MSFT".into(), "BRK.B".into()],
            vec![" aapl ".into(), "MSFT".into(), "".into()],
        ]);
        assert_eq!(merged, vec!["AAPL", "BRK-B", "MSFT"]);
    }

    #[test]
    fn symbol_column_is_found_in_each_index_page() {
        let sp500 = extract_symbol_column(&fixture_text(&["wikipedia", "sp500.html"]), &["symbol"]).unwrap();
        assert_eq!(sp500, vec!["MMM", "AAPL", "BRK-B", "MSFT"]);

        let dow = extract_symbol_column(&fixture_text(&["wikipedia", "dow30.html"]), &["symbol", "ticker"]).unwrap();
        assert_eq!(dow, vec!["MMM", "AXP", "AAPL"]);
    }

    #[tokio::test]
    async fn static_universe_is_sorted_and_unique() {
        let universe = StaticUniverse::from_csv("msft,AAPL, msft ,brk.b");
        assert_eq!(universe.list().await.unwrap(), vec!["AAPL", "BRK-B", "MSFT"]);
    }
}
