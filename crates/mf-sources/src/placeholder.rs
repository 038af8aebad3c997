use std::collections::HashMap;

use async_trait::async_trait;
use mf_core::ProviderReport;
use tokio::sync::OnceCell;
use tracing::info;

use crate::universe::normalize_symbol;
use crate::wiki::parse_tables;
use crate::{FundamentalsProvider, ProviderError, ProviderHttp};

pub const PLACEHOLDER_SOURCE_ID: &str = "sp500_placeholder";
const DEFAULT_URL: &str = "https://en.wikipedia.org/wiki/List_of_S%26P_500_companies";

const PLACEHOLDER_MARKET_CAP: f64 = 100_000_000.0;
const PLACEHOLDER_EBIT: f64 = 10_000_000.0;
const PLACEHOLDER_ENTERPRISE_VALUE: f64 = 100_000_000.0;
const PLACEHOLDER_TANGIBLE_CAPITAL: f64 = 50_000_000.0;
const PLACEHOLDER_PRICE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedCompany {
    pub security: String,
    pub sector: Option<String>,
}

/// Degraded last resort: confirms S&P 500 membership from the Wikipedia
/// constituents table and answers with fixed placeholder figures. The
/// constituents table is fetched once per process.
#[derive(Debug)]
pub struct Sp500PlaceholderProvider {
    http: ProviderHttp,
    url: String,
    constituents: OnceCell<HashMap<String, ListedCompany>>,
}

impl Sp500PlaceholderProvider {
    pub fn new(http: ProviderHttp) -> Self {
        Self {
            http,
            url: DEFAULT_URL.to_string(),
            constituents: OnceCell::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    async fn constituents(&self) -> Result<&HashMap<String, ListedCompany>, ProviderError> {
        self.constituents
            .get_or_try_init(|| async {
                let html = self
                    .http
                    .get_text(PLACEHOLDER_SOURCE_ID, "sp500", &self.url)
                    .await?;
                let listed = parse_sp500_constituents(&html)?;
                info!(count = listed.len(), "loaded s&p 500 constituents");
                Ok::<_, ProviderError>(listed)
            })
            .await
    }
}

#[async_trait]
impl FundamentalsProvider for Sp500PlaceholderProvider {
    fn source_id(&self) -> &'static str {
        PLACEHOLDER_SOURCE_ID
    }

    async fn fetch(&self, symbol: &str, year: i32) -> Result<ProviderReport, ProviderError> {
        let listed = self.constituents().await?;
        let company = listed
            .get(&normalize_symbol(symbol))
            .ok_or_else(|| ProviderError::NotListed(symbol.to_string()))?;
        Ok(ProviderReport {
            symbol: symbol.to_string(),
            year,
            company_name: company.security.clone(),
            sector: company.sector.clone(),
            ebit: PLACEHOLDER_EBIT,
            enterprise_value: PLACEHOLDER_ENTERPRISE_VALUE,
            tangible_capital: PLACEHOLDER_TANGIBLE_CAPITAL,
            market_cap: PLACEHOLDER_MARKET_CAP,
            current_price: Some(PLACEHOLDER_PRICE),
        })
    }
}

/// Constituents keyed by normalized symbol (`BRK.B` becomes `BRK-B`).
pub fn parse_sp500_constituents(html: &str) -> Result<HashMap<String, ListedCompany>, ProviderError> {
    let tables = parse_tables(html)?;
    let table = tables
        .iter()
        .find(|t| t.id.as_deref() == Some("constituents"))
        .or_else(|| tables.iter().find(|t| t.column(&["symbol"]).is_some()))
        .ok_or(ProviderError::MissingField("constituents table"))?;

    let symbol_col = table.column(&["symbol"]).ok_or(ProviderError::MissingField("Symbol"))?;
    let security_col = table.column(&["security"]);
    let sector_col = table.column(&["gics sector"]);

    let mut out = HashMap::new();
    for row in &table.rows {
        let Some(symbol) = row.get(symbol_col).map(|s| normalize_symbol(s)).filter(|s| !s.is_empty()) else {
            continue;
        };
        let security = security_col
            .and_then(|c| row.get(c))
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| symbol.clone());
        let sector = sector_col.and_then(|c| row.get(c)).filter(|s| !s.is_empty()).cloned();
        out.insert(symbol, ListedCompany { security, sector });
    }
    Ok(out)
}
