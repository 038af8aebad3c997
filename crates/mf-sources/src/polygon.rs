use async_trait::async_trait;
use mf_core::ProviderReport;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{json_number, json_text, FundamentalsProvider, ProviderError, ProviderHttp};

pub const POLYGON_SOURCE_ID: &str = "polygon";
const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

#[derive(Debug, Clone)]
pub struct PolygonProvider {
    http: ProviderHttp,
    api_key: Option<String>,
    base_url: String,
}

impl PolygonProvider {
    pub fn new(http: ProviderHttp, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl FundamentalsProvider for PolygonProvider {
    fn source_id(&self) -> &'static str {
        POLYGON_SOURCE_ID
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn fetch(&self, symbol: &str, year: i32) -> Result<ProviderReport, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        let details_url = format!("{}/v3/reference/tickers/{symbol}?apiKey={key}", self.base_url);
        let details = self.http.get_json(POLYGON_SOURCE_ID, symbol, &details_url).await?;
        if details.get("results").is_none() {
            return Err(ProviderError::MissingField("results"));
        }

        let financials_url = format!(
            "{}/vX/reference/financials?ticker={symbol}&timeframe=annual&limit=10&apiKey={key}",
            self.base_url
        );
        let financials = self.http.get_json(POLYGON_SOURCE_ID, symbol, &financials_url).await?;
        polygon_report(symbol, year, &details, &financials)
    }
}

/// `fiscal_year` arrives as either a string or an integer.
fn fiscal_year(value: Option<&JsonValue>) -> Option<i32> {
    match value? {
        JsonValue::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Normalize the ticker details and annual financials responses into a
/// report for `year`.
pub fn polygon_report(
    symbol: &str,
    year: i32,
    details: &JsonValue,
    financials: &JsonValue,
) -> Result<ProviderReport, ProviderError> {
    let info = details
        .get("results")
        .ok_or(ProviderError::MissingField("results"))?;
    let market_cap = json_number(info.get("market_cap")).unwrap_or(0.0);

    let reports = financials
        .get("results")
        .and_then(JsonValue::as_array)
        .ok_or(ProviderError::MissingField("results"))?;
    let Some(report) = reports.iter().find(|r| fiscal_year(r.get("fiscal_year")) == Some(year)) else {
        let available = reports
            .iter()
            .filter_map(|r| fiscal_year(r.get("fiscal_year")))
            .collect::<Vec<_>>();
        debug!(symbol, year, ?available, "no polygon report for requested fiscal year");
        return Err(ProviderError::NoReportForYear(year));
    };

    let statements = report
        .get("financials")
        .ok_or(ProviderError::MissingField("financials"))?;
    let income = &statements["income_statement"];
    let balance = &statements["balance_sheet"];

    let ebit = json_number(income.get("operating_income_loss"))
        .ok_or(ProviderError::MissingField("operating_income_loss"))?;
    let line = |name: &str| json_number(balance.get(name)).unwrap_or(0.0);
    let cash = first_nonzero(line("cash_and_cash_equivalents"), line("cash"));
    let debt = first_nonzero(line("long_term_debt"), line("debt"));
    let tangible_capital = line("assets") - line("intangible_assets") - line("current_liabilities");

    let current_price = json_number(info.get("share_class_shares_outstanding"))
        .filter(|shares| *shares > 0.0)
        .map(|shares| market_cap / shares);

    Ok(ProviderReport {
        symbol: symbol.to_string(),
        year,
        company_name: json_text(info.get("name")).unwrap_or_else(|| symbol.to_string()),
        sector: json_text(info.get("sic_description")),
        ebit,
        enterprise_value: market_cap + debt - cash,
        tangible_capital,
        market_cap,
        current_price,
    })
}

fn first_nonzero(primary: f64, fallback: f64) -> f64 {
    if primary == 0.0 {
        fallback
    } else {
        primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_json;
    use mf_storage::{HttpClientConfig, HttpFetcher, RetrySchedule};
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn picks_the_report_matching_the_requested_fiscal_year() {
        let details = fixture_json(&["polygon", "aapl_details.json"]);
        let financials = fixture_json(&["polygon", "aapl_financials.json"]);

        let report = polygon_report("AAPL", 2023, &details, &financials).expect("2023 report");
        assert_eq!(report.company_name, "Apple Inc.");
        assert_eq!(report.ebit, 114_301_000_000.0);
        // market cap + long term debt - cash
        assert_eq!(report.enterprise_value, 3_000_000_000_000.0 + 95_281_000_000.0 - 29_965_000_000.0);
        assert_eq!(
            report.tangible_capital,
            352_583_000_000.0 - 0.0 - 145_308_000_000.0
        );
        assert_eq!(report.current_price, Some(200.0));

        let older = polygon_report("AAPL", 2022, &details, &financials).expect("2022 report");
        assert_eq!(older.ebit, 119_437_000_000.0);
        // cash_and_cash_equivalents absent, falls back to cash
        assert_eq!(older.enterprise_value, 3_000_000_000_000.0 + 98_959_000_000.0 - 23_646_000_000.0);

        assert!(matches!(
            polygon_report("AAPL", 2019, &details, &financials),
            Err(ProviderError::NoReportForYear(2019))
        ));
    }

    #[tokio::test]
    async fn fetches_details_and_financials_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/reference/tickers/AAPL"))
            .and(query_param("apiKey", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture_json(&["polygon", "aapl_details.json"])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/vX/reference/financials"))
            .and(query_param("ticker", "AAPL"))
            .and(query_param("timeframe", "annual"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(fixture_json(&["polygon", "aapl_financials.json"])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            retry: RetrySchedule::none(),
            ..HttpClientConfig::default()
        })
        .expect("fetcher");
        let provider = PolygonProvider::new(ProviderHttp::new(Arc::new(fetcher)), Some("test-key".into()))
            .with_base_url(server.uri());

        let report = provider.fetch("AAPL", 2023).await.expect("report");
        assert_eq!(report.symbol, "AAPL");
        assert_eq!(report.sector.as_deref(), Some("ELECTRONIC COMPUTERS"));
    }

    #[tokio::test]
    async fn missing_key_is_unconfigured() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let provider = PolygonProvider::new(ProviderHttp::new(Arc::new(fetcher)), Some("  ".into()));
        assert!(!provider.is_configured());
        assert!(matches!(
            provider.fetch("AAPL", 2023).await,
            Err(ProviderError::NotConfigured)
        ));
    }
}
