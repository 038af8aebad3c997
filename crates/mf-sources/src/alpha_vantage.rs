use async_trait::async_trait;
use mf_core::ProviderReport;
use serde_json::Value as JsonValue;

use crate::{json_number, json_text, FundamentalsProvider, ProviderError, ProviderHttp};

pub const ALPHA_VANTAGE_SOURCE_ID: &str = "alpha_vantage";
const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";

#[derive(Debug, Clone)]
pub struct AlphaVantageProvider {
    http: ProviderHttp,
    api_key: Option<String>,
    base_url: String,
}

impl AlphaVantageProvider {
    /// The public `demo` key only serves a handful of symbols and counts as
    /// unconfigured.
    pub fn new(http: ProviderHttp, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty() && k != "demo"),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn query(&self, function: &str, symbol: &str, key: &str) -> Result<JsonValue, ProviderError> {
        let url = format!(
            "{}/query?function={function}&symbol={symbol}&apikey={key}",
            self.base_url
        );
        let payload = self.http.get_json(ALPHA_VANTAGE_SOURCE_ID, symbol, &url).await?;
        check_payload(&payload)?;
        Ok(payload)
    }
}

#[async_trait]
impl FundamentalsProvider for AlphaVantageProvider {
    fn source_id(&self) -> &'static str {
        ALPHA_VANTAGE_SOURCE_ID
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn fetch(&self, symbol: &str, year: i32) -> Result<ProviderReport, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        let income = self.query("INCOME_STATEMENT", symbol, key).await?;
        annual_report(&income, year)?;
        let balance = self.query("BALANCE_SHEET", symbol, key).await?;
        let overview = self.query("OVERVIEW", symbol, key).await?;
        alpha_vantage_report(symbol, year, &income, &balance, &overview)
    }
}

/// Alpha Vantage answers quota exhaustion and bad requests with HTTP 200 and
/// a message body.
fn check_payload(payload: &JsonValue) -> Result<(), ProviderError> {
    for key in ["Information", "Note"] {
        if let Some(message) = payload.get(key) {
            return Err(ProviderError::RateLimited(
                message.as_str().unwrap_or_default().to_string(),
            ));
        }
    }
    if let Some(message) = payload.get("Error Message") {
        return Err(ProviderError::Upstream(
            message.as_str().unwrap_or_default().to_string(),
        ));
    }
    Ok(())
}

fn annual_report(payload: &JsonValue, year: i32) -> Result<&JsonValue, ProviderError> {
    let prefix = year.to_string();
    payload
        .get("annualReports")
        .and_then(JsonValue::as_array)
        .ok_or(ProviderError::MissingField("annualReports"))?
        .iter()
        .find(|report| {
            report
                .get("fiscalDateEnding")
                .and_then(JsonValue::as_str)
                .is_some_and(|date| date.starts_with(&prefix))
        })
        .ok_or(ProviderError::NoReportForYear(year))
}

pub fn alpha_vantage_report(
    symbol: &str,
    year: i32,
    income: &JsonValue,
    balance: &JsonValue,
    overview: &JsonValue,
) -> Result<ProviderReport, ProviderError> {
    for payload in [income, balance, overview] {
        check_payload(payload)?;
    }
    let income = annual_report(income, year)?;
    let balance = annual_report(balance, year)?;
    let line = |report: &JsonValue, name: &str| json_number(report.get(name)).unwrap_or(0.0);

    let market_cap = json_number(overview.get("MarketCapitalization"))
        .ok_or(ProviderError::MissingField("MarketCapitalization"))?;
    let cash = line(balance, "cashAndCashEquivalentsAtCarryingValue");
    let debt = line(balance, "shortLongTermDebtTotal");
    let tangible_capital = line(balance, "totalAssets")
        - line(balance, "intangibleAssets")
        - line(balance, "totalCurrentLiabilities");

    Ok(ProviderReport {
        symbol: symbol.to_string(),
        year,
        company_name: json_text(overview.get("Name")).unwrap_or_else(|| symbol.to_string()),
        sector: json_text(overview.get("Sector")),
        ebit: line(income, "ebit"),
        enterprise_value: market_cap + debt - cash,
        tangible_capital,
        market_cap,
        current_price: json_number(overview.get("50DayMovingAverage")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_json;
    use serde_json::json;

    #[test]
    fn normalizes_string_fields_for_the_requested_year() {
        let income = fixture_json(&["alpha_vantage", "ibm_income_statement.json"]);
        let balance = fixture_json(&["alpha_vantage", "ibm_balance_sheet.json"]);
        let overview = fixture_json(&["alpha_vantage", "ibm_overview.json"]);

        let report = alpha_vantage_report("IBM", 2023, &income, &balance, &overview).expect("report");
        assert_eq!(report.company_name, "International Business Machines");
        assert_eq!(report.sector.as_deref(), Some("TECHNOLOGY"));
        assert_eq!(report.ebit, 10_000_000_000.0);
        assert_eq!(report.market_cap, 170_000_000_000.0);
        assert_eq!(report.enterprise_value, 170_000_000_000.0 + 56_000_000_000.0 - 13_000_000_000.0);
        // intangibleAssets is "None"
        assert_eq!(report.tangible_capital, 135_000_000_000.0 - 0.0 - 34_000_000_000.0);
        assert_eq!(report.current_price, Some(185.5));

        let prior = alpha_vantage_report("IBM", 2022, &income, &balance, &overview).expect("2022");
        assert_eq!(prior.ebit, 8_000_000_000.0);

        assert!(matches!(
            alpha_vantage_report("IBM", 2015, &income, &balance, &overview),
            Err(ProviderError::NoReportForYear(2015))
        ));
    }

    #[test]
    fn quota_messages_are_rate_limits() {
        let limited = json!({
            "Information": "Thank you for using Alpha Vantage! Our standard API rate limit is 25 requests per day."
        });
        let note = json!({"Note": "Please consider spreading out your free API requests more sparingly."});
        let bad = json!({"Error Message": "Invalid API call."});
        assert!(matches!(check_payload(&limited), Err(ProviderError::RateLimited(_))));
        assert!(matches!(check_payload(&note), Err(ProviderError::RateLimited(_))));
        assert!(matches!(check_payload(&bad), Err(ProviderError::Upstream(_))));
    }
}
