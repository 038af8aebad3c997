use async_trait::async_trait;
use chrono::{DateTime, Datelike};
use mf_core::ProviderReport;
use serde_json::Value as JsonValue;

use crate::{json_number, json_text, FundamentalsProvider, ProviderError, ProviderHttp};

pub const YAHOO_SOURCE_ID: &str = "yahoo";
const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";
const MODULES: &str = "price,summaryProfile,incomeStatementHistory,balanceSheetHistory";

#[derive(Debug, Clone)]
pub struct YahooFinanceProvider {
    http: ProviderHttp,
    base_url: String,
}

impl YahooFinanceProvider {
    pub fn new(http: ProviderHttp) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl FundamentalsProvider for YahooFinanceProvider {
    fn source_id(&self) -> &'static str {
        YAHOO_SOURCE_ID
    }

    async fn fetch(&self, symbol: &str, year: i32) -> Result<ProviderReport, ProviderError> {
        let url = format!(
            "{}/v10/finance/quoteSummary/{symbol}?modules={MODULES}",
            self.base_url
        );
        let payload = self.http.get_json(YAHOO_SOURCE_ID, symbol, &url).await?;
        yahoo_report(symbol, year, &payload)
    }
}

fn statement_year(statement: &JsonValue) -> Option<i32> {
    let end = statement.get("endDate")?;
    if let Some(secs) = end.get("raw").and_then(JsonValue::as_i64) {
        return DateTime::from_timestamp(secs, 0).map(|at| at.year());
    }
    end.get("fmt")
        .and_then(JsonValue::as_str)
        .and_then(|fmt| fmt.get(..4))
        .and_then(|y| y.parse().ok())
}

fn statement_for_year<'a>(list: Option<&'a JsonValue>, year: i32) -> Option<&'a JsonValue> {
    list?
        .as_array()?
        .iter()
        .find(|statement| statement_year(statement) == Some(year))
}

pub fn yahoo_report(symbol: &str, year: i32, payload: &JsonValue) -> Result<ProviderReport, ProviderError> {
    let summary = payload
        .get("quoteSummary")
        .ok_or(ProviderError::MissingField("quoteSummary"))?;
    if let Some(error) = summary.get("error").filter(|e| !e.is_null()) {
        let description = json_text(error.get("description")).unwrap_or_else(|| error.to_string());
        return Err(ProviderError::Upstream(description));
    }
    let result = summary
        .get("result")
        .and_then(JsonValue::as_array)
        .and_then(|r| r.first())
        .ok_or(ProviderError::MissingField("result"))?;

    let price = &result["price"];
    let market_cap = json_number(price.get("marketCap")).ok_or(ProviderError::MissingField("marketCap"))?;

    let income = statement_for_year(
        result["incomeStatementHistory"].get("incomeStatementHistory"),
        year,
    )
    .ok_or(ProviderError::NoReportForYear(year))?;
    let balance = statement_for_year(
        result["balanceSheetHistory"].get("balanceSheetStatements"),
        year,
    )
    .ok_or(ProviderError::NoReportForYear(year))?;

    let ebit = json_number(income.get("ebit"))
        .or_else(|| json_number(income.get("operatingIncome")))
        .ok_or(ProviderError::MissingField("ebit"))?;
    let line = |name: &str| json_number(balance.get(name)).unwrap_or(0.0);
    let debt = line("longTermDebt") + line("shortLongTermDebt");
    let intangibles = line("goodWill") + line("intangibleAssets");
    let tangible_capital = line("totalAssets") - intangibles - line("totalCurrentLiabilities");

    Ok(ProviderReport {
        symbol: symbol.to_string(),
        year,
        company_name: json_text(price.get("longName"))
            .or_else(|| json_text(price.get("shortName")))
            .unwrap_or_else(|| symbol.to_string()),
        sector: json_text(result["summaryProfile"].get("sector")),
        ebit,
        enterprise_value: market_cap + debt - line("cash"),
        tangible_capital,
        market_cap,
        current_price: json_number(price.get("regularMarketPrice")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_json;
    use serde_json::json;

    #[test]
    fn selects_statements_by_end_date_year() {
        let payload = fixture_json(&["yahoo", "msft_quote_summary.json"]);
        let report = yahoo_report("MSFT", 2023, &payload).expect("report");

        assert_eq!(report.company_name, "Microsoft Corporation");
        assert_eq!(report.sector.as_deref(), Some("Technology"));
        assert_eq!(report.ebit, 88_523_000_000.0);
        assert_eq!(report.market_cap, 3_100_000_000_000.0);
        assert_eq!(
            report.enterprise_value,
            3_100_000_000_000.0 + (41_990_000_000.0 + 5_247_000_000.0) - 34_704_000_000.0
        );
        assert_eq!(
            report.tangible_capital,
            411_976_000_000.0 - (67_886_000_000.0 + 9_366_000_000.0) - 104_149_000_000.0
        );
        assert_eq!(report.current_price, Some(415.0));

        // 2022 income statement only carries operatingIncome
        let prior = yahoo_report("MSFT", 2022, &payload).expect("2022");
        assert_eq!(prior.ebit, 83_383_000_000.0);
    }

    #[test]
    fn upstream_error_is_reported() {
        let payload = json!({
            "quoteSummary": {
                "result": null,
                "error": {"code": "Not Found", "description": "Quote not found for ticker symbol: ZZZZ"}
            }
        });
        assert!(matches!(
            yahoo_report("ZZZZ", 2023, &payload),
            Err(ProviderError::Upstream(msg)) if msg.contains("ZZZZ")
        ));
    }
}
