//! Minimal reader for Wikipedia `wikitable` markup.

use scraper::{ElementRef, Html, Selector};

use crate::ProviderError;

#[derive(Debug, Clone, Default)]
pub(crate) struct WikiTable {
    pub id: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl WikiTable {
    /// Index of the first header containing any keyword, case-insensitively.
    pub fn column(&self, keywords: &[&str]) -> Option<usize> {
        self.headers.iter().position(|header| {
            let header = header.to_ascii_lowercase();
            keywords.iter().any(|k| header.contains(&k.to_ascii_lowercase()))
        })
    }
}

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Selector(format!("{css}: {e}")))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Every `table.wikitable` in document order. Header cells come from the
/// first row made only of `<th>`; body rows are the rows holding at least
/// one `<td>`, read across both `<th>` and `<td>` cells so row headers keep
/// column positions aligned.
pub(crate) fn parse_tables(html: &str) -> Result<Vec<WikiTable>, ProviderError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table.wikitable")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("th, td")?;
    let td_sel = selector("td")?;

    let mut tables = Vec::new();
    for table in document.select(&table_sel) {
        let mut parsed = WikiTable {
            id: table.value().attr("id").map(ToString::to_string),
            ..WikiTable::default()
        };
        for row in table.select(&row_sel) {
            let cells = row.select(&cell_sel).map(cell_text).collect::<Vec<_>>();
            if row.select(&td_sel).next().is_none() {
                if parsed.headers.is_empty() {
                    parsed.headers = cells;
                }
                continue;
            }
            parsed.rows.push(cells);
        }
        tables.push(parsed);
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_headers_keep_columns_aligned() {
        let html = r#"
            <table class="wikitable" id="constituents">
              <tr><th>Company</th><th>Exchange</th><th>Symbol</th></tr>
              <tr><th>3M</th><td>NYSE</td><td>MMM</td></tr>
              <tr><th>Apple Inc.</th><td>NASDAQ</td><td>AAPL</td></tr>
            </table>"#;
        let tables = parse_tables(html).expect("tables");
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.id.as_deref(), Some("constituents"));
        let col = table.column(&["symbol"]).expect("symbol column");
        let symbols = table.rows.iter().map(|r| r[col].as_str()).collect::<Vec<_>>();
        assert_eq!(symbols, vec!["MMM", "AAPL"]);
    }
}
