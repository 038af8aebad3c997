use mf_core::{FundamentalsRecord, RankedStock, ScreeningCriteria};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOP_N: usize = 10;
pub const MAX_TOP_N: usize = 500;

/// Filters applied before ranking, plus the result size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankCriteria {
    pub top_n: usize,
    pub min_earnings_yield: f64,
    pub min_return_on_capital: f64,
    pub screening: ScreeningCriteria,
}

impl Default for RankCriteria {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
            min_earnings_yield: 0.0,
            min_return_on_capital: 0.0,
            screening: ScreeningCriteria::default(),
        }
    }
}

impl RankCriteria {
    pub fn passes(&self, record: &FundamentalsRecord) -> bool {
        record.ebit > 0.0
            && record.market_cap >= self.screening.min_market_cap
            && record.earnings_yield >= self.min_earnings_yield
            && record.return_on_capital >= self.min_return_on_capital
            && !self.screening.is_sector_excluded(record.sector.as_deref())
    }
}

/// Every record that passes the filters, ranked best first.
///
/// Both ratio ranks are sequential: equal values get consecutive ranks in
/// input order, and input is ordered by symbol then period before ranking.
/// The final order is score ascending with ties broken by symbol.
pub fn rank_all(records: &[FundamentalsRecord], criteria: &RankCriteria) -> Vec<RankedStock> {
    let mut eligible = records
        .iter()
        .filter(|r| criteria.passes(r))
        .collect::<Vec<_>>();
    eligible.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.period.cmp(&b.period)));

    let n = eligible.len();
    let mut ey_rank = vec![0u32; n];
    let mut roc_rank = vec![0u32; n];

    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&a, &b| eligible[b].earnings_yield.total_cmp(&eligible[a].earnings_yield));
    for (pos, idx) in order.iter().enumerate() {
        ey_rank[*idx] = pos as u32 + 1;
    }
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&a, &b| eligible[b].return_on_capital.total_cmp(&eligible[a].return_on_capital));
    for (pos, idx) in order.iter().enumerate() {
        roc_rank[*idx] = pos as u32 + 1;
    }

    let mut ranked = eligible
        .into_iter()
        .enumerate()
        .map(|(idx, record)| RankedStock {
            rank: 0,
            ey_rank: ey_rank[idx],
            roc_rank: roc_rank[idx],
            magic_formula_score: ey_rank[idx] + roc_rank[idx],
            record: record.clone(),
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        a.magic_formula_score
            .cmp(&b.magic_formula_score)
            .then_with(|| a.record.symbol.cmp(&b.record.symbol))
    });
    for (pos, stock) in ranked.iter_mut().enumerate() {
        stock.rank = pos as u32 + 1;
    }
    ranked
}

pub fn rank(records: &[FundamentalsRecord], criteria: &RankCriteria) -> Vec<RankedStock> {
    let mut ranked = rank_all(records, criteria);
    ranked.truncate(criteria.top_n);
    ranked
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mf_core::Period;

    pub(crate) fn record(symbol: &str, period: Period, ey: f64, roc: f64) -> FundamentalsRecord {
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).single().unwrap();
        FundamentalsRecord {
            symbol: symbol.to_string(),
            period,
            company_name: format!("{symbol} Holdings"),
            sector: Some("Technology".into()),
            ebit: 100.0,
            enterprise_value: 100.0 / ey * 100.0,
            tangible_capital: 100.0 / roc * 100.0,
            earnings_yield: ey,
            return_on_capital: roc,
            market_cap: 5e9,
            current_price: None,
            data_source: "test".into(),
            fetched_at: at,
            updated_at: at,
        }
    }

    fn scenario() -> Vec<FundamentalsRecord> {
        let year = Period::annual(2023);
        vec![
            record("E", year, 4.0, 20.0),
            record("C", year, 6.0, 6.0),
            record("A", year, 10.0, 5.0),
            record("D", year, 15.0, 2.0),
            record("B", year, 8.0, 12.0),
        ]
    }

    #[test]
    fn five_stock_scenario_orders_by_combined_score() {
        let ranked = rank_all(&scenario(), &RankCriteria::default());
        let order = ranked
            .iter()
            .map(|s| (s.record.symbol.as_str(), s.magic_formula_score))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![("B", 5), ("A", 6), ("D", 6), ("E", 6), ("C", 7)]);
        assert_eq!(ranked.iter().map(|s| s.rank).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        for stock in &ranked {
            assert_eq!(stock.magic_formula_score, stock.ey_rank + stock.roc_rank);
        }
        let d = ranked.iter().find(|s| s.record.symbol == "D").unwrap();
        assert_eq!((d.ey_rank, d.roc_rank), (1, 5));
    }

    #[test]
    fn ranking_is_independent_of_input_order() {
        let mut reversed = scenario();
        reversed.reverse();
        assert_eq!(rank_all(&reversed, &RankCriteria::default()), rank_all(&scenario(), &RankCriteria::default()));
    }

    #[test]
    fn equal_ratios_get_sequential_ranks_by_symbol() {
        let year = Period::annual(2022);
        let records = vec![record("ZZZ", year, 10.0, 10.0), record("AAA", year, 10.0, 10.0)];
        let ranked = rank_all(&records, &RankCriteria::default());
        assert_eq!(ranked[0].record.symbol, "AAA");
        assert_eq!((ranked[0].ey_rank, ranked[0].roc_rank), (1, 1));
        assert_eq!((ranked[1].ey_rank, ranked[1].roc_rank), (2, 2));
    }

    #[test]
    fn filters_are_exact_thresholds() {
        let year = Period::annual(2023);
        let mut loss = record("LOSS", year, 9.0, 9.0);
        loss.ebit = -1.0;
        let mut small = record("SMALL", year, 9.0, 9.0);
        small.market_cap = 999_999_999.0;
        let mut bank = record("BANK", year, 9.0, 9.0);
        bank.sector = Some("Financial Services".into());
        let at_edge = record("EDGE", year, 5.0, 7.5);
        let below = record("LOW", year, 4.99, 30.0);

        let criteria = RankCriteria {
            min_earnings_yield: 5.0,
            min_return_on_capital: 7.5,
            ..RankCriteria::default()
        };
        let ranked = rank_all(&[loss, small, bank, at_edge, below], &criteria);
        assert_eq!(ranked.iter().map(|s| s.record.symbol.as_str()).collect::<Vec<_>>(), vec!["EDGE"]);
    }

    #[test]
    fn top_n_truncates_after_ranking() {
        let ranked = rank(
            &scenario(),
            &RankCriteria {
                top_n: 2,
                ..RankCriteria::default()
            },
        );
        assert_eq!(ranked.iter().map(|s| s.record.symbol.as_str()).collect::<Vec<_>>(), vec!["B", "A"]);
    }
}
