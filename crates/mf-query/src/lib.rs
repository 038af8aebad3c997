//! Magic Formula ranking and the read-only query surface over stored
//! fundamentals.

pub mod ranking;
pub mod service;

pub use ranking::{rank, rank_all, RankCriteria, DEFAULT_TOP_N, MAX_TOP_N};
pub use service::{
    cache_key, summarize_completion, year_cache_prefixes, CompletionReport, CompletionSummary, RankingOutcome,
    RankingResult, StockQueryService, TopStocksQuery, WarmReport, CACHE_KEY_PREFIX, DEFAULT_CACHE_TTL,
    HEALTHY_PENDING_LIMIT,
};

pub const CRATE_NAME: &str = "mf-query";
