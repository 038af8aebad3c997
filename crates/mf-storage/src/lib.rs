//! Persistence and I/O plumbing: the record store (PostgreSQL and in-memory),
//! the optional cache, the raw response archive and the paced HTTP
//! fetcher used by the providers.

mod archive;
mod cache;
mod http;
mod memory;
mod postgres;
mod store;

pub use archive::{ArchivedResponse, ResponseArchive};
pub use cache::{scan_pattern, Cache, CacheStats, MemoryCache, NoCache, RedisCache, SCAN_BATCH};
pub use http::{
    judge_body, judge_status, redact_api_keys, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    ProviderPacer, ProviderPacing, RetrySchedule, Verdict, MAX_RETRY_AFTER,
};
pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;
pub use store::{RecordStore, StoreError, StoreResult, UpsertOutcome};

pub const CRATE_NAME: &str = "mf-storage";
