use std::sync::Arc;

use anyhow::{Context, Result};
use mf_query::StockQueryService;
use mf_sources::{
    ProviderHttp, SourceChain, SourceRegistry, StaticUniverse, SymbolUniverseProvider, WikipediaIndexUniverse,
};
use mf_storage::{Cache, HttpFetcher, NoCache, PgRecordStore, RecordStore, RedisCache, ResponseArchive};
use tracing::{info, warn};

use crate::{AcquisitionScheduler, RetryLedger, SchedulerSettings, StopSignal, SyncConfig};

const DB_MAX_CONNECTIONS: u32 = 10;
const REDIS_KEY_PREFIX: &str = "mf:";

/// Services built once from configuration and shared by `Arc`.
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub store: Arc<dyn RecordStore>,
    pub cache: Arc<dyn Cache>,
    pub chain: Arc<SourceChain>,
    pub universe: Arc<dyn SymbolUniverseProvider>,
    pub ledger: RetryLedger,
}

impl SyncRuntime {
    /// Connects to Postgres (running pending migrations), the optional
    /// cache and every configured provider.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let pg = PgRecordStore::connect(&config.database_url, DB_MAX_CONNECTIONS)
            .await
            .context("connecting to database")?;
        pg.migrate().await.context("running migrations")?;
        let store: Arc<dyn RecordStore> = Arc::new(pg);
        let cache = connect_cache(config.redis_url.as_deref()).await;
        Self::assemble(config, store, cache)
    }

    /// Wires the acquisition side around an existing store and cache.
    pub fn assemble(config: SyncConfig, store: Arc<dyn RecordStore>, cache: Arc<dyn Cache>) -> Result<Self> {
        let registry = SourceRegistry::load_or_builtin(config.sources_file())?;
        let fetcher = HttpFetcher::new(config.http_client_config(&registry))
            .context("building http client")?;
        let mut http = ProviderHttp::new(Arc::new(fetcher));
        if let Some(dir) = &config.archive_dir {
            http = http.with_archive(ResponseArchive::new(dir.clone()));
        }

        let providers = registry.build_providers(&http, &config.provider_keys());
        let chain = SourceChain::new(providers, config.screening());
        info!(providers = ?chain.provider_ids(), "source chain ready");

        let universe: Arc<dyn SymbolUniverseProvider> = match &config.symbols {
            Some(symbols) => Arc::new(StaticUniverse::new(symbols.iter().map(String::as_str))),
            None => Arc::new(WikipediaIndexUniverse::new(http)),
        };
        let ledger = RetryLedger::new(store.clone(), config.retry_policy());

        Ok(Self {
            config,
            store,
            cache,
            chain: Arc::new(chain),
            universe,
            ledger,
        })
    }

    pub fn scheduler(&self, stop: StopSignal) -> AcquisitionScheduler {
        AcquisitionScheduler::new(
            self.chain.clone(),
            self.store.clone(),
            self.ledger.clone(),
            self.universe.clone(),
            self.cache.clone(),
            SchedulerSettings::from_config(&self.config),
        )
        .with_stop_signal(stop)
    }

    pub fn query_service(&self) -> StockQueryService {
        StockQueryService::new(self.store.clone(), self.cache.clone())
    }
}

/// Redis when configured and reachable, otherwise no cache at all.
pub async fn connect_cache(redis_url: Option<&str>) -> Arc<dyn Cache> {
    let Some(url) = redis_url else {
        return Arc::new(NoCache);
    };
    match RedisCache::connect(url, REDIS_KEY_PREFIX).await {
        Ok(cache) => {
            info!("redis cache connected");
            Arc::new(cache)
        }
        Err(err) => {
            warn!(error = %err, "redis unavailable, continuing without cache");
            Arc::new(NoCache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_storage::MemoryRecordStore;
    use std::collections::HashMap;

    #[tokio::test]
    async fn static_symbols_and_builtin_registry_assemble() {
        let vars = HashMap::from([("MF_SYMBOLS".to_string(), "msft,aapl".to_string())]);
        let mut config = SyncConfig::from_lookup(|k| vars.get(k).cloned());
        let dir = tempfile::tempdir().unwrap();
        config.workspace_root = dir.path().to_path_buf();

        let runtime = SyncRuntime::assemble(config, Arc::new(MemoryRecordStore::new()), Arc::new(NoCache)).unwrap();
        assert_eq!(runtime.universe.list().await.unwrap(), vec!["AAPL", "MSFT"]);
        assert_eq!(
            runtime.chain.provider_ids(),
            vec!["polygon", "alpha_vantage", "yahoo", "sp500_placeholder"]
        );
    }

    #[tokio::test]
    async fn missing_redis_url_means_no_cache() {
        let cache = connect_cache(None).await;
        cache.set("stocks:year:2023:all", "[]", std::time::Duration::from_secs(5)).await;
        assert!(cache.get("stocks:year:2023:all").await.is_none());
    }
}
