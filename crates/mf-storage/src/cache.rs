//! Optional key-value cache in front of the record store. Every failure
//! degrades to a miss; callers never see cache errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Keys fetched per `SCAN` round trip and deleted per `DEL`.
pub const SCAN_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub healthy: bool,
    /// Live keys written by this process's cache; `None` when unknown.
    pub keys: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    fn new(backend: &'static str, healthy: bool, keys: Option<u64>, counters: &HitCounters) -> Self {
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        Self {
            backend,
            healthy,
            keys,
            hits,
            misses,
            hit_rate: hits as f64 / (hits + misses).max(1) as f64 * 100.0,
        }
    }
}

#[derive(Debug, Default)]
struct HitCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HitCounters {
    fn record(&self, value: Option<String>) -> Option<String> {
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Duration);
    /// Removes every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str);
    async fn delete(&self, key: &str);
    async fn stats(&self) -> CacheStats;
}

/// Cache that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) {}

    async fn delete_prefix(&self, _prefix: &str) {}

    async fn delete(&self, _key: &str) {}

    async fn stats(&self) -> CacheStats {
        CacheStats::new("none", false, None, &HitCounters::default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    counters: HitCounters,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        let value = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            _ => None,
        };
        self.counters.record(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
    }

    async fn delete_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .await
            .retain(|key, _| !key.starts_with(prefix));
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let live = self.entries.read().await.values().filter(|(_, expires_at)| *expires_at > now).count();
        CacheStats::new("memory", true, Some(live as u64), &self.counters)
    }
}

pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
    counters: HitCounters,
}

impl RedisCache {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
            counters: HitCounters::default(),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Walks the keyspace with `SCAN MATCH` so the server never blocks on
    /// a full `KEYS` listing.
    async fn scan(&self, pattern: &str) -> redis::RedisResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

/// `SCAN MATCH` pattern for every key under `prefix`, with glob
/// metacharacters in the prefix matched literally.
pub fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        let value = match redis::cmd("GET")
            .arg(self.prefixed(key))
            .query_async::<Option<String>>(&mut conn)
            .await
        {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, key, "cache get failed, treating as miss");
                None
            }
        };
        self.counters.record(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut conn = self.conn.clone();
        let result = redis::cmd("SET")
            .arg(self.prefixed(key))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(error = %err, key, "cache set failed");
        }
    }

    async fn delete_prefix(&self, prefix: &str) {
        let pattern = scan_pattern(&self.prefixed(prefix));
        let keys = match self.scan(&pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, pattern, "cache scan failed");
                return;
            }
        };
        if keys.is_empty() {
            return;
        }
        debug!(count = keys.len(), pattern, "invalidating cached keys");
        let mut conn = self.conn.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            if let Err(err) = redis::cmd("DEL").arg(chunk).query_async::<i64>(&mut conn).await {
                warn!(error = %err, pattern, "cache invalidation failed");
                return;
            }
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(err) = redis::cmd("DEL")
            .arg(self.prefixed(key))
            .query_async::<i64>(&mut conn)
            .await
        {
            warn!(error = %err, key, "cache delete failed");
        }
    }

    async fn stats(&self) -> CacheStats {
        let mut conn = self.conn.clone();
        let healthy = redis::cmd("PING").query_async::<String>(&mut conn).await.is_ok();
        let keys = match self.scan(&scan_pattern(&self.key_prefix)).await {
            Ok(keys) => Some(keys.len() as u64),
            Err(err) => {
                warn!(error = %err, "cache key count failed");
                None
            }
        };
        CacheStats::new("redis", healthy, keys, &self.counters)
    }
}
