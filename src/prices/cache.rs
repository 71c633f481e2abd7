//! Read-through caches for the price service.
//!
//! Three named caches, each TTL-bounded (expire-after-write) and
//! size-bounded, with an atomic hit/miss/eviction block the health report
//! reads. Writes to the store invalidate the touched keys explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::sync::Cache;
use serde::Serialize;
use tracing::trace;

use crate::config::{CacheConfig, CacheEntryConfig};
use crate::models::{Item, ItemWithPrices, PriceEntry, QUANTITY_TIERS};

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache statistics for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub requests: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub entry_count: u64,
}

/// A TTL + size bounded cache with stats and an eviction trace
struct NamedCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: &'static str,
    cache: Cache<K, V>,
    stats: Arc<CacheStats>,
}

impl<K, V> NamedCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(name: &'static str, cfg: &CacheEntryConfig) -> Self {
        let stats = Arc::new(CacheStats::default());
        let listener_stats = stats.clone();
        let cache = Cache::builder()
            .max_capacity(cfg.max_size)
            .time_to_live(Duration::from_secs(cfg.ttl_secs))
            .eviction_listener(move |key: Arc<K>, _value, cause| {
                if matches!(cause, RemovalCause::Expired | RemovalCause::Size) {
                    listener_stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                trace!(cache = name, key = ?key, cause = ?cause, "cache_entry_removed");
            })
            .build();
        Self { name, cache, stats }
    }

    /// Read-through: serve from cache, else compute and store a hit-worthy
    /// value. Absent values are not cached.
    fn get_or_load<E>(
        &self,
        key: K,
        loader: impl FnOnce() -> Result<Option<V>, E>,
    ) -> Result<Option<V>, E>
    where
        K: Clone,
    {
        if let Some(v) = self.cache.get(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(v));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let loaded = loader()?;
        if let Some(v) = &loaded {
            self.cache.insert(key, v.clone());
        }
        Ok(loaded)
    }

    fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    fn snapshot(&self) -> CacheSnapshot {
        self.cache.run_pending_tasks();
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let requests = hits + misses;
        CacheSnapshot {
            name: self.name,
            hits,
            misses,
            requests,
            hit_rate: if requests > 0 { hits as f64 / requests as f64 } else { 0.0 },
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            entry_count: self.cache.entry_count(),
        }
    }
}

/// The price service's three caches
pub struct PriceCaches {
    items: NamedCache<i64, Item>,
    items_with_prices: NamedCache<i64, ItemWithPrices>,
    latest_prices: NamedCache<(i64, u32), PriceEntry>,
}

impl PriceCaches {
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            items: NamedCache::new("items", &cfg.items),
            items_with_prices: NamedCache::new("items_with_prices", &cfg.items_with_prices),
            latest_prices: NamedCache::new("latest_prices", &cfg.latest_prices),
        }
    }

    pub fn item<E>(
        &self,
        gid: i64,
        loader: impl FnOnce() -> Result<Option<Item>, E>,
    ) -> Result<Option<Item>, E> {
        self.items.get_or_load(gid, loader)
    }

    pub fn item_with_prices<E>(
        &self,
        gid: i64,
        loader: impl FnOnce() -> Result<Option<ItemWithPrices>, E>,
    ) -> Result<Option<ItemWithPrices>, E> {
        self.items_with_prices.get_or_load(gid, loader)
    }

    pub fn latest_price<E>(
        &self,
        gid: i64,
        quantity: u32,
        loader: impl FnOnce() -> Result<Option<PriceEntry>, E>,
    ) -> Result<Option<PriceEntry>, E> {
        self.latest_prices.get_or_load((gid, quantity), loader)
    }

    /// Drop every cached view of an item, across all quantity tiers
    pub fn evict_item(&self, gid: i64) {
        self.items.invalidate(&gid);
        self.items_with_prices.invalidate(&gid);
        for quantity in QUANTITY_TIERS {
            self.latest_prices.invalidate(&(gid, quantity));
        }
    }

    pub fn snapshots(&self) -> Vec<CacheSnapshot> {
        vec![
            self.items.snapshot(),
            self.items_with_prices.snapshot(),
            self.latest_prices.snapshot(),
        ]
    }
}
