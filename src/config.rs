//! Typed application configuration.
//!
//! Parsed once at startup from an optional TOML file, then overridden by
//! `HDV_`-prefixed environment variables and validated. Unrecognised keys in
//! the file are a startup error.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub queue: QueueConfig,
    pub consumer: ConsumerConfig,
    pub processing: ProcessingConfig,
    pub cache: CacheConfig,
    pub protocol: ProtocolConfig,
    pub storage: StorageConfig,
}

/// Live-capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// TCP port the game client talks to
    pub port: u16,
    /// Interface name; None picks the first non-loopback device
    pub interface: Option<String>,
    pub snap_len: i32,
    pub timeout_ms: u64,
    pub promiscuous: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 5555,
            interface: None,
            snap_len: 65_536,
            timeout_ms: 1_000,
            promiscuous: false,
        }
    }
}

/// Bounded packet queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub offer_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            offer_timeout_ms: 100,
        }
    }
}

/// Consumer and circuit-breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub poll_timeout_ms: u64,
    /// Consecutive failures before the breaker opens
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_timeout_ms: 1_000,
            breaker_threshold: 5,
            breaker_cooldown_ms: 60_000,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

/// Scheduled processing loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProcessingConfig {
    pub enabled: bool,
    /// Fixed delay between ticks
    pub interval_ms: u64,
    /// Batch mode per tick; false processes one packet at a time
    pub batch_mode: bool,
    pub queue_warn_threshold: usize,
    pub drain_workers: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            batch_mode: true,
            queue_warn_threshold: 500,
            drain_workers: 2,
        }
    }
}

/// Per-cache TTL and capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheEntryConfig {
    pub ttl_secs: u64,
    pub max_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub items: CacheEntryConfig,
    pub items_with_prices: CacheEntryConfig,
    pub latest_prices: CacheEntryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            items: CacheEntryConfig { ttl_secs: 7_200, max_size: 10_000 },
            items_with_prices: CacheEntryConfig { ttl_secs: 3_600, max_size: 2_000 },
            latest_prices: CacheEntryConfig { ttl_secs: 300, max_size: 30_000 },
        }
    }
}

impl Default for CacheEntryConfig {
    fn default() -> Self {
        Self { ttl_secs: 3_600, max_size: 10_000 }
    }
}

/// Protocol dispatch table.
///
/// The numeric message ids vary by client build and have not been verified
/// against a captured session; they are configuration, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProtocolConfig {
    pub price_list_id: u16,
    pub category_description_id: u16,
    pub compressed_container_id: u16,
    /// Inflated size may not exceed this multiple of compressed size
    pub max_inflate_ratio: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            price_list_id: 5765,
            category_description_id: 5752,
            compressed_container_id: 2,
            max_inflate_ratio: 64,
        }
    }
}

/// SQLite storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub path: String,
    /// Window within which identical (item, quantity, price) entries are
    /// suppressed as capture echoes
    pub dedup_window_secs: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "hdv_prices.db".to_string(),
            dedup_window_secs: 600,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, apply env overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parse config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `HDV_*` environment variables win over the file
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("HDV_CAPTURE_ENABLED") {
            self.capture.enabled = v;
        }
        if let Ok(v) = env::var("HDV_CAPTURE_INTERFACE") {
            if !v.is_empty() {
                self.capture.interface = Some(v);
            }
        }
        if let Some(v) = env_parse::<u16>("HDV_CAPTURE_PORT") {
            self.capture.port = v;
        }
        if let Ok(v) = env::var("HDV_DB_PATH") {
            if !v.is_empty() {
                self.storage.path = v;
            }
        }
        if let Some(v) = env_bool("HDV_PROCESSING_ENABLED") {
            self.processing.enabled = v;
        }
        if let Some(v) = env_parse::<usize>("HDV_QUEUE_CAPACITY") {
            self.queue.capacity = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.port == 0 {
            bail!("capture.port must be in 1..=65535");
        }
        if self.capture.snap_len < 1_500 {
            bail!("capture.snap_len must be at least 1500");
        }
        if !(100..=10_000).contains(&self.capture.timeout_ms) {
            bail!("capture.timeout_ms must be in 100..=10000");
        }
        if !(10..=100_000).contains(&self.queue.capacity) {
            bail!("queue.capacity must be in 10..=100000");
        }
        if !(10..=5_000).contains(&self.queue.offer_timeout_ms) {
            bail!("queue.offer_timeout_ms must be in 10..=5000");
        }
        if self.consumer.batch_size == 0 {
            bail!("consumer.batch_size must be at least 1");
        }
        if self.consumer.poll_timeout_ms == 0 {
            bail!("consumer.poll_timeout_ms must be at least 1");
        }
        if self.consumer.breaker_threshold == 0 {
            bail!("consumer.breaker_threshold must be at least 1");
        }
        if self.processing.interval_ms == 0 {
            bail!("processing.interval_ms must be at least 1");
        }
        if self.processing.drain_workers == 0 {
            bail!("processing.drain_workers must be at least 1");
        }
        for (name, entry) in [
            ("items", &self.cache.items),
            ("items_with_prices", &self.cache.items_with_prices),
            ("latest_prices", &self.cache.latest_prices),
        ] {
            if entry.ttl_secs == 0 {
                bail!("cache.{}.ttl_secs must be at least 1", name);
            }
            if entry.max_size == 0 {
                bail!("cache.{}.max_size must be at least 1", name);
            }
        }
        if self.protocol.max_inflate_ratio == 0 {
            bail!("protocol.max_inflate_ratio must be at least 1");
        }
        if self.storage.dedup_window_secs < 0 {
            bail!("storage.dedup_window_secs must not be negative");
        }
        Ok(())
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
