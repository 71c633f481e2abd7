//! Queue consumer guarded by a circuit breaker.
//!
//! Pulls captured payloads off the bounded queue and hands them to the
//! price service, single-packet or batched. Sustained persistence failures
//! open the breaker; while open the consumer refuses work without touching
//! the queue, then allows a single probe after the cooldown.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::pipeline::queue::PacketQueue;
use crate::prices::{PacketProcessor, ServiceError};

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Three-state breaker: opens after `threshold` consecutive failures, stays
/// open for `cooldown`, then admits one probe
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed. Transitions Open → HalfOpen once the
    /// cooldown has elapsed; the HalfOpen probe ignores the cooldown.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    info!("circuit_half_open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit_closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        match inner.state {
            // A failed probe re-arms the cooldown immediately
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("circuit_reopened_after_probe");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "circuit_opened"
                );
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

// =============================================================================
// CONSUMER
// =============================================================================

/// Failures surfaced to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// Breaker refused the call; retry after cooldown
    CircuitOpen,
    Service(ServiceError),
}

impl fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::Service(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConsumeError {}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub packets_processed: AtomicU64,
    pub entries_persisted: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub packets_processed: u64,
    pub entries_persisted: u64,
    pub errors: u64,
    pub circuit_state: CircuitState,
}

pub struct PacketConsumer {
    queue: Arc<PacketQueue>,
    processor: Arc<dyn PacketProcessor>,
    breaker: CircuitBreaker,
    cfg: ConsumerConfig,
    stats: ConsumerStats,
}

impl PacketConsumer {
    pub fn new(
        queue: Arc<PacketQueue>,
        processor: Arc<dyn PacketProcessor>,
        cfg: ConsumerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(cfg.breaker_threshold, cfg.breaker_cooldown());
        Self {
            queue,
            processor,
            breaker,
            cfg,
            stats: ConsumerStats::default(),
        }
    }

    /// Process one packet. `Ok(false)` means the poll deadline passed with
    /// nothing to do.
    pub fn consume_one(&self) -> Result<bool, ConsumeError> {
        if !self.breaker.try_acquire() {
            return Err(ConsumeError::CircuitOpen);
        }
        let payload = match self.queue.poll(self.cfg.poll_timeout()) {
            Some(p) => p,
            None => return Ok(false),
        };

        match self.processor.process_packet(&payload) {
            Ok(persisted) => {
                self.record_progress(1, persisted);
                Ok(true)
            }
            Err(e) => self.record_error(e).map(|_| true),
        }
    }

    /// Process up to `batch_size` packets in one service call. The first
    /// packet is awaited within the poll deadline; the rest are taken
    /// without blocking.
    pub fn consume_batch(&self) -> Result<usize, ConsumeError> {
        if !self.breaker.try_acquire() {
            return Err(ConsumeError::CircuitOpen);
        }
        let first = match self.queue.poll(self.cfg.poll_timeout()) {
            Some(p) => p,
            None => return Ok(0),
        };
        let mut batch = vec![first];
        batch.extend(self.queue.drain(self.cfg.batch_size.saturating_sub(1)));

        match self.processor.process_batch(&batch) {
            Ok(persisted) => {
                self.record_progress(batch.len() as u64, persisted);
                Ok(persisted)
            }
            Err(e) => self.record_error(e).map(|_| 0),
        }
    }

    /// Consume batches until the queue is empty or the first error
    pub fn drain(&self) -> Result<usize, ConsumeError> {
        let mut total = 0;
        loop {
            if self.queue.is_empty() {
                return Ok(total);
            }
            match self.consume_batch() {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(e) => return Err(e),
            }
        }
    }

    fn record_progress(&self, packets: u64, persisted: usize) {
        self.stats.packets_processed.fetch_add(packets, Ordering::Relaxed);
        self.stats
            .entries_persisted
            .fetch_add(persisted as u64, Ordering::Relaxed);
        self.breaker.record_success();
    }

    /// Storage failures feed the breaker and propagate; decode noise is
    /// dropped here so one bad frame cannot stall the pipeline
    fn record_error(&self, e: ServiceError) -> Result<(), ConsumeError> {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        if e.counts_toward_breaker() {
            self.breaker.record_failure();
            return Err(ConsumeError::Service(e));
        }
        debug!(error = %e, "packet_dropped");
        Ok(())
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            packets_processed: self.stats.packets_processed.load(Ordering::Relaxed),
            entries_persisted: self.stats.entries_persisted.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
        }
    }
}
