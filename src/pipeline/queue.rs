//! Bounded packet queue between the capture thread and the consumer.
//!
//! A fixed-capacity crossbeam channel: producers offer with a deadline and
//! drop on expiry, consumers poll with a deadline. The atomic stats block
//! feeds the queue monitor and the health report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{error, warn};

/// Utilisation above which the monitor warns
pub const QUEUE_WARN_UTILISATION: f64 = 0.80;
/// Utilisation above which the monitor reports an error
pub const QUEUE_ERROR_UTILISATION: f64 = 0.95;

#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub dropped: AtomicU64,
}

/// Point-in-time view for monitoring and health
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub size: usize,
    pub capacity: usize,
    pub utilisation: f64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
}

/// Fixed-capacity MPMC byte-payload queue
pub struct PacketQueue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    capacity: usize,
    stats: QueueStats,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: QueueStats::default(),
        }
    }

    /// Append within `timeout`; false means the producer should drop
    pub fn offer(&self, payload: Vec<u8>, timeout: Duration) -> bool {
        match self.tx.send_timeout(payload, timeout) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Non-blocking append, used by tests and the drain path
    pub fn try_offer(&self, payload: Vec<u8>) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Remove the head within `timeout`
    pub fn poll(&self, timeout: Duration) -> Option<Vec<u8>> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(payload)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Remove up to `max_n` without blocking
    pub fn drain(&self, max_n: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(max_n.min(64));
        while out.len() < max_n {
            match self.rx.try_recv() {
                Ok(payload) => {
                    self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                    out.push(payload);
                }
                Err(_) => break,
            }
        }
        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    #[inline]
    pub fn utilisation(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    #[inline]
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            size: self.len(),
            capacity: self.capacity,
            utilisation: self.utilisation(),
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// One monitor tick: log when utilisation crosses the alert bands
    pub fn report_utilisation(&self) {
        let snap = self.snapshot();
        if snap.utilisation >= QUEUE_ERROR_UTILISATION {
            error!(
                size = snap.size,
                capacity = snap.capacity,
                utilisation_pct = (snap.utilisation * 100.0) as u64,
                dropped = snap.dropped,
                "packet_queue_critical"
            );
        } else if snap.utilisation >= QUEUE_WARN_UTILISATION {
            warn!(
                size = snap.size,
                capacity = snap.capacity,
                utilisation_pct = (snap.utilisation * 100.0) as u64,
                "packet_queue_pressure"
            );
        }
    }
}
