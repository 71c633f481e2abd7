//! Pipeline health rollup.
//!
//! Pure assembly over the component snapshots: capture, queue, consumer and
//! caches each get a status, and the overall status is the worst of the
//! capture and queue verdicts. The report serialises to JSON for the
//! housekeeping log.

use serde::Serialize;

use crate::capture::CaptureSnapshot;
use crate::pipeline::consumer::ConsumerSnapshot;
use crate::pipeline::queue::{QueueSnapshot, QUEUE_ERROR_UTILISATION, QUEUE_WARN_UTILISATION};
use crate::prices::CacheSnapshot;

/// Cache hit rate below this after enough traffic draws a warning
const CACHE_HIT_RATE_WARN: f64 = 0.5;
/// Minimum requests before the hit rate is judged
const CACHE_MIN_REQUESTS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Warning,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureHealth {
    pub status: HealthStatus,
    #[serde(flatten)]
    pub stats: CaptureSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub status: HealthStatus,
    pub utilisation_pct: u64,
    #[serde(flatten)]
    pub stats: QueueSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: HealthStatus,
    #[serde(flatten)]
    pub stats: CacheSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub capture: CaptureHealth,
    pub queue: QueueHealth,
    pub consumer: ConsumerSnapshot,
    pub caches: Vec<CacheHealth>,
}

impl HealthReport {
    pub fn evaluate(
        capture: CaptureSnapshot,
        queue: QueueSnapshot,
        consumer: ConsumerSnapshot,
        caches: Vec<CacheSnapshot>,
    ) -> Self {
        let capture_status = if capture.enabled && !capture.running {
            HealthStatus::Down
        } else if capture.packets_dropped > 0 || capture.kernel_dropped > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Up
        };

        let queue_status = if queue.utilisation >= QUEUE_ERROR_UTILISATION {
            HealthStatus::Down
        } else if queue.utilisation >= QUEUE_WARN_UTILISATION {
            HealthStatus::Warning
        } else {
            HealthStatus::Up
        };

        let overall = if capture_status == HealthStatus::Down || queue_status == HealthStatus::Down
        {
            HealthStatus::Down
        } else if queue_status == HealthStatus::Warning {
            HealthStatus::Warning
        } else {
            HealthStatus::Up
        };

        let caches = caches
            .into_iter()
            .map(|stats| CacheHealth {
                status: if stats.requests >= CACHE_MIN_REQUESTS
                    && stats.hit_rate < CACHE_HIT_RATE_WARN
                {
                    HealthStatus::Warning
                } else {
                    HealthStatus::Up
                },
                stats,
            })
            .collect();

        Self {
            status: overall,
            capture: CaptureHealth { status: capture_status, stats: capture },
            queue: QueueHealth {
                status: queue_status,
                utilisation_pct: (queue.utilisation * 100.0) as u64,
                stats: queue,
            },
            consumer,
            caches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::consumer::CircuitState;

    fn capture(enabled: bool, running: bool, dropped: u64) -> CaptureSnapshot {
        CaptureSnapshot {
            enabled,
            running,
            interface: Some("eth0".into()),
            packets_received: 100,
            packets_dropped: dropped,
            payloads_enqueued: 90,
            kernel_received: 100,
            kernel_dropped: 0,
            kernel_if_dropped: 0,
        }
    }

    fn queue(size: usize, capacity: usize) -> QueueSnapshot {
        QueueSnapshot {
            size,
            capacity,
            utilisation: size as f64 / capacity as f64,
            enqueued: 0,
            dequeued: 0,
            dropped: 0,
        }
    }

    fn consumer() -> ConsumerSnapshot {
        ConsumerSnapshot {
            packets_processed: 10,
            entries_persisted: 20,
            errors: 0,
            circuit_state: CircuitState::Closed,
        }
    }

    fn cache(hits: u64, misses: u64) -> CacheSnapshot {
        let requests = hits + misses;
        CacheSnapshot {
            name: "items",
            hits,
            misses,
            requests,
            hit_rate: if requests > 0 { hits as f64 / requests as f64 } else { 0.0 },
            evictions: 0,
            entry_count: 5,
        }
    }

    #[test]
    fn test_all_up() {
        let report = HealthReport::evaluate(
            capture(true, true, 0),
            queue(10, 1000),
            consumer(),
            vec![cache(80, 20)],
        );
        assert_eq!(report.status, HealthStatus::Up);
        assert_eq!(report.capture.status, HealthStatus::Up);
        assert_eq!(report.queue.status, HealthStatus::Up);
        assert_eq!(report.caches[0].status, HealthStatus::Up);
    }

    #[test]
    fn test_capture_enabled_but_stopped_is_down() {
        let report = HealthReport::evaluate(
            capture(true, false, 0),
            queue(0, 1000),
            consumer(),
            vec![],
        );
        assert_eq!(report.capture.status, HealthStatus::Down);
        assert_eq!(report.status, HealthStatus::Down);
    }

    #[test]
    fn test_capture_disabled_is_not_down() {
        let report = HealthReport::evaluate(
            capture(false, false, 0),
            queue(0, 1000),
            consumer(),
            vec![],
        );
        assert_eq!(report.capture.status, HealthStatus::Up);
        assert_eq!(report.status, HealthStatus::Up);
    }

    #[test]
    fn test_drops_warn_capture_only() {
        let report = HealthReport::evaluate(
            capture(true, true, 3),
            queue(0, 1000),
            consumer(),
            vec![],
        );
        assert_eq!(report.capture.status, HealthStatus::Warning);
        // Capture warnings do not degrade the overall status
        assert_eq!(report.status, HealthStatus::Up);
    }

    #[test]
    fn test_queue_pressure_bands() {
        let warn = HealthReport::evaluate(capture(true, true, 0), queue(800, 1000), consumer(), vec![]);
        assert_eq!(warn.queue.status, HealthStatus::Warning);
        assert_eq!(warn.status, HealthStatus::Warning);
        assert_eq!(warn.queue.utilisation_pct, 80);

        let down = HealthReport::evaluate(capture(true, true, 0), queue(950, 1000), consumer(), vec![]);
        assert_eq!(down.queue.status, HealthStatus::Down);
        assert_eq!(down.status, HealthStatus::Down);
    }

    #[test]
    fn test_cold_cache_not_judged() {
        let report = HealthReport::evaluate(
            capture(true, true, 0),
            queue(0, 1000),
            consumer(),
            vec![cache(1, 9)],
        );
        // Only 10 requests: too few to warn
        assert_eq!(report.caches[0].status, HealthStatus::Up);
    }

    #[test]
    fn test_low_hit_rate_warns_after_traffic() {
        let report = HealthReport::evaluate(
            capture(true, true, 0),
            queue(0, 1000),
            consumer(),
            vec![cache(10, 190)],
        );
        assert_eq!(report.caches[0].status, HealthStatus::Warning);
    }

    #[test]
    fn test_report_serialises() {
        let report = HealthReport::evaluate(
            capture(true, true, 0),
            queue(10, 1000),
            consumer(),
            vec![cache(80, 20)],
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"UP\""));
        assert!(json.contains("\"circuit_state\":\"closed\""));
    }
}
