//! Live capture loop.
//!
//! Opens the selected device with a kernel-side BPF filter on the game
//! port, extracts TCP payloads from captured packets and offers them to
//! the bounded queue with a deadline. The loop never blocks indefinitely:
//! a full queue drops the payload and counts it, and the pcap read timeout
//! doubles as the shutdown poll interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use etherparse::{SlicedPacket, TransportSlice};
use parking_lot::Mutex;
use pcap::{Active, Capture};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capture::{interface, CaptureError};
use crate::config::CaptureConfig;
use crate::pipeline::queue::PacketQueue;

/// How long `stop()` waits for the capture thread to exit
const JOIN_DEADLINE: Duration = Duration::from_secs(5);
/// Kernel stats are refreshed every this many captured packets
const STATS_REFRESH_INTERVAL: u64 = 256;

#[derive(Debug, Default)]
pub struct SnifferStats {
    /// Packets seen by the loop (before any filtering)
    pub packets_received: AtomicU64,
    /// TCP payloads the queue refused within the offer deadline
    pub packets_dropped: AtomicU64,
    /// TCP payloads handed to the queue
    pub payloads_enqueued: AtomicU64,
    /// Kernel-side counters from the capture handle
    pub kernel_received: AtomicU64,
    pub kernel_dropped: AtomicU64,
    pub kernel_if_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureSnapshot {
    pub enabled: bool,
    pub running: bool,
    pub interface: Option<String>,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub payloads_enqueued: u64,
    pub kernel_received: u64,
    pub kernel_dropped: u64,
    pub kernel_if_dropped: u64,
}

pub struct PacketSniffer {
    cfg: CaptureConfig,
    queue: Arc<PacketQueue>,
    offer_timeout: Duration,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    interface_name: Mutex<Option<String>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<SnifferStats>,
}

impl PacketSniffer {
    pub fn new(cfg: CaptureConfig, queue: Arc<PacketQueue>, offer_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            queue,
            offer_timeout,
            running: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            interface_name: Mutex::new(None),
            thread_handle: Mutex::new(None),
            stats: Arc::new(SnifferStats::default()),
        })
    }

    /// Open the device, install the filter and spawn the capture thread.
    /// Any failure here, including the BPF install, is fatal to startup.
    pub fn start(self: &Arc<Self>) -> Result<(), CaptureError> {
        if !self.cfg.enabled {
            info!("capture_disabled");
            return Ok(());
        }
        let mut handle = self.thread_handle.lock();
        if handle.is_some() {
            warn!("capture_already_running");
            return Ok(());
        }

        let device = interface::select_device(self.cfg.interface.as_deref())?;
        let device_name = device.name.clone();

        let mut capture = Capture::from_device(device)
            .map_err(|e| CaptureError::Open(e.to_string()))?
            .snaplen(self.cfg.snap_len)
            .promisc(self.cfg.promiscuous)
            .timeout(self.cfg.timeout_ms as i32)
            .open()
            .map_err(|e| CaptureError::Open(e.to_string()))?;
        let filter = format!("tcp port {}", self.cfg.port);
        capture
            .filter(&filter, true)
            .map_err(|e| CaptureError::Filter(e.to_string()))?;

        *self.interface_name.lock() = Some(device_name.clone());
        self.running.store(true, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);

        let this = self.clone();
        let thread = thread::Builder::new()
            .name("hdv-capture".to_string())
            .spawn(move || this.capture_loop(capture))
            .expect("failed to spawn capture thread");
        *handle = Some(thread);

        info!(
            interface = %device_name,
            filter = %filter,
            snap_len = self.cfg.snap_len,
            promiscuous = self.cfg.promiscuous,
            "capture_started"
        );
        Ok(())
    }

    /// Signal shutdown and join the capture thread within the deadline.
    /// Idempotent: subsequent calls are no-ops.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + JOIN_DEADLINE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("capture_stopped");
            } else {
                warn!("capture_thread_did_not_stop_within_deadline");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True when the loop died on a native error rather than a stop request
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            enabled: self.cfg.enabled,
            running: self.is_running(),
            interface: self.interface_name.lock().clone(),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.stats.packets_dropped.load(Ordering::Relaxed),
            payloads_enqueued: self.stats.payloads_enqueued.load(Ordering::Relaxed),
            kernel_received: self.stats.kernel_received.load(Ordering::Relaxed),
            kernel_dropped: self.stats.kernel_dropped.load(Ordering::Relaxed),
            kernel_if_dropped: self.stats.kernel_if_dropped.load(Ordering::Relaxed),
        }
    }

    fn capture_loop(self: Arc<Self>, mut capture: Capture<Active>) {
        while self.running.load(Ordering::Relaxed) {
            match capture.next_packet() {
                Ok(packet) => {
                    let received =
                        self.stats.packets_received.fetch_add(1, Ordering::Relaxed) + 1;
                    self.handle_packet(packet.data);
                    if received % STATS_REFRESH_INTERVAL == 0 {
                        self.refresh_kernel_stats(&mut capture);
                    }
                }
                // Read timeout: nothing arrived, re-check the running flag
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        error!(error = %e, "capture_fatal");
                        self.failed.store(true, Ordering::SeqCst);
                    } else {
                        debug!(error = %e, "capture_error_during_shutdown");
                    }
                    break;
                }
            }
        }
        self.refresh_kernel_stats(&mut capture);
        self.running.store(false, Ordering::SeqCst);
    }

    fn handle_packet(&self, data: &[u8]) {
        let payload = match extract_tcp_payload(data) {
            Some(p) if !p.is_empty() => p,
            _ => return,
        };
        if self.queue.offer(payload.to_vec(), self.offer_timeout) {
            self.stats.payloads_enqueued.fetch_add(1, Ordering::Relaxed);
        } else {
            let dropped = self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                dropped_total = dropped,
                queue_size = self.queue.len(),
                "payload_dropped_queue_full"
            );
        }
    }

    fn refresh_kernel_stats(&self, capture: &mut Capture<Active>) {
        if let Ok(stat) = capture.stats() {
            self.stats
                .kernel_received
                .store(stat.received as u64, Ordering::Relaxed);
            self.stats
                .kernel_dropped
                .store(stat.dropped as u64, Ordering::Relaxed);
            self.stats
                .kernel_if_dropped
                .store(stat.if_dropped as u64, Ordering::Relaxed);
        }
    }
}

impl Drop for PacketSniffer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// TCP payload of a captured ethernet frame, when it has one
fn extract_tcp_payload(data: &[u8]) -> Option<&[u8]> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;
    match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(tcp.payload()),
        _ => None,
    }
}
