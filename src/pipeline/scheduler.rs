//! Fixed-delay processing loop and the on-demand drain worker pool.
//!
//! One named thread drives the consumer on a configurable cadence. Ticks
//! never overlap: the next delay starts only after the previous tick
//! finished. Expensive full drains are handed to a small fixed pool; when
//! the pool is saturated the caller runs the job inline instead of queueing
//! unboundedly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProcessingConfig;
use crate::pipeline::consumer::{ConsumeError, PacketConsumer};
use crate::pipeline::queue::PacketQueue;

// =============================================================================
// WORKER POOL
// =============================================================================

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size pool with caller-runs backpressure
pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        // Shallow job buffer: saturation should surface quickly
        let (tx, rx) = bounded::<Job>(workers * 2);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("hdv-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        }
    }

    /// Run `job` on the pool, or inline when the pool is saturated or
    /// already shut down
    pub fn execute(&self, job: Job) {
        let sender = self.tx.lock().clone();
        match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                    debug!("worker_pool_saturated_caller_runs");
                    job();
                }
            },
            None => job(),
        }
    }

    /// Stop accepting work and join the workers
    pub fn shutdown(&self) {
        self.tx.lock().take();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// PROCESSING LOOP
// =============================================================================

pub struct ProcessingLoop {
    queue: Arc<PacketQueue>,
    consumer: Arc<PacketConsumer>,
    cfg: ProcessingConfig,
    workers: WorkerPool,
    running: AtomicBool,
    ticks: AtomicU64,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingLoop {
    pub fn new(
        queue: Arc<PacketQueue>,
        consumer: Arc<PacketConsumer>,
        cfg: ProcessingConfig,
    ) -> Arc<Self> {
        let workers = WorkerPool::new(cfg.drain_workers);
        Arc::new(Self {
            queue,
            consumer,
            cfg,
            workers,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            thread_handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if !self.cfg.enabled {
            info!("processing_disabled");
            return;
        }
        let mut handle = self.thread_handle.lock();
        if handle.is_some() {
            warn!("processing_loop_already_running");
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let this = self.clone();
        let thread = thread::Builder::new()
            .name("hdv-processor".to_string())
            .spawn(move || this.run())
            .expect("failed to spawn processing thread");
        *handle = Some(thread);
        info!(
            interval_ms = self.cfg.interval_ms,
            batch_mode = self.cfg.batch_mode,
            "processing_loop_started"
        );
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
        self.workers.shutdown();
        info!(ticks = self.ticks.load(Ordering::Relaxed), "processing_loop_stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fixed-delay loop: the delay starts after the tick completes, so
    /// ticks never overlap
    fn run(self: Arc<Self>) {
        let interval = Duration::from_millis(self.cfg.interval_ms);
        while self.running.load(Ordering::Relaxed) {
            self.tick();
            self.sleep_interruptibly(interval);
        }
    }

    /// One scheduler tick, also directly invocable from tests
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let depth = self.queue.len();
        if depth > self.cfg.queue_warn_threshold {
            warn!(
                depth,
                threshold = self.cfg.queue_warn_threshold,
                "queue_depth_above_threshold"
            );
        }
        if depth == 0 {
            return;
        }

        let result = if self.cfg.batch_mode {
            self.consumer.consume_batch()
        } else {
            self.consumer.consume_one().map(|processed| processed as usize)
        };

        match result {
            Ok(0) => {}
            Ok(persisted) => {
                debug!(persisted, queue_depth = self.queue.len(), "tick_progress");
            }
            Err(ConsumeError::CircuitOpen) => {
                debug!("tick_skipped_circuit_open");
            }
            Err(e) => {
                warn!(error = %e, "tick_processing_failed");
            }
        }
    }

    /// Hand a full drain to the worker pool so the scheduler thread is not
    /// blocked behind it
    pub fn spawn_drain(self: &Arc<Self>) {
        let consumer = self.consumer.clone();
        self.workers.execute(Box::new(move || match consumer.drain() {
            Ok(0) => {}
            Ok(persisted) => info!(persisted, "drain_complete"),
            Err(e) => warn!(error = %e, "drain_failed"),
        }));
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let chunk = Duration::from_millis(50);
        let mut remaining = total;
        while !remaining.is_zero() && self.running.load(Ordering::Relaxed) {
            let step = remaining.min(chunk);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

impl Drop for ProcessingLoop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::prices::{PacketProcessor, ServiceError, ServiceResult};
    use std::sync::atomic::AtomicUsize;

    struct CountingProcessor {
        packets: AtomicUsize,
    }

    impl CountingProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self { packets: AtomicUsize::new(0) })
        }
    }

    impl PacketProcessor for CountingProcessor {
        fn process_packet(&self, _payload: &[u8]) -> ServiceResult<usize> {
            self.packets.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }

        fn process_batch(&self, payloads: &[Vec<u8>]) -> ServiceResult<usize> {
            self.packets.fetch_add(payloads.len(), Ordering::SeqCst);
            Ok(payloads.len())
        }
    }

    struct FailingProcessor;

    impl PacketProcessor for FailingProcessor {
        fn process_packet(&self, _payload: &[u8]) -> ServiceResult<usize> {
            Err(ServiceError::Storage("disk full".into()))
        }

        fn process_batch(&self, _payloads: &[Vec<u8>]) -> ServiceResult<usize> {
            Err(ServiceError::Storage("disk full".into()))
        }
    }

    fn consumer_cfg() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 10,
            poll_timeout_ms: 20,
            breaker_threshold: 5,
            breaker_cooldown_ms: 60_000,
        }
    }

    fn processing_cfg(interval_ms: u64) -> ProcessingConfig {
        ProcessingConfig {
            enabled: true,
            interval_ms,
            batch_mode: true,
            queue_warn_threshold: 500,
            drain_workers: 2,
        }
    }

    #[test]
    fn test_tick_skips_empty_queue() {
        let queue = Arc::new(PacketQueue::new(10));
        let processor = CountingProcessor::new();
        let consumer = Arc::new(PacketConsumer::new(queue.clone(), processor.clone(), consumer_cfg()));
        let looper = ProcessingLoop::new(queue, consumer, processing_cfg(1_000));

        looper.tick();
        assert_eq!(processor.packets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tick_consumes_batch() {
        let queue = Arc::new(PacketQueue::new(100));
        for i in 0..15u8 {
            queue.try_offer(vec![i]);
        }
        let processor = CountingProcessor::new();
        let consumer = Arc::new(PacketConsumer::new(queue.clone(), processor.clone(), consumer_cfg()));
        let looper = ProcessingLoop::new(queue.clone(), consumer, processing_cfg(1_000));

        looper.tick();
        assert_eq!(processor.packets.load(Ordering::SeqCst), 10);
        looper.tick();
        assert_eq!(processor.packets.load(Ordering::SeqCst), 15);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tick_survives_circuit_open() {
        let queue = Arc::new(PacketQueue::new(100));
        for i in 0..80u8 {
            queue.try_offer(vec![i]);
        }
        let consumer = Arc::new(PacketConsumer::new(queue.clone(), Arc::new(FailingProcessor), consumer_cfg()));
        let looper = ProcessingLoop::new(queue, consumer.clone(), processing_cfg(1_000));

        // Five failing ticks open the breaker; further ticks are skipped
        for _ in 0..8 {
            looper.tick();
        }
        assert_eq!(consumer.snapshot().errors, 5);
    }

    #[test]
    fn test_loop_runs_on_cadence() {
        let queue = Arc::new(PacketQueue::new(100));
        let processor = CountingProcessor::new();
        let consumer = Arc::new(PacketConsumer::new(queue.clone(), processor.clone(), consumer_cfg()));
        let looper = ProcessingLoop::new(queue.clone(), consumer, processing_cfg(10));

        looper.start();
        for i in 0..5u8 {
            queue.try_offer(vec![i]);
        }
        std::thread::sleep(Duration::from_millis(300));
        looper.stop();

        assert_eq!(processor.packets.load(Ordering::SeqCst), 5);
        assert!(!looper.is_running());
    }

    #[test]
    fn test_spawn_drain_empties_queue() {
        let queue = Arc::new(PacketQueue::new(100));
        for i in 0..30u8 {
            queue.try_offer(vec![i]);
        }
        let processor = CountingProcessor::new();
        let consumer = Arc::new(PacketConsumer::new(queue.clone(), processor.clone(), consumer_cfg()));
        let looper = ProcessingLoop::new(queue.clone(), consumer, processing_cfg(1_000));

        looper.spawn_drain();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !queue.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(queue.is_empty());
        looper.stop();
    }

    #[test]
    fn test_worker_pool_caller_runs_when_saturated() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(AtomicBool::new(false));
        let blocker = |gate: Arc<AtomicBool>| {
            Box::new(move || {
                let start = std::time::Instant::now();
                while !gate.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(2) {
                    thread::sleep(Duration::from_millis(5));
                }
            }) as Job
        };

        // Occupy the single worker, then fill the 2-slot job buffer
        pool.execute(blocker(gate.clone()));
        thread::sleep(Duration::from_millis(50));
        pool.execute(blocker(gate.clone()));
        pool.execute(blocker(gate.clone()));

        // Pool saturated: this job must run inline on the caller thread
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        {
            let ran_on = ran_on.clone();
            pool.execute(Box::new(move || {
                *ran_on.lock() = Some(thread::current().id());
            }));
        }
        assert_eq!(*ran_on.lock(), Some(caller));

        gate.store(true, Ordering::SeqCst);
        pool.shutdown();
    }

    #[test]
    fn test_disabled_loop_does_not_start() {
        let queue = Arc::new(PacketQueue::new(10));
        let consumer = Arc::new(PacketConsumer::new(queue.clone(), CountingProcessor::new(), consumer_cfg()));
        let mut cfg = processing_cfg(10);
        cfg.enabled = false;
        let looper = ProcessingLoop::new(queue, consumer, cfg);
        looper.start();
        assert!(!looper.is_running());
        looper.stop();
    }
}
