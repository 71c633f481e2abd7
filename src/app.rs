//! Pipeline composition root.
//!
//! Wires store, caches, parser, queue, consumer, scheduler and sniffer
//! together from the parsed configuration. `start` and `stop` bracket every
//! spawned thread and open handle; no component reaches for global state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::capture::PacketSniffer;
use crate::config::Config;
use crate::health::HealthReport;
use crate::pipeline::{PacketConsumer, PacketQueue, ProcessingLoop};
use crate::prices::{PacketProcessor, PriceCaches, PriceService, PriceStore};
use crate::protocol::FrameParser;

pub struct Pipeline {
    queue: Arc<PacketQueue>,
    sniffer: Arc<PacketSniffer>,
    consumer: Arc<PacketConsumer>,
    service: Arc<PriceService>,
    processing: Arc<ProcessingLoop>,
    caches: Arc<PriceCaches>,
}

impl Pipeline {
    pub fn new(config: &Config) -> Result<Self> {
        let store = PriceStore::open(&config.storage.path, config.storage.dedup_window_secs)
            .with_context(|| format!("open price store at {}", config.storage.path))?;
        let caches = Arc::new(PriceCaches::new(&config.cache));
        let parser = FrameParser::new(config.protocol.clone());
        let service = Arc::new(PriceService::new(parser, store, caches.clone()));

        let queue = Arc::new(PacketQueue::new(config.queue.capacity));
        let processor: Arc<dyn PacketProcessor> = service.clone();
        let consumer = Arc::new(PacketConsumer::new(
            queue.clone(),
            processor,
            config.consumer.clone(),
        ));
        let processing = ProcessingLoop::new(queue.clone(), consumer.clone(), config.processing.clone());
        let sniffer = PacketSniffer::new(
            config.capture.clone(),
            queue.clone(),
            Duration::from_millis(config.queue.offer_timeout_ms),
        );

        Ok(Self {
            queue,
            sniffer,
            consumer,
            service,
            processing,
            caches,
        })
    }

    /// Spawn the processing loop, then open the capture handle. Capture
    /// starts last so nothing is sniffed before a consumer exists.
    pub fn start(&self) -> Result<()> {
        self.processing.start();
        self.sniffer
            .start()
            .context("start packet capture")?;
        info!("pipeline_started");
        Ok(())
    }

    /// Stop capture, drain what the queue still holds, stop processing.
    /// Idempotent.
    pub fn stop(&self) {
        self.sniffer.stop();
        match self.consumer.drain() {
            Ok(0) => {}
            Ok(persisted) => info!(persisted, "final_drain_complete"),
            Err(e) => info!(error = %e, "final_drain_incomplete"),
        }
        self.processing.stop();

        let consumer = self.consumer.snapshot();
        info!(
            packets_processed = consumer.packets_processed,
            entries_persisted = consumer.entries_persisted,
            errors = consumer.errors,
            "pipeline_stopped"
        );
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::evaluate(
            self.sniffer.snapshot(),
            self.queue.snapshot(),
            self.consumer.snapshot(),
            self.caches.snapshots(),
        )
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub fn service(&self) -> &Arc<PriceService> {
        &self.service
    }

    pub fn processing(&self) -> &Arc<ProcessingLoop> {
        &self.processing
    }

    /// Capture died on a native error; health is DOWN until restart
    pub fn capture_failed(&self) -> bool {
        self.sniffer.has_failed()
    }
}
