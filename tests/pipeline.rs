//! End-to-end pipeline test: wire frames pushed through the bounded queue
//! are decoded by the processing loop and land in the SQLite store, with
//! capture echoes suppressed and health reflecting pipeline state.

use std::time::{Duration, Instant};

use hdv_watcher::config::{Config, ProtocolConfig};
use hdv_watcher::health::HealthStatus;
use hdv_watcher::Pipeline;

// Wire-frame builders mirroring the protocol encoding rules

fn var_int(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            return out;
        }
    }
}

fn frame(message_id: u16, payload: &[u8]) -> Vec<u8> {
    let len_width: u16 = match payload.len() {
        0 => 0,
        1..=0xFF => 1,
        _ => 2,
    };
    let header = (message_id << 2) | len_width;
    let mut out = header.to_be_bytes().to_vec();
    match len_width {
        0 => {}
        1 => out.push(payload.len() as u8),
        _ => out.extend_from_slice(&(payload.len() as u16).to_be_bytes()),
    }
    out.extend_from_slice(payload);
    out
}

fn price_frame(items: &[(u32, u32, &[u64])]) -> Vec<u8> {
    let mut payload = var_int(items.len() as u64);
    for (gid, category, prices) in items {
        payload.extend(var_int(*gid as u64));
        payload.extend(var_int(*category as u64));
        payload.extend(var_int(prices.len() as u64));
        for price in *prices {
            payload.extend(var_int(*price));
        }
    }
    frame(ProtocolConfig::default().price_list_id, &payload)
}

fn container_frame(inner: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(inner).unwrap();
    let compressed = enc.finish().unwrap();

    let mut payload = var_int(compressed.len() as u64);
    payload.extend_from_slice(&compressed);
    frame(ProtocolConfig::default().compressed_container_id, &payload)
}

fn test_config(db_dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.capture.enabled = false;
    config.storage.path = db_dir
        .path()
        .join("prices.db")
        .to_str()
        .unwrap()
        .to_string();
    config.processing.interval_ms = 10;
    config.consumer.poll_timeout_ms = 20;
    config
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn frames_flow_from_queue_to_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let pipeline = Pipeline::new(&config).unwrap();
    pipeline.start().unwrap();

    assert!(pipeline
        .queue()
        .try_offer(price_frame(&[(289, 48, &[15_000, 140_000, 1_300_000])])));

    let service = pipeline.service().clone();
    assert!(wait_until(Duration::from_secs(3), || {
        service.latest_price(289, 1).unwrap().is_some()
    }));

    assert_eq!(service.latest_price(289, 1).unwrap().unwrap().price, 15_000);
    assert_eq!(service.latest_price(289, 10).unwrap().unwrap().price, 140_000);
    assert_eq!(service.latest_price(289, 100).unwrap().unwrap().price, 1_300_000);

    let item = service.get_or_create_item(289).unwrap();
    assert_eq!(item.item_name.as_deref(), Some("Item #289"));

    pipeline.stop();
}

#[test]
fn repeated_capture_of_same_view_is_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let pipeline = Pipeline::new(&config).unwrap();
    pipeline.start().unwrap();

    // The same auction-house view captured three times in quick succession
    for _ in 0..3 {
        assert!(pipeline.queue().try_offer(price_frame(&[(77, 2, &[500])])));
    }

    let service = pipeline.service().clone();
    assert!(wait_until(Duration::from_secs(3), || {
        service.latest_price(77, 1).unwrap().is_some()
    }));
    pipeline.stop();

    let view = service.item_with_prices(77).unwrap().unwrap();
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].price, 500);
}

#[test]
fn compressed_container_reaches_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let pipeline = Pipeline::new(&config).unwrap();
    pipeline.start().unwrap();

    let inner = price_frame(&[(42, 7, &[123, 0, 456_789])]);
    assert!(pipeline.queue().try_offer(container_frame(&inner)));

    let service = pipeline.service().clone();
    assert!(wait_until(Duration::from_secs(3), || {
        service.latest_price(42, 1).unwrap().is_some()
    }));
    pipeline.stop();

    assert_eq!(service.latest_price(42, 1).unwrap().unwrap().price, 123);
    assert!(service.latest_price(42, 10).unwrap().is_none());
    assert_eq!(service.latest_price(42, 100).unwrap().unwrap().price, 456_789);
}

#[test]
fn garbage_frames_do_not_stall_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let pipeline = Pipeline::new(&config).unwrap();
    pipeline.start().unwrap();

    // Undecodable noise, then a valid frame behind it
    pipeline.queue().try_offer(vec![0xFF]);
    pipeline.queue().try_offer(vec![0x80, 0x80, 0x80]);
    pipeline.queue().try_offer(price_frame(&[(5, 1, &[9_999])]));

    let service = pipeline.service().clone();
    assert!(wait_until(Duration::from_secs(3), || {
        service.latest_price(5, 1).unwrap().is_some()
    }));
    pipeline.stop();

    let health = pipeline.health();
    // Capture is disabled, queue drained: the pipeline is healthy
    assert_eq!(health.status, HealthStatus::Up);
    assert_eq!(health.consumer.circuit_state.as_str(), "closed");
}

#[test]
fn health_reports_queue_and_consumer_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.processing.enabled = false;
    let pipeline = Pipeline::new(&config).unwrap();
    pipeline.start().unwrap();

    for i in 0..5u8 {
        pipeline.queue().try_offer(vec![i]);
    }
    let health = pipeline.health();
    assert_eq!(health.queue.stats.size, 5);
    assert_eq!(health.consumer.packets_processed, 0);
    // Disabled capture never drags the status down
    assert_eq!(health.capture.status, HealthStatus::Up);

    pipeline.stop();
    // stop() drains what was left in the queue
    assert!(pipeline.queue().is_empty());
}
