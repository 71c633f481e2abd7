//! Price domain: persistence, caching and the packet-processing service.

pub mod cache;
pub mod service;
pub mod store;

pub use cache::{CacheSnapshot, PriceCaches};
pub use service::{PacketProcessor, PriceService, ServiceError, ServiceResult};
pub use store::{PersistOutcome, PriceStore};
