//! Price service: the seam between decoded frames and the store.
//!
//! Validates extracted observations, upserts items, writes entries in one
//! transaction and invalidates the touched cache keys. Parse failures are
//! reported but recoverable; storage failures propagate to the consumer
//! where they feed the circuit breaker.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::{Item, ItemWithPrices, PriceEntry, PriceObservation};
use crate::prices::cache::PriceCaches;
use crate::prices::store::PriceStore;
use crate::protocol::{FrameParser, Message, ParseError};

/// Processing failures surfaced to the consumer (closed set)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Frame could not be decoded; the packet is dropped
    Parse(ParseError),
    /// Persistence failed; counts toward the circuit breaker
    Storage(String),
    /// Every packet in a batch failed
    BatchFailure { attempted: usize, failed: usize },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "parse error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::BatchFailure { attempted, failed } => {
                write!(f, "batch failed: {}/{} packets", failed, attempted)
            }
        }
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    /// Only persistence failures should trip the breaker; a burst of
    /// undecodable frames is expected traffic noise
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// The consumer-facing processing seam
pub trait PacketProcessor: Send + Sync {
    /// Decode one captured payload and persist its observations.
    /// Returns the number of entries persisted.
    fn process_packet(&self, payload: &[u8]) -> ServiceResult<usize>;

    /// Process a batch of payloads within one outer transaction.
    /// Partial failure is tolerated; the result is the summed count.
    fn process_batch(&self, payloads: &[Vec<u8>]) -> ServiceResult<usize>;
}

pub struct PriceService {
    parser: FrameParser,
    store: PriceStore,
    caches: Arc<PriceCaches>,
    /// How many recent entries the items-with-prices view carries
    history_limit: usize,
}

impl PriceService {
    pub fn new(parser: FrameParser, store: PriceStore, caches: Arc<PriceCaches>) -> Self {
        Self {
            parser,
            store,
            caches,
            history_limit: 100,
        }
    }

    /// Decode a payload into validated observations.
    /// `Ok(None)` means the frame decoded but carries no prices.
    fn extract(&self, payload: &[u8]) -> ServiceResult<Option<Vec<PriceObservation>>> {
        let frame = self
            .parser
            .parse(payload)
            .map_err(|failure| ServiceError::Parse(failure.kind))?;

        match &frame.message {
            Message::PriceList { .. } => {
                let raw = frame.message.observations();
                let total = raw.len();
                let valid: Vec<PriceObservation> =
                    raw.into_iter().filter(|o| o.is_valid()).collect();
                if valid.len() < total {
                    debug!(
                        dropped = total - valid.len(),
                        kept = valid.len(),
                        "observations_failed_validation"
                    );
                }
                Ok(Some(valid))
            }
            Message::CategoryDescription { object_type, description } => {
                // Side channel: keep the category table current
                if let Some(name) = description {
                    let name = name.trim();
                    if *object_type > 0 && !name.is_empty() {
                        self.store.upsert_sub_category(*object_type as i64, name)?;
                        debug!(object_type, name, "sub_category_updated");
                    }
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn persist(&self, observations: Vec<PriceObservation>) -> ServiceResult<usize> {
        if observations.is_empty() {
            return Ok(0);
        }
        let touched: HashSet<i64> = observations.iter().map(|o| o.item_gid).collect();
        let outcome = self.store.persist_observations(&observations)?;
        for gid in touched {
            self.caches.evict_item(gid);
        }
        if outcome.deduped > 0 {
            debug!(deduped = outcome.deduped, "duplicate_entries_suppressed");
        }
        Ok(outcome.persisted as usize)
    }

    /// Cache-first item lookup, creating the row on first observation.
    /// Idempotent under concurrency: the unique gid constraint serialises
    /// racing creators and both end up reading the same row.
    pub fn get_or_create_item(&self, gid: i64) -> ServiceResult<Item> {
        let store = &self.store;
        if let Some(item) = self.caches.item(gid, || store.item_by_gid(gid))? {
            return Ok(item);
        }
        Ok(store.get_or_create_item(gid)?)
    }

    pub fn latest_price(&self, gid: i64, quantity: u32) -> ServiceResult<Option<PriceEntry>> {
        let store = &self.store;
        Ok(self
            .caches
            .latest_price(gid, quantity, || store.latest_price(gid, quantity))?)
    }

    /// Uncached range read; arbitrary windows do not key usefully
    pub fn price_history(
        &self,
        gid: i64,
        quantity: u32,
        from: i64,
        to: i64,
    ) -> ServiceResult<Vec<PriceEntry>> {
        Ok(self.store.price_history(gid, quantity, from, to)?)
    }

    pub fn item_with_prices(&self, gid: i64) -> ServiceResult<Option<ItemWithPrices>> {
        let store = &self.store;
        let limit = self.history_limit;
        Ok(self
            .caches
            .item_with_prices(gid, || store.item_with_prices(gid, limit))?)
    }

    pub fn evict_item_cache(&self, gid: i64) {
        self.caches.evict_item(gid);
    }

    pub fn caches(&self) -> &Arc<PriceCaches> {
        &self.caches
    }
}

impl PacketProcessor for PriceService {
    fn process_packet(&self, payload: &[u8]) -> ServiceResult<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        match self.extract(payload)? {
            Some(observations) => self.persist(observations),
            None => Ok(0),
        }
    }

    fn process_batch(&self, payloads: &[Vec<u8>]) -> ServiceResult<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }

        let mut all = Vec::new();
        let mut failed = 0usize;
        for payload in payloads {
            if payload.is_empty() {
                continue;
            }
            match self.extract(payload) {
                Ok(Some(observations)) => all.extend(observations),
                Ok(None) => {}
                Err(ServiceError::Parse(kind)) => {
                    failed += 1;
                    debug!(kind = %kind, "batch_packet_unparseable");
                }
                Err(other) => return Err(other),
            }
        }

        if failed == payloads.len() {
            warn!(attempted = payloads.len(), "every_packet_in_batch_failed");
            return Err(ServiceError::BatchFailure {
                attempted: payloads.len(),
                failed,
            });
        }

        // One outer transaction for the whole batch
        self.persist(all)
    }
}
