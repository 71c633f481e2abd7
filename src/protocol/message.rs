//! Decoded message model for the auction-house protocol.

use chrono::{DateTime, Utc};

use crate::models::{PriceObservation, QUANTITY_TIERS};

/// Prices for one item as listed on the auction house.
///
/// `prices[i]` is the cheapest offer for a stack of `10^i` units; a zero
/// means no offer at that tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPriceListing {
    pub gid: u32,
    pub category: u32,
    pub prices: Vec<u64>,
}

impl ItemPriceListing {
    /// Expand the listing into one observation per non-zero price tier.
    /// Tiers beyond the third are listed by no known client and are ignored.
    pub fn observations(&self, observed_at: DateTime<Utc>) -> Vec<PriceObservation> {
        self.prices
            .iter()
            .take(QUANTITY_TIERS.len())
            .enumerate()
            .filter(|(_, &price)| price > 0)
            .map(|(i, &price)| PriceObservation {
                item_gid: self.gid as i64,
                category: self.category,
                quantity: QUANTITY_TIERS[i],
                price: price as i64,
                observed_at,
            })
            .collect()
    }
}

/// A parsed protocol payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Item price listings for the auction-house view the client opened
    PriceList {
        items: Vec<ItemPriceListing>,
        received_at: DateTime<Utc>,
    },
    /// Describes an exchange category (object type + optional label)
    CategoryDescription {
        object_type: u32,
        description: Option<String>,
    },
    /// zlib-wrapped inner message that failed to decode; kept compressed
    CompressedContainer { payload: Vec<u8> },
    /// Message id outside the dispatch table; payload retained as-is
    Unknown { message_id: u16, payload: Vec<u8> },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PriceList { .. } => "price_list",
            Self::CategoryDescription { .. } => "category_description",
            Self::CompressedContainer { .. } => "compressed_container",
            Self::Unknown { .. } => "unknown",
        }
    }

    #[inline]
    pub fn is_price_list(&self) -> bool {
        matches!(self, Self::PriceList { .. })
    }

    /// Observations carried by this message (empty unless it is a price list)
    pub fn observations(&self) -> Vec<PriceObservation> {
        match self {
            Self::PriceList { items, received_at } => items
                .iter()
                .flat_map(|item| item.observations(*received_at))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A successfully framed message plus decode metadata
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub message_id: u16,
    pub raw_len: usize,
    pub parsed_at: DateTime<Utc>,
    pub message: Message,
}
