use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stack sizes the auction house lists prices for
pub const QUANTITY_TIERS: [u32; 3] = [1, 10, 100];

/// A single price point extracted from a decoded frame, not yet persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceObservation {
    pub item_gid: i64,
    pub category: u32,
    pub quantity: u32,
    pub price: i64,
    pub observed_at: DateTime<Utc>,
}

impl PriceObservation {
    pub fn new(item_gid: i64, category: u32, quantity: u32, price: i64) -> Self {
        Self {
            item_gid,
            category,
            quantity,
            price,
            observed_at: Utc::now(),
        }
    }

    /// Persistence gate: positive gid, positive price, known quantity tier
    pub fn is_valid(&self) -> bool {
        self.item_gid > 0 && self.price > 0 && QUANTITY_TIERS.contains(&self.quantity)
    }
}

/// A catalogue item, created on first observation of its gid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub item_gid: i64,
    pub item_name: Option<String>,
    pub sub_category_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Item {
    /// Name shown until real metadata arrives
    pub fn placeholder_name(gid: i64) -> String {
        format!("Item #{}", gid)
    }

    pub fn display_name(&self) -> String {
        self.item_name
            .clone()
            .unwrap_or_else(|| Self::placeholder_name(self.item_gid))
    }
}

/// One persisted price point for an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEntry {
    pub id: i64,
    pub item_id: i64,
    pub price: i64,
    pub quantity: u32,
    pub server_timestamp: Option<i64>,
    pub created_at: i64,
}

/// Auction-house category, populated from category description messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubCategory {
    pub id: i64,
    pub dofus_id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An item together with its recent price history (the cached read shape)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemWithPrices {
    pub item: Item,
    pub entries: Vec<PriceEntry>,
}
