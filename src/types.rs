use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A trading pair identifier such as `BTC/USDT`. Identity is string-equal;
/// splitting on `/` yields (base, quote).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn split_coin(&self) -> Option<(&str, &str)> {
        self.0.split_once('/')
    }

    pub fn base(&self) -> Option<&str> {
        self.split_coin().map(|(b, _)| b)
    }

    pub fn quote(&self) -> Option<&str> {
        self.split_coin().map(|(_, q)| q)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// One price/volume level of an order book ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Asks ascend in price; bids descend. Entries with non-positive price or
/// volume are skipped at the head rather than treated as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: Symbol,
    pub venue: String,
    pub asks: Vec<Level>,
    pub bids: Vec<Level>,
    pub received_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn is_empty_side(&self, side: Side) -> bool {
        let ladder = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        Self::first_positive(ladder).is_none()
    }

    /// Skips non-positive entries at the head and returns the first usable level.
    pub fn first_positive(ladder: &[Level]) -> Option<&Level> {
        ladder
            .iter()
            .find(|level| level.price > Decimal::ZERO && level.volume > Decimal::ZERO)
    }
}

/// `coin -> amount`. Missing keys default to zero on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceMap(pub HashMap<String, Decimal>);

impl BalanceMap {
    pub fn get(&self, coin: &str) -> Decimal {
        self.0.get(coin).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn set(&mut self, coin: &str, amount: Decimal) {
        self.0.insert(coin.to_string(), amount);
    }

    pub fn add(&mut self, coin: &str, delta: Decimal) {
        let entry = self.0.entry(coin.to_string()).or_insert(Decimal::ZERO);
        *entry += delta;
    }

    pub fn sub(&mut self, coin: &str, delta: Decimal) {
        self.add(coin, -delta);
    }
}

/// Result of a fee quote for a hypothetical or matched order.
#[derive(Debug, Clone, Copy)]
pub struct FeeQuote {
    pub amount: Decimal,
    /// Which coin the fee is charged in: either the consumed or emitted coin.
    pub fee_coin_is_quote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealEventType {
    Noop,
    Open,
    Update,
    Close,
}

impl std::fmt::Display for DealEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DealEventType::Noop => "noop",
            DealEventType::Open => "open",
            DealEventType::Update => "update",
            DealEventType::Close => "close",
        };
        write!(f, "{s}")
    }
}

/// A leg of a triangular cycle: which venue, which side, which symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub venue: String,
    pub side: Side,
    pub symbol: Symbol,
}

/// Identifies a deal slot in the cache: either a cross-venue pair or an
/// ordered triangular cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DealKey {
    Pair {
        symbol: String,
        buy_venue: String,
        sell_venue: String,
    },
    Trio(Vec<(String, String, String)>),
}

impl DealKey {
    pub fn cache_key(&self) -> String {
        match self {
            DealKey::Pair {
                symbol,
                buy_venue,
                sell_venue,
            } => format!("deal/{symbol}/{buy_venue}/{sell_venue}"),
            DealKey::Trio(legs) => {
                let joined = legs
                    .iter()
                    .map(|(venue, side, symbol)| format!("{venue}_{side}_{symbol}"))
                    .collect::<Vec<_>>()
                    .join("|");
                format!("trio_deal/{joined}")
            }
        }
    }
}

/// Persisted deal state, stored in the cache and compared against on every
/// tick to derive the next event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealState {
    pub ts: DateTime<Utc>,
    pub ts_open: DateTime<Utc>,
    pub ts_close: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub event_type: DealEventType,
    pub threshold: bool,
    pub profit: Decimal,
    pub profit_coin: String,
    pub profit_percentage: Decimal,
    pub message: Option<String>,
}

impl DealState {
    /// The sentinel record returned when nothing is cached yet for a key.
    pub fn sentinel(now: DateTime<Utc>) -> Self {
        DealState {
            ts: now,
            ts_open: now,
            ts_close: None,
            event_type: DealEventType::Noop,
            threshold: false,
            profit: Decimal::ZERO,
            profit_coin: String::new(),
            profit_percentage: Decimal::ZERO,
            message: None,
        }
    }
}
