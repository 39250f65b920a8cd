use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use rust_decimal::Decimal;

use crate::error::{EngineError, Result};
use crate::types::{DealState, OrderBookSnapshot};

/// Typed façade over an expiring key/value store. Both a remote (redis) and
/// an in-memory implementation are provided; every component that touches
/// shared state depends on this trait rather than a concrete backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_order_book(&self, symbol: &str, venue: &str) -> Result<Option<OrderBookSnapshot>>;
    async fn set_order_book(
        &self,
        symbol: &str,
        venue: &str,
        snapshot: &OrderBookSnapshot,
        ttl: Duration,
    ) -> Result<()>;

    async fn get_deal(&self, key: &str) -> Result<DealState>;
    async fn set_deal(&self, key: &str, state: &DealState, ttl: Duration) -> Result<()>;

    async fn get_balance(&self, coin: &str) -> Result<Decimal>;
    async fn set_balance(&self, coin: &str, amount: Decimal) -> Result<()>;

    async fn get_last_update_id(&self) -> Result<Option<i64>>;
    async fn set_last_update_id(&self, value: i64) -> Result<()>;
}

fn order_book_key(symbol: &str, venue: &str) -> String {
    format!("order_book/{symbol}/{venue}")
}

/// Redis-backed cache, matching the key schema and TTL semantics of the
/// system this engine is based on.
pub struct RedisCacheStore {
    client: redis::Client,
}

impl RedisCacheStore {
    pub fn new(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|err| EngineError::Cache(err.to_string()))?;
        Ok(RedisCacheStore { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get_order_book(&self, symbol: &str, venue: &str) -> Result<Option<OrderBookSnapshot>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(order_book_key(symbol, venue))
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        raw.map(|s| serde_json::from_str(&s).map_err(|err| EngineError::Cache(err.to_string())))
            .transpose()
    }

    async fn set_order_book(
        &self,
        symbol: &str,
        venue: &str,
        snapshot: &OrderBookSnapshot,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let raw = serde_json::to_string(snapshot).map_err(|err| EngineError::Cache(err.to_string()))?;
        let _: () = conn
            .set_ex(order_book_key(symbol, venue), raw, ttl.as_secs())
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        Ok(())
    }

    async fn get_deal(&self, key: &str) -> Result<DealState> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        match raw {
            Some(s) => serde_json::from_str(&s).map_err(|err| EngineError::Cache(err.to_string())),
            None => Ok(DealState::sentinel(Utc::now())),
        }
    }

    async fn set_deal(&self, key: &str, state: &DealState, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let raw = serde_json::to_string(state).map_err(|err| EngineError::Cache(err.to_string()))?;
        let _: () = conn
            .set_ex(key, raw, ttl.as_secs())
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        Ok(())
    }

    async fn get_balance(&self, coin: &str) -> Result<Decimal> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(format!("balance/{coin}"))
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        Ok(raw
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO))
    }

    async fn set_balance(&self, coin: &str, amount: Decimal) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set(format!("balance/{coin}"), amount.to_string())
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        Ok(())
    }

    async fn get_last_update_id(&self) -> Result<Option<i64>> {
        let mut conn = self.conn().await?;
        conn.get("bot/last_update_id")
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))
    }

    async fn set_last_update_id(&self, value: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set("bot/last_update_id", value)
            .await
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        Ok(())
    }
}

/// In-memory fake used by tests and by the Deal Controller's own unit
/// tests. Tracks an expiry instant per entry so TTL semantics match the
/// redis-backed implementation instead of living forever.
#[derive(Default)]
pub struct MemoryCacheStore {
    order_books: Mutex<HashMap<String, (OrderBookSnapshot, Instant)>>,
    deals: Mutex<HashMap<String, (DealState, Instant)>>,
    balances: Mutex<HashMap<String, Decimal>>,
    last_update_id: Mutex<Option<i64>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expired(expires_at: Instant) -> bool {
    Instant::now() >= expires_at
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get_order_book(&self, symbol: &str, venue: &str) -> Result<Option<OrderBookSnapshot>> {
        let mut guard = self.order_books.lock().unwrap();
        let key = order_book_key(symbol, venue);
        match guard.get(&key) {
            Some((_, expires_at)) if expired(*expires_at) => {
                guard.remove(&key);
                Ok(None)
            }
            Some((snapshot, _)) => Ok(Some(snapshot.clone())),
            None => Ok(None),
        }
    }

    async fn set_order_book(
        &self,
        symbol: &str,
        venue: &str,
        snapshot: &OrderBookSnapshot,
        ttl: Duration,
    ) -> Result<()> {
        self.order_books.lock().unwrap().insert(
            order_book_key(symbol, venue),
            (snapshot.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get_deal(&self, key: &str) -> Result<DealState> {
        let mut guard = self.deals.lock().unwrap();
        match guard.get(key) {
            Some((_, expires_at)) if expired(*expires_at) => {
                guard.remove(key);
                Ok(DealState::sentinel(Utc::now()))
            }
            Some((state, _)) => Ok(state.clone()),
            None => Ok(DealState::sentinel(Utc::now())),
        }
    }

    async fn set_deal(&self, key: &str, state: &DealState, ttl: Duration) -> Result<()> {
        self.deals
            .lock()
            .unwrap()
            .insert(key.to_string(), (state.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get_balance(&self, coin: &str) -> Result<Decimal> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(coin)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn set_balance(&self, coin: &str, amount: Decimal) -> Result<()> {
        self.balances
            .lock()
            .unwrap()
            .insert(coin.to_string(), amount);
        Ok(())
    }

    async fn get_last_update_id(&self) -> Result<Option<i64>> {
        Ok(*self.last_update_id.lock().unwrap())
    }

    async fn set_last_update_id(&self, value: i64) -> Result<()> {
        *self.last_update_id.lock().unwrap() = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;

    fn snapshot() -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: Symbol::new("BTC/USDT"),
            venue: "binance".to_string(),
            asks: vec![],
            bids: vec![],
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn order_book_round_trip() {
        let store = MemoryCacheStore::new();
        store
            .set_order_book("BTC/USDT", "binance", &snapshot(), Duration::from_secs(60))
            .await
            .unwrap();
        let got = store
            .get_order_book("BTC/USDT", "binance")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.venue, "binance");
    }

    #[tokio::test]
    async fn missing_deal_returns_sentinel() {
        let store = MemoryCacheStore::new();
        let deal = store.get_deal("BTC/USDT/a/b").await.unwrap();
        assert!(!deal.threshold);
        assert_eq!(deal.event_type, crate::types::DealEventType::Noop);
    }

    #[tokio::test]
    async fn balance_defaults_to_zero() {
        let store = MemoryCacheStore::new();
        assert_eq!(store.get_balance("USDT").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn order_book_expires_after_ttl() {
        let store = MemoryCacheStore::new();
        store
            .set_order_book("BTC/USDT", "binance", &snapshot(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store
            .get_order_book("BTC/USDT", "binance")
            .await
            .unwrap()
            .is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .get_order_book("BTC/USDT", "binance")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn deal_expires_after_ttl() {
        let store = MemoryCacheStore::new();
        let mut state = DealState::sentinel(Utc::now());
        state.threshold = true;
        store
            .set_deal("BTC/USDT/a/b", &state, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.get_deal("BTC/USDT/a/b").await.unwrap().threshold);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.get_deal("BTC/USDT/a/b").await.unwrap().threshold);
    }
}
