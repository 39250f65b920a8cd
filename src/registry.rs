use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::retry::exponential_backoff;
use crate::types::{FeeQuote, OrderBookSnapshot, Side, Symbol};

/// Venue-supplied order type, used only to select a fee schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

/// The capability surface every venue client exposes. Mirrors the shape a
/// real client library (ccxt-like) presents: market metadata, order book
/// access under one of three delivery modes, fee calculation, and balance
/// and transfer operations for the interactive command surface.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn id(&self) -> &str;

    fn is_authenticated(&self) -> bool;

    async fn load_markets(&self) -> Result<Vec<Symbol>>;

    async fn fetch_order_book(&self, symbol: &Symbol) -> Result<OrderBookSnapshot>;

    async fn watch_order_book_for_symbols(
        &self,
        symbols: &[Symbol],
    ) -> Result<Vec<OrderBookSnapshot>>;

    async fn fetch_order_books(&self) -> Result<Vec<OrderBookSnapshot>>;

    /// Pure, synchronous fee lookup; never performs I/O. Matching Engine
    /// calls this twice per match step.
    fn calculate_fee(
        &self,
        symbol: &Symbol,
        order_type: OrderType,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> FeeQuote;

    async fn fetch_balance(&self) -> Result<HashMap<String, Decimal>>;

    async fn create_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<()>;

    async fn fetch_deposit_address(&self, coin: &str) -> Result<String>;

    async fn withdraw(&self, coin: &str, amount: Decimal, address: &str) -> Result<()>;
}

/// The ten credential fields read per venue family, per the env var schema
/// `{VENUE_FAMILY}_{FIELD}`.
const CREDENTIAL_FIELDS: [&str; 10] = [
    "apiKey",
    "secret",
    "uid",
    "accountId",
    "login",
    "password",
    "twofa",
    "privateKey",
    "walletAddress",
    "token",
];

#[derive(Debug, Clone, Default)]
pub struct Credentials(pub HashMap<String, String>);

/// Folds a venue id to the credential family that owns its environment
/// variables: a `*futures` suffix maps to the spot family, and a handful of
/// named exchange variants share their parent's credentials.
pub fn credential_family(venue_id: &str) -> String {
    let lower = venue_id.to_ascii_lowercase();
    match lower.as_str() {
        "coinbaseexchange" | "coinbaseinternational" => "coinbase".to_string(),
        "binanceusdm" | "binancecoinm" => "binance".to_string(),
        other => other.strip_suffix("futures").unwrap_or(other).to_string(),
    }
}

/// Reads credentials for a venue from the environment. Returns `None` when
/// no field is present for that family, so the venue is treated as
/// unauthenticated rather than erroring.
pub fn read_credentials(venue_id: &str) -> Option<Credentials> {
    let family = credential_family(venue_id);
    let mut found = HashMap::new();
    for field in CREDENTIAL_FIELDS {
        let var = format!("{}_{}", family.to_ascii_uppercase(), field.to_ascii_uppercase());
        if let Ok(value) = std::env::var(&var) {
            found.insert(field.to_string(), value.replace("\\n", "\n"));
        }
    }
    if found.is_empty() {
        None
    } else {
        Some(Credentials(found))
    }
}

/// Constructor hook supplied by callers: given a venue id and optional
/// credentials, build a concrete `VenueClient`. Kept as a function pointer
/// rather than a trait so tests can substitute a fake client cheaply.
pub type ClientFactory = fn(&str, Option<Credentials>) -> Arc<dyn VenueClient>;

/// Owns venue clients, serializes setup, and exposes pure queries over the
/// configured and initialized venue sets. Setup is idempotent: concurrent
/// calls for the same venue id return the same client.
pub struct VenueRegistry {
    factory: ClientFactory,
    clients: RwLock<HashMap<String, Arc<dyn VenueClient>>>,
    configured_ids: Vec<String>,
}

impl VenueRegistry {
    pub fn new(configured_ids: Vec<String>, factory: ClientFactory) -> Self {
        VenueRegistry {
            factory,
            clients: RwLock::new(HashMap::new()),
            configured_ids,
        }
    }

    pub fn available_ids(&self) -> &[String] {
        &self.configured_ids
    }

    pub async fn authenticated_ids(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|c| c.is_authenticated())
            .map(|c| c.id().to_string())
            .collect()
    }

    pub async fn exchange(&self, id: &str) -> Option<Arc<dyn VenueClient>> {
        self.clients.read().await.get(id).cloned()
    }

    /// Builds the client (if missing), loads its markets under the shared
    /// retry schedule, and registers it. Returns the existing client without
    /// re-running setup if called again for the same id.
    pub async fn setup(&self, venue_id: &str) -> Result<Arc<dyn VenueClient>> {
        if let Some(existing) = self.exchange(venue_id).await {
            return Ok(existing);
        }

        let credentials = read_credentials(venue_id);
        let authenticated = credentials.is_some();
        let client = (self.factory)(venue_id, credentials);
        if authenticated {
            debug!("{venue_id} logged in");
        }

        exponential_backoff(&format!("load_markets:{venue_id}"), || {
            let client = client.clone();
            async move { client.load_markets().await.map(|_| ()) }
        })
        .await?;
        info!("{venue_id} loaded markets");

        self.clients
            .write()
            .await
            .insert(venue_id.to_string(), client.clone());
        Ok(client)
    }

    pub async fn close_all(&self) {
        self.clients.write().await.clear();
    }
}

pub fn not_authenticated(venue_id: &str) -> EngineError {
    EngineError::NotAuthenticated {
        venue: venue_id.to_string(),
    }
}
