mod cache;
mod config;
mod deal;
mod error;
mod ingestion;
mod matching;
mod notify;
mod registry;
mod retry;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use cache::{CacheStore, RedisCacheStore};
use config::{parse_mode, trio_legs, Config, Role};
use deal::eligible_trios;
use ingestion::{derive_plans, run_plan};
use notify::{run_dispatcher, Deliverer, OutboundMessage, OutboundQueue};
use registry::VenueRegistry;
use types::Symbol;

struct LoggingDeliverer;

#[async_trait::async_trait]
impl Deliverer for LoggingDeliverer {
    async fn deliver(&self, message: &OutboundMessage) -> error::Result<Option<Duration>> {
        log::info!("notify: {}", message.text);
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("arb-engine starting");

    let parameters_path = std::env::var("PARAMETERS_FILE")
        .unwrap_or_else(|_| "config/parameters.json".to_string());
    let config = Config::load(&PathBuf::from(parameters_path))?;
    log::info!(
        "role={:?} symbols={} expire_book_orders={}s expire_deal_events={}s",
        match config.role {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        },
        config.symbols.len(),
        config.expire_book_orders,
        config.expire_deal_events,
    );

    let cache: Arc<dyn CacheStore> = Arc::new(RedisCacheStore::new(&config.cache_endpoint)?);
    let outbound = Arc::new(OutboundQueue::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let venue_ids: Vec<String> = config.parameters.exchanges_param.keys().cloned().collect();
    let registry = Arc::new(VenueRegistry::new(venue_ids.clone(), registry_factory));

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(run_dispatcher(
        outbound.clone(),
        Arc::new(LoggingDeliverer) as Arc<dyn Deliverer>,
        shutdown_rx.clone(),
    )));

    for venue_id in &venue_ids {
        let registry = registry.clone();
        let venue_id = venue_id.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = registry.setup(&venue_id).await {
                log::error!("failed to set up {venue_id}: {err}");
            }
        }));
    }

    let order_book_ttl = Duration::from_secs(config.expire_book_orders);
    let deal_ttl = Duration::from_secs(config.expire_deal_events);

    let venue_modes: Vec<(String, ingestion::IngestionMode, Vec<Symbol>)> = config
        .parameters
        .exchanges_param
        .iter()
        .map(|(venue_id, param)| {
            let symbols = param.symbols.iter().map(|s| Symbol::new(s.clone())).collect();
            (venue_id.clone(), parse_mode(param), symbols)
        })
        .collect();

    for plan in derive_plans(&venue_modes) {
        let registry = registry.clone();
        let cache = cache.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(run_plan(
            plan,
            registry,
            cache,
            order_book_ttl,
            shutdown_rx,
        )));
    }

    for (venue_id, param) in &config.parameters.exchanges_param {
        let trios = eligible_trios(trio_legs(venue_id, param), 100);
        for legs in trios {
            let registry = registry.clone();
            let cache = cache.clone();
            let outbound = outbound.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(deal::run_trio_loop(
                venue_id.clone(),
                legs,
                registry,
                cache,
                deal_ttl,
                outbound,
                shutdown_rx,
            )));
        }
    }

    for symbol in &config.symbols {
        let symbol = Symbol::new(symbol.clone());
        let registry = registry.clone();
        let cache = cache.clone();
        let outbound = outbound.clone();
        let venue_ids = venue_ids.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(deal::run_symbol_loop(
            symbol,
            registry,
            cache,
            venue_ids,
            deal_ttl,
            outbound,
            None,
            shutdown_rx,
        )));
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");
    shutdown_tx.send(true).ok();

    for task in tasks {
        if let Err(err) = task.await {
            log::error!("task join failed during shutdown: {err}");
        }
    }
    registry.close_all().await;

    Ok(())
}

fn registry_factory(
    _venue_id: &str,
    _credentials: Option<registry::Credentials>,
) -> Arc<dyn registry::VenueClient> {
    unimplemented!("venue client construction is owned by the client library this crate consumes")
}
