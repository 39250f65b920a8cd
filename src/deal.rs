use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error};
use rand::seq::SliceRandom;
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::cache::CacheStore;
use crate::matching::{match_operations, Operation};
use crate::registry::VenueRegistry;
use crate::types::{BalanceMap, DealEventType, DealKey, DealState, Leg, Side, Symbol};

pub const MIN_ABS_PROFIT: &str = "10";
pub const MIN_REL_PROFIT: &str = "1";

fn thresholds_met(profit: Decimal, profit_percentage: Decimal) -> bool {
    let min_abs: Decimal = MIN_ABS_PROFIT.parse().unwrap();
    let min_rel: Decimal = MIN_REL_PROFIT.parse().unwrap();
    profit >= min_abs && profit_percentage >= min_rel
}

/// Applies the `(prior.threshold, new.threshold)` transition table and
/// returns the event to persist and, when non-noop, a message to enqueue.
pub fn transition(prior: &DealState, now: chrono::DateTime<Utc>, profit: Decimal, profit_percentage: Decimal, profit_coin: &str) -> DealState {
    let threshold = thresholds_met(profit, profit_percentage);
    let (event_type, ts_open, ts_close) = match (prior.threshold, threshold) {
        (false, false) => (DealEventType::Noop, prior.ts_open, None),
        (false, true) => (DealEventType::Open, now, None),
        (true, true) => (DealEventType::Update, prior.ts_open, None),
        (true, false) => (DealEventType::Close, prior.ts_open, Some(prior.ts)),
    };

    if event_type == DealEventType::Close {
        return DealState {
            ts: now,
            ts_open,
            ts_close,
            event_type,
            threshold: false,
            profit: prior.profit,
            profit_coin: prior.profit_coin.clone(),
            profit_percentage: prior.profit_percentage,
            message: None,
        };
    }

    DealState {
        ts: now,
        ts_open,
        ts_close,
        event_type,
        threshold,
        profit,
        profit_coin: profit_coin.to_string(),
        profit_percentage,
        message: None,
    }
}

fn format_message(symbol: &str, state: &DealState, venues: &str) -> Option<String> {
    match state.event_type {
        DealEventType::Noop | DealEventType::Update => None,
        DealEventType::Open => Some(format!(
            "\u{1F7E2} {symbol} opened, making a profit of {} {} ({}%) {venues}",
            state.profit, state.profit_coin, state.profit_percentage
        )),
        DealEventType::Close => {
            let duration_secs = state
                .ts_close
                .map(|close| (close - state.ts_open).num_seconds())
                .unwrap_or_default();
            Some(format!(
                "\u{1F534} {symbol} closed, took {duration_secs}s"
            ))
        }
    }
}

/// Appends a CSV row on every `close` transition; writes the header once
/// when the per-symbol per-day file is created.
pub fn append_close_to_csv(
    dir: &Path,
    symbol: &str,
    buy_venue: &str,
    sell_venue: &str,
    state: &DealState,
    buy_total_quote: Decimal,
    buy_total_base: Decimal,
    sell_total_quote: Decimal,
) -> std::io::Result<()> {
    let date = Utc::now().format("%Y-%m-%d");
    let path = dir.join(format!("{symbol}_{date}.csv"));
    let write_header = !path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if write_header {
        writer.write_record([
            "ts",
            "symbol",
            "ts_open",
            "ts_close",
            "duration",
            "profit",
            "profit_percentage",
            "buy_exchange",
            "buy_total_quote",
            "buy_total_base",
            "sell_exchange",
            "sell_total_quote",
        ])?;
    }
    let duration_secs = state
        .ts_close
        .map(|close| (close - state.ts_open).num_seconds())
        .unwrap_or_default();
    writer.write_record([
        state.ts.to_rfc3339(),
        symbol.to_string(),
        state.ts_open.to_rfc3339(),
        state.ts_close.map(|t| t.to_rfc3339()).unwrap_or_default(),
        duration_secs.to_string(),
        state.profit.to_string(),
        state.profit_percentage.to_string(),
        buy_venue.to_string(),
        buy_total_quote.to_string(),
        buy_total_base.to_string(),
        sell_venue.to_string(),
        sell_total_quote.to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

/// One tick of the pair-deal watch loop for a single symbol: enumerates
/// every ordered `(buy, sell)` pair of initialized venues, matches, and
/// drives the state machine.
pub async fn watch_symbol_tick(
    symbol: &Symbol,
    registry: &VenueRegistry,
    cache: &dyn CacheStore,
    venue_ids: &[String],
    deal_ttl: Duration,
    outbound: &crate::notify::OutboundQueue,
    csv_dir: Option<&Path>,
) {
    for buy_venue in venue_ids {
        for sell_venue in venue_ids {
            if buy_venue == sell_venue {
                continue;
            }
            let Some(buy_book) = cache.get_order_book(&symbol.0, buy_venue).await.ok().flatten() else {
                continue;
            };
            let Some(sell_book) = cache.get_order_book(&symbol.0, sell_venue).await.ok().flatten() else {
                continue;
            };
            if buy_book.is_empty_side(Side::Buy) || sell_book.is_empty_side(Side::Sell) {
                continue;
            }
            let Some(buy_client) = registry.exchange(buy_venue).await else {
                continue;
            };
            let Some(sell_client) = registry.exchange(sell_venue).await else {
                continue;
            };

            let base = symbol.base().unwrap_or("").to_string();
            let quote = symbol.quote().unwrap_or("").to_string();
            let base_balance = cache.get_balance(&base).await.unwrap_or(Decimal::ZERO);
            let quote_balance = cache.get_balance(&quote).await.unwrap_or(Decimal::ZERO);
            let mut balances = BalanceMap::default();
            balances.set(&quote, quote_balance);
            balances.set(&base, base_balance);

            let ops = vec![
                Operation {
                    venue_id: buy_venue.clone(),
                    client: buy_client.as_ref(),
                    side: Side::Buy,
                    snapshot: buy_book,
                },
                Operation {
                    venue_id: sell_venue.clone(),
                    client: sell_client.as_ref(),
                    side: Side::Sell,
                    snapshot: sell_book,
                },
            ];

            let result = match match_operations(balances, ops) {
                Ok(result) => result,
                Err(err) => {
                    error!("{symbol}: {buy_venue} -> {sell_venue}: {err}");
                    continue;
                }
            };

            let key = DealKey::Pair {
                symbol: symbol.0.clone(),
                buy_venue: buy_venue.clone(),
                sell_venue: sell_venue.clone(),
            };
            let cache_key = key.cache_key();
            let prior = cache
                .get_deal(&cache_key)
                .await
                .unwrap_or_else(|_| DealState::sentinel(Utc::now()));
            let mut next = transition(&prior, Utc::now(), result.profit, result.profit_percentage, &result.profit_coin);

            if next.event_type != DealEventType::Noop {
                let venues = format!("{buy_venue} -> {sell_venue}");
                next.message = format_message(&symbol.0, &next, &venues);
                if let Some(text) = &next.message {
                    outbound.enqueue(text.clone(), false).await;
                }
                debug!("{cache_key}: {}", next.event_type);
            }

            if next.event_type == DealEventType::Close {
                if let Some(dir) = csv_dir {
                    if let Err(err) = append_close_to_csv(
                        dir,
                        &symbol.0,
                        buy_venue,
                        sell_venue,
                        &next,
                        result.matched_quote[0],
                        result.matched_base[0],
                        result.matched_quote[1],
                    ) {
                        error!("csv write failed for {cache_key}: {err}");
                    }
                }
            }

            if let Err(err) = cache.set_deal(&cache_key, &next, deal_ttl).await {
                error!("cache write failed for {cache_key}: {err}");
            }
        }
    }
}

/// Runs the pair-deal watch loop for a symbol until `shutdown` fires.
pub async fn run_symbol_loop(
    symbol: Symbol,
    registry: Arc<VenueRegistry>,
    cache: Arc<dyn CacheStore>,
    venue_ids: Vec<String>,
    deal_ttl: Duration,
    outbound: Arc<crate::notify::OutboundQueue>,
    csv_dir: Option<std::path::PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        watch_symbol_tick(
            &symbol,
            &registry,
            cache.as_ref(),
            &venue_ids,
            deal_ttl,
            &outbound,
            csv_dir.as_deref(),
        )
        .await;
    }
}

/// Fixed notional used to probe each triangular cycle; the trio loop never
/// reads the live balance cache, matching the reference engine's watcher.
pub const TRIO_STARTING_BALANCE_USDT: &str = "100000";

/// Runs one triangular cycle's watch loop on one venue until `shutdown` fires.
pub async fn run_trio_loop(
    venue_id: String,
    legs: Vec<Leg>,
    registry: Arc<VenueRegistry>,
    cache: Arc<dyn CacheStore>,
    deal_ttl: Duration,
    outbound: Arc<crate::notify::OutboundQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut starting_balance = BalanceMap::default();
    starting_balance.set("USDT", TRIO_STARTING_BALANCE_USDT.parse().unwrap());

    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        watch_trio_tick(
            &venue_id,
            &legs,
            &registry,
            cache.as_ref(),
            &starting_balance,
            deal_ttl,
            &outbound,
        )
        .await;
    }
}

/// Only cycles whose first leg either buys into USDT or sells out of USDT
/// are considered eligible, bounding the candidate set.
pub fn eligible_trios(trios: Vec<Vec<Leg>>, max_candidates: usize) -> Vec<Vec<Leg>> {
    let mut filtered: Vec<Vec<Leg>> = trios
        .into_iter()
        .filter(|legs| {
            let Some(first) = legs.first() else {
                return false;
            };
            match first.side {
                Side::Buy => first.symbol.0.ends_with("/USDT"),
                Side::Sell => first.symbol.0.starts_with("USDT/"),
            }
        })
        .collect();
    let mut rng = rand::thread_rng();
    filtered.shuffle(&mut rng);
    filtered.truncate(max_candidates);
    filtered
}

/// One tick of a triangular-deal watch loop for a single cycle on one venue.
pub async fn watch_trio_tick(
    venue_id: &str,
    legs: &[Leg],
    registry: &VenueRegistry,
    cache: &dyn CacheStore,
    starting_balance: &BalanceMap,
    deal_ttl: Duration,
    outbound: &crate::notify::OutboundQueue,
) {
    let Some(client) = registry.exchange(venue_id).await else {
        return;
    };

    let mut snapshots = Vec::with_capacity(legs.len());
    for leg in legs {
        let Some(book) = cache.get_order_book(&leg.symbol.0, venue_id).await.ok().flatten() else {
            return;
        };
        snapshots.push(book);
    }

    let balances = starting_balance.clone();

    let ops = legs
        .iter()
        .zip(snapshots)
        .map(|(leg, snapshot)| Operation {
            venue_id: venue_id.to_string(),
            client: client.as_ref(),
            side: leg.side,
            snapshot,
        })
        .collect();

    let result = match match_operations(balances, ops) {
        Ok(result) => result,
        Err(err) => {
            error!("trio on {venue_id}: {err}");
            return;
        }
    };

    let key = DealKey::Trio(
        legs.iter()
            .map(|leg| {
                let side = match leg.side {
                    Side::Buy => "buy",
                    Side::Sell => "sell",
                };
                (leg.venue.clone(), side.to_string(), leg.symbol.0.clone())
            })
            .collect(),
    );
    let cache_key = key.cache_key();
    let prior = cache
        .get_deal(&cache_key)
        .await
        .unwrap_or_else(|_| DealState::sentinel(Utc::now()));
    let mut next = transition(&prior, Utc::now(), result.profit, result.profit_percentage, &result.profit_coin);

    if next.event_type != DealEventType::Noop {
        let legs_desc = legs
            .iter()
            .map(|leg| format!("{:?} {}", leg.side, leg.symbol))
            .collect::<Vec<_>>()
            .join(", ");
        next.message = format_message(&format!("trio on {venue_id}"), &next, &legs_desc);
        if let Some(text) = &next.message {
            outbound.enqueue(text.clone(), false).await;
        }
        debug!("{cache_key}: {}", next.event_type);
    }

    if let Err(err) = cache.set_deal(&cache_key, &next, deal_ttl).await {
        error!("cache write failed for {cache_key}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn noop_to_noop_stays_noop() {
        let prior = DealState::sentinel(ts(0));
        let next = transition(&prior, ts(1), Decimal::ZERO, Decimal::ZERO, "USDT");
        assert_eq!(next.event_type, DealEventType::Noop);
        assert_eq!(next.ts_open, prior.ts_open);
    }

    #[test]
    fn noop_to_above_threshold_opens() {
        let prior = DealState::sentinel(ts(0));
        let next = transition(&prior, ts(5), "20".parse().unwrap(), "2".parse().unwrap(), "USDT");
        assert_eq!(next.event_type, DealEventType::Open);
        assert_eq!(next.ts_open, ts(5));
        assert!(next.threshold);
    }

    #[test]
    fn sustained_threshold_updates_without_moving_ts_open() {
        let mut prior = DealState::sentinel(ts(0));
        prior.threshold = true;
        prior.ts_open = ts(0);
        prior.ts = ts(5);
        let next = transition(&prior, ts(10), "25".parse().unwrap(), "2.5".parse().unwrap(), "USDT");
        assert_eq!(next.event_type, DealEventType::Update);
        assert_eq!(next.ts_open, ts(0));
    }

    #[test]
    fn dropping_below_threshold_closes_and_fixes_threshold_false() {
        let mut prior = DealState::sentinel(ts(0));
        prior.threshold = true;
        prior.ts_open = ts(0);
        prior.ts = ts(10);
        prior.profit = "25".parse().unwrap();
        let next = transition(&prior, ts(15), Decimal::ZERO, Decimal::ZERO, "USDT");
        assert_eq!(next.event_type, DealEventType::Close);
        assert_eq!(next.ts_close, Some(ts(10)));
        assert!(!next.threshold);
        assert_eq!(next.profit, "25".parse().unwrap());
    }

    #[test]
    fn eligible_trios_filters_non_usdt_legs() {
        let trios = vec![
            vec![
                Leg { venue: "a".into(), side: Side::Buy, symbol: Symbol::new("BTC/USDT") },
                Leg { venue: "a".into(), side: Side::Sell, symbol: Symbol::new("BTC/ETH") },
                Leg { venue: "a".into(), side: Side::Sell, symbol: Symbol::new("ETH/USDT") },
            ],
            vec![
                Leg { venue: "a".into(), side: Side::Buy, symbol: Symbol::new("BTC/ETH") },
                Leg { venue: "a".into(), side: Side::Sell, symbol: Symbol::new("BTC/USDT") },
                Leg { venue: "a".into(), side: Side::Sell, symbol: Symbol::new("ETH/USDT") },
            ],
        ];
        let filtered = eligible_trios(trios, 100);
        assert_eq!(filtered.len(), 1);
    }
}
