use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::sync::watch;

use crate::cache::CacheStore;
use crate::registry::VenueRegistry;
use crate::retry::exponential_backoff;
use crate::types::Symbol;

/// How a venue exposes order book data. `Single` costs one call per symbol;
/// `Batch` groups symbols up to a limit; `All` returns every market in one
/// call and the scheduler filters client-side.
#[derive(Debug, Clone)]
pub enum IngestionMode {
    Single,
    Batch { limit: usize },
    All,
}

/// One unit of ingestion work. For `Single`, one plan exists per symbol; for
/// `Batch`, symbols are grouped up to `limit`; for `All`, the venue call
/// returns every market it lists and `symbols` carries the configured subset
/// the plan is allowed to write to the cache.
#[derive(Debug, Clone)]
pub struct IngestionPlan {
    pub venue_id: String,
    pub mode: IngestionMode,
    pub symbols: Vec<Symbol>,
}

/// Derives the immutable set of ingestion plans from configured venue modes
/// and symbol sets. Called once at startup; deriving twice from the same
/// input yields the same plans.
pub fn derive_plans(venue_modes: &[(String, IngestionMode, Vec<Symbol>)]) -> Vec<IngestionPlan> {
    let mut plans = Vec::new();
    for (venue_id, mode, symbols) in venue_modes {
        match mode {
            IngestionMode::Single => {
                for symbol in symbols {
                    plans.push(IngestionPlan {
                        venue_id: venue_id.clone(),
                        mode: IngestionMode::Single,
                        symbols: vec![symbol.clone()],
                    });
                }
            }
            IngestionMode::Batch { limit } => {
                for chunk in symbols.chunks((*limit).max(1)) {
                    plans.push(IngestionPlan {
                        venue_id: venue_id.clone(),
                        mode: IngestionMode::Batch { limit: *limit },
                        symbols: chunk.to_vec(),
                    });
                }
            }
            IngestionMode::All => {
                plans.push(IngestionPlan {
                    venue_id: venue_id.clone(),
                    mode: IngestionMode::All,
                    symbols: symbols.clone(),
                });
            }
        }
    }
    plans
}

/// Runs one ingestion plan until `shutdown` fires. Cooperative: the loop
/// checks the shutdown flag between iterations and at each suspension point.
pub async fn run_plan(
    plan: IngestionPlan,
    registry: Arc<VenueRegistry>,
    cache: Arc<dyn CacheStore>,
    order_book_ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let client = match registry.exchange(&plan.venue_id).await {
            Some(client) => client,
            None => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        if matches!(plan.mode, IngestionMode::Single) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let label = format!("ingest:{}:{:?}", plan.venue_id, plan.mode);
        let snapshots = exponential_backoff(&label, || {
            let client = client.clone();
            let plan = plan.clone();
            async move {
                match &plan.mode {
                    IngestionMode::Single => {
                        let snapshot = client.fetch_order_book(&plan.symbols[0]).await?;
                        Ok(vec![snapshot])
                    }
                    IngestionMode::Batch { .. } => {
                        client.watch_order_book_for_symbols(&plan.symbols).await
                    }
                    IngestionMode::All => client.fetch_order_books().await,
                }
            }
        })
        .await;

        match snapshots {
            Ok(snapshots) => {
                let allowed: Option<std::collections::HashSet<&str>> = if plan.symbols.is_empty()
                {
                    None
                } else {
                    Some(plan.symbols.iter().map(|s| s.0.as_str()).collect())
                };
                for snapshot in &snapshots {
                    if let Some(allowed) = &allowed {
                        if !allowed.contains(snapshot.symbol.0.as_str()) {
                            continue;
                        }
                    }
                    if let Err(err) = cache
                        .set_order_book(&snapshot.symbol.0, &plan.venue_id, snapshot, order_book_ttl)
                        .await
                    {
                        error!("cache write failed for {}/{}: {err}", snapshot.symbol, plan.venue_id);
                    }
                }
                debug!("{label}: wrote {} snapshot(s)", snapshots.len());
            }
            Err(err) => {
                error!("{label}: {err}");
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mode_fans_out_one_plan_per_symbol() {
        let plans = derive_plans(&[(
            "binance".to_string(),
            IngestionMode::Single,
            vec![Symbol::new("BTC/USDT"), Symbol::new("ETH/USDT")],
        )]);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].symbols.len(), 1);
    }

    #[test]
    fn batch_mode_groups_up_to_limit() {
        let symbols = vec![
            Symbol::new("A/USDT"),
            Symbol::new("B/USDT"),
            Symbol::new("C/USDT"),
        ];
        let plans = derive_plans(&[(
            "kraken".to_string(),
            IngestionMode::Batch { limit: 2 },
            symbols,
        )]);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].symbols.len(), 2);
        assert_eq!(plans[1].symbols.len(), 1);
    }

    #[test]
    fn all_mode_yields_single_plan_filtered_to_configured_symbols() {
        let plans = derive_plans(&[(
            "okx".to_string(),
            IngestionMode::All,
            vec![Symbol::new("BTC/USDT")],
        )]);
        assert_eq!(plans.len(), 1);
        assert!(matches!(plans[0].mode, IngestionMode::All));
        assert_eq!(plans[0].symbols, vec![Symbol::new("BTC/USDT")]);
    }

    #[test]
    fn deriving_twice_is_idempotent() {
        let input = vec![(
            "kraken".to_string(),
            IngestionMode::Batch { limit: 2 },
            vec![Symbol::new("A/USDT"), Symbol::new("B/USDT")],
        )];
        let first = derive_plans(&input);
        let second = derive_plans(&input);
        assert_eq!(first.len(), second.len());
    }
}
