use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::ingestion::IngestionMode;
use crate::types::{Leg, Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// One leg of a precomputed triangular cycle, as emitted by the offline
/// parameter-generation tooling this crate does not own.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrioLegParam {
    pub side: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeParam {
    pub mode: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub batch_limit: Option<usize>,
    #[serde(default)]
    pub symbol_trios: Vec<Vec<TrioLegParam>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SymbolParam {
    pub exchanges: Vec<String>,
    pub base_coin: String,
    pub quote_coin: String,
    #[serde(default)]
    pub marketcap_rank: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Parameters {
    pub exchanges_param: HashMap<String, ExchangeParam>,
    pub symbols_param: HashMap<String, SymbolParam>,
}

/// Process-wide configuration: env-driven scalars plus the venue/symbol
/// parameter file. Env var reads mirror the original bot's naming so
/// deployments don't need to rename anything on migration.
#[derive(Debug, Clone)]
pub struct Config {
    pub symbols: Vec<String>,
    pub parameters: Parameters,
    pub cache_endpoint: String,
    pub expire_book_orders: u64,
    pub expire_deal_events: u64,
    pub bot_token: Option<String>,
    pub bot_chat_id: Option<String>,
    pub role: Role,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load(parameters_path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(parameters_path)
            .map_err(|err| EngineError::Config(format!("reading {parameters_path:?}: {err}")))?;
        let parameters: Parameters = serde_json::from_str(&raw)
            .map_err(|err| EngineError::Config(format!("parsing {parameters_path:?}: {err}")))?;

        let symbols = std::env::var("SYMBOLS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let role = match std::env::var("ROLE").as_deref() {
            Ok("secondary") => Role::Secondary,
            _ => Role::Primary,
        };

        Ok(Config {
            symbols,
            parameters,
            cache_endpoint: std::env::var("CACHE_ENDPOINT")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            expire_book_orders: env_u64("EXPIRE_BOOK_ORDERS", 60),
            expire_deal_events: env_u64("EXPIRE_DEAL_EVENTS", 60),
            bot_token: std::env::var("BOT_TOKEN").ok(),
            bot_chat_id: std::env::var("BOT_CHAT_ID").ok(),
            role,
        })
    }
}

pub fn parse_mode(param: &ExchangeParam) -> IngestionMode {
    match param.mode.as_str() {
        "batch" => IngestionMode::Batch {
            limit: param.batch_limit.unwrap_or(10),
        },
        "all" => IngestionMode::All,
        _ => IngestionMode::Single,
    }
}

/// Converts the raw `symbol_trios` rows for one venue into `Leg` cycles.
/// Rows that aren't exactly three legs, or whose side isn't `buy`/`sell`,
/// are dropped; they come from an offline generator this crate doesn't own.
pub fn trio_legs(venue_id: &str, param: &ExchangeParam) -> Vec<Vec<Leg>> {
    param
        .symbol_trios
        .iter()
        .filter_map(|trio| {
            if trio.len() != 3 {
                return None;
            }
            trio.iter()
                .map(|leg| {
                    let side = match leg.side.as_str() {
                        "buy" => Some(Side::Buy),
                        "sell" => Some(Side::Sell),
                        _ => None,
                    }?;
                    Some(Leg {
                        venue: venue_id.to_string(),
                        side,
                        symbol: Symbol::new(leg.symbol.clone()),
                    })
                })
                .collect::<Option<Vec<Leg>>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mode_defaults_batch_limit() {
        let param = ExchangeParam {
            mode: "batch".to_string(),
            symbols: vec![],
            batch_limit: None,
            symbol_trios: vec![],
        };
        assert!(matches!(parse_mode(&param), IngestionMode::Batch { limit: 10 }));
    }

    #[test]
    fn parse_mode_falls_back_to_single() {
        let param = ExchangeParam {
            mode: "unknown".to_string(),
            symbols: vec![],
            batch_limit: None,
            symbol_trios: vec![],
        };
        assert!(matches!(parse_mode(&param), IngestionMode::Single));
    }
}
