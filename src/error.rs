use thiserror::Error;

/// Errors surfaced by the venue registry, cache layer, matching engine, and
/// deal controller. Kept narrow and classified so callers can decide whether
/// to retry, skip, or log and continue.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("venue {venue} unavailable: {message}")]
    Venue { venue: String, message: String },

    #[error("venue {venue} rate limited, retry after {retry_after_secs}s")]
    RateLimited { venue: String, retry_after_secs: u64 },

    #[error("venue {venue} has no credentials configured")]
    NotAuthenticated { venue: String },

    #[error("cache operation failed: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("symbol {symbol} not found on venue {venue}")]
    MissingMarket { symbol: String, venue: String },

    #[error("snapshot venue mismatch: expected {expected}, got {actual}")]
    SnapshotVenueMismatch { expected: String, actual: String },

    #[error("{0} timed out")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
