use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::error::{EngineError, Result};

/// Fixed four-step exponential backoff schedule shared by every venue call
/// site: 1, 2, 4, 8 seconds. Retries `f` up to `schedule.len() + 1` times,
/// returning the last error if every attempt fails.
pub async fn exponential_backoff<F, Fut, T>(label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    const SCHEDULE_SECS: [u64; 4] = [1, 2, 4, 8];

    let mut last_err = None;
    for delay in SCHEDULE_SECS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("{label}: attempt failed, retrying in {delay}s: {err}");
                last_err = Some(err);
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }
    f().await.map_err(|err| {
        warn!("{label}: exhausted retry schedule");
        last_err.unwrap_or(err)
    })
}

/// Rate-limit handling: sleep a fixed duration (default 60s, or a
/// venue-specified override) then let the caller retry within its own
/// attempt budget.
pub async fn rate_limit_sleep(retry_after: Option<Duration>) {
    let delay = retry_after.unwrap_or(Duration::from_secs(60));
    tokio::time::sleep(delay).await;
}

/// Outbound delivery retry-after: sleep the exact duration the channel
/// reported, then retry once.
pub async fn retry_after_sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

pub fn classify_rate_limit(venue: &str, retry_after_secs: u64) -> EngineError {
    EngineError::RateLimited {
        venue: venue.to_string(),
        retry_after_secs,
    }
}
