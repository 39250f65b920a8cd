use std::collections::VecDeque;
use std::time::Duration;

use log::{error, warn};
use tokio::sync::Mutex;
use tokio::sync::watch;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: Option<String>,
    pub text: String,
}

/// FIFO outbound queue with priority front-insertion, matching the
/// notification ordering used by the interactive command surface (a
/// response to a user command jumps ahead of background deal alerts).
#[derive(Default)]
pub struct OutboundQueue {
    messages: Mutex<VecDeque<OutboundMessage>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        OutboundQueue {
            messages: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn enqueue(&self, text: String, priority: bool) {
        let message = OutboundMessage {
            chat_id: None,
            text,
        };
        let mut queue = self.messages.lock().await;
        if priority {
            queue.push_front(message);
        } else {
            queue.push_back(message);
        }
    }

    pub async fn enqueue_for(&self, chat_id: String, text: String, priority: bool) {
        let message = OutboundMessage {
            chat_id: Some(chat_id),
            text,
        };
        let mut queue = self.messages.lock().await;
        if priority {
            queue.push_front(message);
        } else {
            queue.push_back(message);
        }
    }

    async fn pop(&self) -> Option<OutboundMessage> {
        self.messages.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }
}

/// A delivery sink; implemented against a real chat bot API outside this
/// crate's scope and against a recording fake in tests.
#[async_trait::async_trait]
pub trait Deliverer: Send + Sync {
    /// Returns `Ok(None)` on success, `Ok(Some(retry_after))` when the
    /// channel asked for an exact retry delay, or `Err` on any other
    /// failure (handled by the caller's exponential backoff).
    async fn deliver(&self, message: &OutboundMessage) -> crate::error::Result<Option<Duration>>;
}

/// One timed delivery attempt. A timeout is folded into the `Result` so the
/// caller's retry logic only has to deal with one failure channel.
async fn attempt_delivery(
    deliverer: &dyn Deliverer,
    message: &OutboundMessage,
) -> crate::error::Result<Option<Duration>> {
    match tokio::time::timeout(DISPATCH_TIMEOUT, deliverer.deliver(message)).await {
        Ok(result) => result,
        Err(_) => Err(crate::error::EngineError::Timeout(format!(
            "delivery after {DISPATCH_TIMEOUT:?}"
        ))),
    }
}

/// Drains the queue until `shutdown` fires, applying retry-after delays
/// exactly and falling back to the shared exponential backoff schedule on
/// other failures. On shutdown, finishes delivering whatever is already
/// in flight before returning.
pub async fn run_dispatcher(
    queue: std::sync::Arc<OutboundQueue>,
    deliverer: std::sync::Arc<dyn Deliverer>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = queue.pop().await;
        let Some(message) = message else {
            if *shutdown.borrow() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        };

        let deliverer = deliverer.clone();
        let outcome = crate::retry::exponential_backoff("notify", || {
            let deliverer = deliverer.clone();
            let message = message.clone();
            async move { attempt_delivery(deliverer.as_ref(), &message).await }
        })
        .await;

        match outcome {
            Ok(Some(retry_after)) => {
                warn!("delivery asked to retry after {retry_after:?}");
                crate::retry::retry_after_sleep(retry_after).await;
                match attempt_delivery(deliverer.as_ref(), &message).await {
                    Ok(Some(retry_after)) => {
                        warn!("delivery asked to retry after {retry_after:?} again, dropping");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!("delivery failed after retry-after: {err}");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!("delivery failed after exhausting retries: {err}");
            }
        }

        if *shutdown.borrow() && queue.len().await == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn priority_message_jumps_the_queue() {
        let queue = OutboundQueue::new();
        queue.enqueue("background".to_string(), false).await;
        queue.enqueue("urgent".to_string(), true).await;
        let first = queue.pop().await.unwrap();
        assert_eq!(first.text, "urgent");
        let second = queue.pop().await.unwrap();
        assert_eq!(second.text, "background");
    }

    #[tokio::test]
    async fn fifo_order_without_priority() {
        let queue = OutboundQueue::new();
        queue.enqueue("first".to_string(), false).await;
        queue.enqueue("second".to_string(), false).await;
        assert_eq!(queue.pop().await.unwrap().text, "first");
        assert_eq!(queue.pop().await.unwrap().text, "second");
    }
}
