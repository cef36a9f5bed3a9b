use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::{ChatError, DeliveryError};
use crate::matrix::{ChatClient, Message};
use crate::room::RoomResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on the time spent waiting between attempts.
    pub max_total: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_total: Duration::from_millis(settings.max_total_ms),
        }
    }
}

/// Posts messages to resolved rooms with exponential backoff on transient errors.
pub struct Deliverer {
    client: Arc<dyn ChatClient>,
    resolver: Arc<RoomResolver>,
    policy: RetryPolicy,
    txn_prefix: String,
    txn_counter: AtomicU64,
}

impl Deliverer {
    pub fn new(client: Arc<dyn ChatClient>, resolver: Arc<RoomResolver>, policy: RetryPolicy) -> Self {
        Self {
            client,
            resolver,
            policy,
            txn_prefix: format!("russy-{}", Utc::now().timestamp_millis()),
            txn_counter: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.txn_prefix)
    }

    /// Sends `message` to `room_id`.
    ///
    /// Transient failures are retried with the same transaction id. A terminal
    /// failure that points at a stale room invalidates the resolver's cache
    /// for that room before returning.
    pub async fn send(&self, room_id: &str, message: &Message) -> Result<(), DeliveryError> {
        let txn_id = self.next_txn_id();
        let started = Instant::now();
        let mut delay = self.policy.base_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match self.client.send_message(room_id, &txn_id, message).await {
                Ok(()) => {
                    debug!(room_id, txn_id = %txn_id, attempts, "message delivered");
                    return Ok(());
                }
                Err(err) => err,
            };

            if err.is_transient() && attempts < self.policy.max_attempts {
                let wait = match &err {
                    ChatError::RateLimited {
                        retry_after: Some(retry_after),
                    } => (*retry_after).max(delay),
                    _ => delay,
                };
                if started.elapsed() + wait <= self.policy.max_total {
                    warn!(room_id, attempts, error = %err, wait_ms = wait.as_millis() as u64, "send failed, retrying");
                    tokio::time::sleep(wait).await;
                    delay = delay.saturating_mul(2);
                    continue;
                }
            }

            if !err.is_transient() && err.indicates_stale_room() {
                self.resolver.invalidate_room(room_id).await;
            }
            return Err(DeliveryError::Failed {
                room_id: room_id.to_string(),
                attempts,
                source: err,
            });
        }
    }
}
