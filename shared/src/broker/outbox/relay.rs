use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{error, info, warn};

use super::OutboxStore;
use crate::broker::{Publisher, Resolution, TransactionListener, TransactionState};
use crate::error::ServiceResult;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// How long a half-message may stay unresolved before it is checked back.
    pub check_interval: Duration,
    /// Check-backs after which an unresolved half-message is rolled back.
    pub max_check_times: i32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            check_interval: Duration::from_secs(10),
            max_check_times: 15,
        }
    }
}

/// Moves outbox rows to the broker and settles unresolved half-messages.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn Publisher>,
    listeners: HashMap<String, Arc<dyn TransactionListener>>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<dyn Publisher>, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            listeners: HashMap::new(),
            config,
        }
    }

    /// Registers the check-back listener for half-messages on `topic`.
    pub fn with_listener(mut self, topic: &str, listener: Arc<dyn TransactionListener>) -> Self {
        self.listeners.insert(topic.to_string(), listener);
        self
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.poll_interval);

        loop {
            interval.tick().await;
            let now = Utc::now();

            if let Err(e) = self.check_unresolved(now).await {
                error!("Error checking back half-messages: {}", e);
            }
            if let Err(e) = self.publish_due(now).await {
                error!("Error publishing outbox messages: {}", e);
            }
        }
    }

    /// Publishes every committed record due at `now`; returns how many went out.
    pub async fn publish_due(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let records = self.store.due(now, self.config.batch_size).await?;
        let mut published = 0;

        for record in records {
            if let Err(e) = self.publisher.publish(&record.message).await {
                warn!(id = record.id, topic = %record.message.topic, error = %e, "Failed to publish outbox message");
                continue;
            }

            self.store.mark_published(record.id).await?;
            published += 1;
            info!(id = record.id, topic = %record.message.topic, key = %record.message.key, "Published outbox message");
        }

        Ok(published)
    }

    /// Runs check-backs for half-messages left unresolved since before
    /// `now - check_interval`; returns how many were settled.
    pub async fn check_unresolved(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let older_than = now
            - chrono::Duration::from_std(self.config.check_interval)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let records = self.store.unresolved(older_than, self.config.batch_size).await?;
        let mut settled = 0;

        for record in records {
            let half = record.half_message();
            let checks = self.store.record_check(record.id).await?;

            let listener = self.listeners.get(&half.message.topic);
            let resolution = match listener {
                Some(listener) => listener.check_local_transaction(&half, now).await,
                None => {
                    warn!(id = record.id, topic = %half.message.topic, "No transaction listener for topic");
                    Resolution::unknown()
                }
            };

            let resolution = if resolution.state == TransactionState::Unknown
                && checks >= self.config.max_check_times
            {
                error!(id = record.id, key = %half.message.key, checks, "Half-message unresolved after max check-backs, rolling back");
                let abandoned = match listener {
                    Some(listener) => listener.abandon(&half).await,
                    None => Resolution::rollback(),
                };
                Resolution {
                    state: TransactionState::Rollback,
                    ..abandoned
                }
            } else {
                resolution
            };

            if resolution.state == TransactionState::Unknown {
                continue;
            }

            if self
                .store
                .resolve(record.id, resolution.state, &resolution.follow_up)
                .await?
            {
                settled += 1;
                info!(id = record.id, key = %half.message.key, state = ?resolution.state, "Half-message settled by check-back");
            }
        }

        Ok(settled)
    }
}
