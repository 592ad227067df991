//! Outbox-backed transactional and delayed messaging.
//!
//! Every outgoing message is first a row in the producer's own database.
//! Half-messages start PREPARED and are resolved by the local transaction or
//! by a check-back; COMMITTED rows become visible once the relay publishes
//! them, which for delayed messages happens at `deliver_at`.

mod memory;
mod pg;
mod relay;
pub mod schema;

pub use memory::MemoryOutboxStore;
pub use pg::{enqueue_in, resolve_in, PgOutboxStore};
pub use relay::{OutboxRelay, RelayConfig};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{HalfMessage, Message, Resolution, TransactionListener, TransactionState};
use crate::error::ServiceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Prepared,
    Unknown,
    Committed,
    RolledBack,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Prepared => "PREPARED",
            RecordState::Unknown => "UNKNOWN",
            RecordState::Committed => "COMMITTED",
            RecordState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PREPARED" => Some(RecordState::Prepared),
            "UNKNOWN" => Some(RecordState::Unknown),
            "COMMITTED" => Some(RecordState::Committed),
            "ROLLED_BACK" => Some(RecordState::RolledBack),
            _ => None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, RecordState::Prepared | RecordState::Unknown)
    }
}

impl From<TransactionState> for RecordState {
    fn from(state: TransactionState) -> Self {
        match state {
            TransactionState::Commit => RecordState::Committed,
            TransactionState::Rollback => RecordState::RolledBack,
            TransactionState::Unknown => RecordState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub message: Message,
    pub state: RecordState,
    pub deliver_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub check_times: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn half_message(&self) -> HalfMessage {
        HalfMessage {
            id: self.id,
            message: self.message.clone(),
            created_at: self.created_at,
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stores a half-message in state PREPARED.
    async fn prepare(&self, message: &Message) -> ServiceResult<i64>;

    /// Stores a COMMITTED message that becomes publishable at `deliver_at`.
    async fn enqueue(&self, message: &Message, deliver_at: DateTime<Utc>) -> ServiceResult<i64>;

    /// Moves a PREPARED/UNKNOWN record to `state`, enqueueing `follow_up` in
    /// the same transaction. Returns false when the record was already
    /// resolved by someone else; the follow-up is then dropped.
    async fn resolve(
        &self,
        id: i64,
        state: TransactionState,
        follow_up: &[Message],
    ) -> ServiceResult<bool>;

    /// COMMITTED, unpublished records whose delivery time has come.
    async fn due(&self, now: DateTime<Utc>, limit: i64) -> ServiceResult<Vec<OutboxRecord>>;

    async fn mark_published(&self, id: i64) -> ServiceResult<()>;

    /// PREPARED/UNKNOWN records untouched since `older_than`.
    async fn unresolved(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> ServiceResult<Vec<OutboxRecord>>;

    /// Counts one check-back attempt and returns the new total.
    async fn record_check(&self, id: i64) -> ServiceResult<i32>;
}

/// Producer of transactional half-messages.
pub struct TransactionalProducer {
    store: Arc<dyn OutboxStore>,
    listener: Arc<dyn TransactionListener>,
}

impl TransactionalProducer {
    pub fn new(store: Arc<dyn OutboxStore>, listener: Arc<dyn TransactionListener>) -> Self {
        Self { store, listener }
    }

    /// Parks `message`, runs the local transaction and records its verdict.
    /// UNKNOWN, or a verdict that could not be recorded, is settled later by
    /// the relay's check-back.
    pub async fn send_in_transaction(&self, message: Message) -> ServiceResult<TransactionState> {
        let id = self.store.prepare(&message).await?;
        let half = HalfMessage {
            id,
            message,
            created_at: Utc::now(),
        };

        let Resolution { state, follow_up } = self.listener.execute_local_transaction(&half).await;

        match self.store.resolve(id, state, &follow_up).await {
            Ok(true) => {}
            Ok(false) => debug!(id, ?state, "Half-message already resolved"),
            Err(e) => warn!(id, ?state, error = %e, "Failed to record local transaction verdict"),
        }

        info!(id, topic = %half.message.topic, key = %half.message.key, ?state, "Local transaction finished");
        Ok(state)
    }
}

/// Delivery time of a message delayed by `delay` from `now`.
pub fn deliver_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
