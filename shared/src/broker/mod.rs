//! Broker abstraction used by both services.
//!
//! Publishing and consuming go through [`Publisher`] and [`MessageHandler`].
//! Transactional half-messages and delayed delivery are layered on top of an
//! outbox table (see [`outbox`]) so any plain broker can back them.

pub mod kafka;
pub mod memory;
pub mod outbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn json<T: Serialize>(topic: &str, key: &str, payload: &T) -> ServiceResult<Self> {
        Ok(Self {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: serde_json::to_value(payload).map_err(|e| {
                ServiceError::FatalDb(format!("failed to encode {} message: {}", topic, e))
            })?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> ServiceResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ServiceError::InvalidArgument(format!("malformed {} message: {}", self.topic, e))
        })
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &Message) -> ServiceResult<()>;
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeResult {
    Success,
    RetryLater,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> ConsumeResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Commit,
    Rollback,
    Unknown,
}

/// Verdict of a local transaction or check-back, with messages that must be
/// enqueued atomically with the verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: TransactionState,
    pub follow_up: Vec<Message>,
}

impl Resolution {
    pub fn commit() -> Self {
        Self { state: TransactionState::Commit, follow_up: Vec::new() }
    }

    pub fn rollback() -> Self {
        Self { state: TransactionState::Rollback, follow_up: Vec::new() }
    }

    pub fn unknown() -> Self {
        Self { state: TransactionState::Unknown, follow_up: Vec::new() }
    }

    pub fn with_follow_up(mut self, message: Message) -> Self {
        self.follow_up.push(message);
        self
    }
}

/// A prepared message that is not yet visible to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct HalfMessage {
    pub id: i64,
    pub message: Message,
    pub created_at: DateTime<Utc>,
}

/// Host-side callbacks of a transactional producer.
#[async_trait]
pub trait TransactionListener: Send + Sync {
    async fn execute_local_transaction(&self, half: &HalfMessage) -> Resolution;

    /// Settles a half-message left unresolved, as seen at `now`.
    async fn check_local_transaction(&self, half: &HalfMessage, now: DateTime<Utc>) -> Resolution;

    /// Verdict once check-backs are exhausted. Always a rollback; the
    /// listener may attach compensating messages.
    async fn abandon(&self, _half: &HalfMessage) -> Resolution {
        Resolution::rollback()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn unencodable_payload_is_an_internal_error() {
        let mut payload: HashMap<(i32, i32), i32> = HashMap::new();
        payload.insert((1, 2), 3);

        let err = Message::json("order_reserve", "s-1", &payload).unwrap_err();

        assert!(matches!(err, ServiceError::FatalDb(_)));
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn undecodable_payload_is_an_invalid_argument() {
        let message = Message {
            topic: "order_timeout".to_string(),
            key: "s-1".to_string(),
            payload: serde_json::json!({ "order_serial": 42 }),
        };

        let err = message.decode::<crate::OrderSerialPayload>().unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
