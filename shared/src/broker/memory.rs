use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{ConsumeResult, Message, MessageHandler, Publisher};
use crate::error::{ServiceError, ServiceResult};

struct Subscription {
    topic: String,
    handler: Arc<dyn MessageHandler>,
    queue: VecDeque<(Message, u32)>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Vec<Subscription>,
    history: Vec<Message>,
}

/// In-process broker with consumer-group semantics: every subscription gets
/// its own copy of each message and `RetryLater` puts the message back.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    offline: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While offline, `publish` fails with `BrokerUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) {
        self.state().subscriptions.push(Subscription {
            topic: topic.to_string(),
            handler,
            queue: VecDeque::new(),
        });
    }

    /// Every message ever published on `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.state()
            .history
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.state().subscriptions.iter().map(|s| s.queue.len()).sum()
    }

    /// Delivers each queued message once. Returns how many deliveries
    /// succeeded; messages answered with `RetryLater` stay queued.
    pub async fn deliver_pending(&self) -> usize {
        let batch: Vec<(usize, Arc<dyn MessageHandler>, Vec<(Message, u32)>)> = {
            let mut state = self.state();
            state
                .subscriptions
                .iter_mut()
                .enumerate()
                .map(|(index, sub)| (index, sub.handler.clone(), sub.queue.drain(..).collect()))
                .collect()
        };

        let mut delivered = 0;
        for (index, handler, messages) in batch {
            for (message, attempts) in messages {
                match handler.handle(&message).await {
                    ConsumeResult::Success => delivered += 1,
                    ConsumeResult::RetryLater => {
                        debug!(topic = %message.topic, key = %message.key, attempts, "Redelivery requested");
                        self.state().subscriptions[index]
                            .queue
                            .push_back((message, attempts + 1));
                    }
                }
            }
        }
        delivered
    }

    /// Delivers until nothing is queued or `max_rounds` passes were made.
    pub async fn drain(&self, max_rounds: usize) -> usize {
        let mut delivered = 0;
        for _ in 0..max_rounds {
            if self.pending() == 0 {
                break;
            }
            delivered += self.deliver_pending().await;
        }
        delivered
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, message: &Message) -> ServiceResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ServiceError::BrokerUnavailable("memory broker offline".to_string()));
        }
        let mut state = self.state();
        state.history.push(message.clone());
        for sub in state.subscriptions.iter_mut().filter(|s| s.topic == message.topic) {
            sub.queue.push_back((message.clone(), 0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Flaky {
        failures_left: AtomicUsize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn handle(&self, _message: &Message) -> ConsumeResult {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                ConsumeResult::RetryLater
            } else {
                ConsumeResult::Success
            }
        }
    }

    fn message(topic: &str) -> Message {
        Message {
            topic: topic.to_string(),
            key: "k".to_string(),
            payload: serde_json::json!({"order_serial": "k"}),
        }
    }

    #[tokio::test]
    async fn retry_later_redelivers_until_success() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
            seen: AtomicUsize::new(0),
        });
        broker.subscribe("t", handler.clone());

        broker.publish(&message("t")).await.unwrap();
        assert_eq!(broker.drain(10).await, 1);
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn each_subscription_receives_its_own_copy() {
        let broker = MemoryBroker::new();
        let a = Arc::new(Flaky { failures_left: AtomicUsize::new(0), seen: AtomicUsize::new(0) });
        let b = Arc::new(Flaky { failures_left: AtomicUsize::new(0), seen: AtomicUsize::new(0) });
        broker.subscribe("t", a.clone());
        broker.subscribe("t", b.clone());
        broker.subscribe("other", Arc::new(Flaky { failures_left: AtomicUsize::new(0), seen: AtomicUsize::new(0) }));

        broker.publish(&message("t")).await.unwrap();
        broker.drain(1).await;

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
        assert_eq!(broker.published("t").len(), 1);
    }

    #[tokio::test]
    async fn offline_broker_rejects_publish() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let err = broker.publish(&message("t")).await.unwrap_err();
        assert!(matches!(err, ServiceError::BrokerUnavailable(_)));
        assert!(broker.published("t").is_empty());
    }
}
