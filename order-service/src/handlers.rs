use std::sync::Arc;

use async_trait::async_trait;
use shared::broker::{ConsumeResult, Message, MessageHandler};
use shared::{OrderReservePayload, OrderSerialPayload};
use tracing::{error, info, warn};

use crate::models::CloseOutcome;
use crate::service::OrderService;

/// Consumer of `order_timeout`: closes orders still unpaid when their
/// timeout fires and schedules the stock release.
pub struct TimeoutHandler {
    service: Arc<OrderService>,
}

impl TimeoutHandler {
    pub fn new(service: Arc<OrderService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for TimeoutHandler {
    async fn handle(&self, message: &Message) -> ConsumeResult {
        let payload: OrderSerialPayload = match message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(key = %message.key, "Discarding malformed timeout message: {}", e);
                return ConsumeResult::Success;
            }
        };
        let serial = payload.order_serial.as_str();

        match self.service.close_expired(serial).await {
            Ok(CloseOutcome::Closed) => {
                info!(order_serial = serial, "Unpaid order closed, stock release scheduled");
                ConsumeResult::Success
            }
            Ok(CloseOutcome::NotPending(status)) => {
                info!(order_serial = serial, status = status.as_str(), "Order no longer pending, nothing to close");
                ConsumeResult::Success
            }
            Ok(CloseOutcome::NotFound) => {
                info!(order_serial = serial, "Timeout for unknown order, ignoring");
                ConsumeResult::Success
            }
            Err(e) => {
                warn!(order_serial = serial, error = %e, "Closing order failed, asking for redelivery");
                ConsumeResult::RetryLater
            }
        }
    }
}

/// Consumer of committed `order_reserve` events; they are only logged.
pub struct ReserveAuditHandler;

#[async_trait]
impl MessageHandler for ReserveAuditHandler {
    async fn handle(&self, message: &Message) -> ConsumeResult {
        match message.decode::<OrderReservePayload>() {
            Ok(payload) => info!(
                order_serial = %payload.order_serial,
                user_id = payload.user_id,
                "Order reservation committed"
            ),
            Err(e) => warn!(key = %message.key, "Unreadable order_reserve event: {}", e),
        }
        ConsumeResult::Success
    }
}
