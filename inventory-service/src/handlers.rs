use std::sync::Arc;

use async_trait::async_trait;
use shared::broker::{ConsumeResult, Message, MessageHandler};
use shared::OrderSerialPayload;
use tracing::{error, info, warn};

use crate::service::InventoryService;

/// Consumer of `inventory_reback`: releases the reservation named by each message.
pub struct ReleaseHandler {
    service: Arc<InventoryService>,
}

impl ReleaseHandler {
    pub fn new(service: Arc<InventoryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for ReleaseHandler {
    async fn handle(&self, message: &Message) -> ConsumeResult {
        let payload: OrderSerialPayload = match message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                // Redelivery cannot fix a payload without an order serial.
                error!(key = %message.key, "Discarding malformed release message: {}", e);
                return ConsumeResult::Success;
            }
        };

        match self.service.release(&payload.order_serial).await {
            Ok(restored) => {
                info!(order_serial = %payload.order_serial, restored, "Release message processed");
                ConsumeResult::Success
            }
            Err(e) => {
                warn!(order_serial = %payload.order_serial, error = %e, "Release failed, asking for redelivery");
                ConsumeResult::RetryLater
            }
        }
    }
}
