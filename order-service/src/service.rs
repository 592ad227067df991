use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use shared::broker::outbox::{OutboxStore, TransactionalProducer};
use shared::broker::Message;
use shared::{OrderReservePayload, ServiceError, ServiceResult, ORDER_RESERVE_TOPIC};
use tracing::info;

use crate::models::{CartItem, CloseOutcome, OrderDetail, OrderPage, OrderStatus, PaymentUpdate};
use crate::store::OrderStore;
use crate::transaction::{release_message, OrderReserveListener};

pub const DEFAULT_PER_PAGE: i64 = 10;
pub const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: i32,
    pub address: String,
    pub name: String,
    pub mobile: String,
    pub post: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub id: i32,
    pub order_serial: String,
    pub total: BigDecimal,
}

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    producer: TransactionalProducer,
    listener: Arc<OrderReserveListener>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        outbox: Arc<dyn OutboxStore>,
        listener: Arc<OrderReserveListener>,
    ) -> Self {
        Self {
            store,
            producer: TransactionalProducer::new(outbox, listener.clone()),
            listener,
        }
    }

    /// Places an order for the checked items of the user's cart. The order
    /// exists afterwards iff its stock was reserved.
    pub async fn create_order(&self, request: CreateOrderRequest) -> ServiceResult<CreatedOrder> {
        validate_create(&request)?;

        let order_serial = generate_order_serial(request.user_id, Utc::now());
        let message = Message::json(
            ORDER_RESERVE_TOPIC,
            &order_serial,
            &OrderReservePayload {
                order_serial: order_serial.clone(),
                user_id: request.user_id,
                address: request.address,
                signer_name: request.name,
                signer_mobile: request.mobile,
                post: request.post,
            },
        )?;

        let state = self.producer.send_in_transaction(message).await?;

        match self.listener.take_outcome(&order_serial) {
            Some(Ok(order)) => {
                info!(order_serial = %order.order_serial, amount = %order.amount, "Order created");
                Ok(CreatedOrder {
                    id: order.id,
                    order_serial: order.order_serial,
                    total: order.amount,
                })
            }
            Some(Err(e)) => Err(e),
            None => Err(ServiceError::FatalDb(format!(
                "no local transaction outcome for order {} ({:?})",
                order_serial, state
            ))),
        }
    }

    pub async fn order_list(
        &self,
        user_id: i32,
        page: Option<i64>,
        per_page: Option<i64>,
    ) -> ServiceResult<OrderPage> {
        let page = page.unwrap_or(1).max(1);
        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        self.store.list(user_id, page, per_page).await
    }

    /// Order with its lines. When `user_id` is given, orders of other users
    /// are reported as missing.
    pub async fn order_detail(&self, order_id: i32, user_id: Option<i32>) -> ServiceResult<OrderDetail> {
        let not_found = || ServiceError::NotFound(format!("order {}", order_id));

        let detail = self.store.find_detail(order_id).await?.ok_or_else(not_found)?;
        match user_id {
            Some(user_id) if user_id != detail.order.user_id => Err(not_found()),
            _ => Ok(detail),
        }
    }

    /// Payment callback. Only PAID and TRADE_SUCCESS may be set here; setting
    /// the status an order already has is a no-op.
    pub async fn update_order_status(
        &self,
        order_serial: &str,
        status: &str,
        trade_no: Option<String>,
        pay_type: Option<String>,
    ) -> ServiceResult<()> {
        let status = match OrderStatus::parse(status) {
            Some(status @ (OrderStatus::Paid | OrderStatus::TradeSuccess)) => status,
            _ => {
                return Err(ServiceError::InvalidArgument(format!(
                    "status {} cannot be set by a payment callback",
                    status
                )))
            }
        };

        let update = PaymentUpdate {
            status,
            trade_no,
            pay_type,
            pay_time: Utc::now(),
        };
        let changed = self.store.update_status(order_serial, &update).await?;
        info!(order_serial, status = status.as_str(), changed, "Order status updated");
        Ok(())
    }

    /// Closes the order if it is still unpaid and schedules its stock release.
    pub async fn close_expired(&self, order_serial: &str) -> ServiceResult<CloseOutcome> {
        let release = release_message(order_serial)?;
        self.store.close_if_pending(order_serial, &release).await
    }

    pub async fn cart_items(&self, user_id: i32) -> ServiceResult<Vec<CartItem>> {
        self.store.cart_items(user_id).await
    }

    pub async fn create_cart_item(&self, user_id: i32, product_id: i32, quantity: i32) -> ServiceResult<CartItem> {
        if user_id <= 0 || product_id <= 0 {
            return Err(ServiceError::InvalidArgument("user and product ids are required".to_string()));
        }
        if quantity <= 0 {
            return Err(ServiceError::InvalidArgument(format!("invalid cart quantity {}", quantity)));
        }
        self.store.add_cart_item(user_id, product_id, quantity).await
    }

    pub async fn update_cart_item(
        &self,
        id: i32,
        quantity: Option<i32>,
        checked: Option<bool>,
    ) -> ServiceResult<CartItem> {
        if matches!(quantity, Some(q) if q <= 0) {
            return Err(ServiceError::InvalidArgument("cart quantity must be positive".to_string()));
        }
        self.store.update_cart_item(id, quantity, checked).await
    }

    pub async fn delete_cart_item(&self, id: i32) -> ServiceResult<()> {
        self.store.delete_cart_item(id).await
    }
}

fn validate_create(request: &CreateOrderRequest) -> ServiceResult<()> {
    if request.user_id <= 0 {
        return Err(ServiceError::InvalidArgument(format!("invalid user id {}", request.user_id)));
    }
    for (field, value) in [
        ("address", &request.address),
        ("name", &request.name),
        ("mobile", &request.mobile),
    ] {
        if value.trim().is_empty() {
            return Err(ServiceError::InvalidArgument(format!("{} is required", field)));
        }
    }
    Ok(())
}

/// `YYYYMMDDHHMMSS` + nanoseconds + user id + a two-digit random suffix.
pub fn generate_order_serial(user_id: i32, now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(10..100);
    format!(
        "{}{}{}{}",
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_nanos(),
        user_id,
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serial_starts_with_timestamp_and_ends_with_user_and_suffix() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 8, 5, 1).unwrap();
        let serial = generate_order_serial(12, now);

        assert!(serial.starts_with("20240309080501"));
        let tail = &serial[serial.len() - 4..];
        assert_eq!(&tail[..2], "12");
        let suffix: u32 = tail[2..].parse().unwrap();
        assert!((10..100).contains(&suffix));
    }

    #[test]
    fn create_requires_shipping_fields() {
        let request = CreateOrderRequest {
            user_id: 1,
            address: "street 1".to_string(),
            name: " ".to_string(),
            mobile: "13800000000".to_string(),
            post: String::new(),
        };
        assert!(matches!(validate_create(&request), Err(ServiceError::InvalidArgument(_))));
        assert!(validate_create(&CreateOrderRequest {
            name: "bob".to_string(),
            ..request
        })
        .is_ok());
    }
}
