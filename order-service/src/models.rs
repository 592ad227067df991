use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use shared::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    TradeSuccess,
    Closed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::TradeSuccess => "TRADE_SUCCESS",
            OrderStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING_PAYMENT" => Some(OrderStatus::PendingPayment),
            "PAID" => Some(OrderStatus::Paid),
            "TRADE_SUCCESS" => Some(OrderStatus::TradeSuccess),
            "CLOSED" => Some(OrderStatus::Closed),
            _ => None,
        }
    }

    /// Forward edges of the order lifecycle. Staying put is not a transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::PendingPayment, OrderStatus::Paid)
                | (OrderStatus::PendingPayment, OrderStatus::TradeSuccess)
                | (OrderStatus::PendingPayment, OrderStatus::Closed)
                | (OrderStatus::Paid, OrderStatus::TradeSuccess)
        )
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: i32,
    pub order_serial: String,
    pub user_id: i32,
    pub status: String,
    pub pay_type: Option<String>,
    pub trade_no: Option<String>,
    pub amount: BigDecimal,
    pub address: String,
    pub signer_name: String,
    pub signer_mobile: String,
    pub post: String,
    pub pay_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub order_serial: String,
    pub user_id: i32,
    pub status: String,
    pub amount: BigDecimal,
    pub address: String,
    pub signer_name: String,
    pub signer_mobile: String,
    pub post: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i32,
    pub order_serial: String,
    pub user_id: i32,
    pub status: OrderStatus,
    pub pay_type: Option<String>,
    pub trade_no: Option<String>,
    pub amount: BigDecimal,
    pub address: String,
    pub signer_name: String,
    pub signer_mobile: String,
    pub post: String,
    pub pay_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbOrder> for Order {
    type Error = ServiceError;

    fn try_from(row: DbOrder) -> Result<Self, Self::Error> {
        let status = OrderStatus::parse(&row.status).ok_or_else(|| {
            ServiceError::FatalDb(format!("order {} has unknown status {}", row.order_serial, row.status))
        })?;

        Ok(Self {
            id: row.id,
            order_serial: row.order_serial,
            user_id: row.user_id,
            status,
            pay_type: row.pay_type,
            trade_no: row.trade_no,
            amount: row.amount,
            address: row.address,
            signer_name: row.signer_name,
            signer_mobile: row.signer_mobile,
            post: row.post,
            pay_time: row.pay_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct OrderLine {
    pub id: i32,
    pub order_id: i32,
    pub product_id: i32,
    pub name: String,
    pub image: String,
    pub price: BigDecimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct NewOrderLine {
    pub order_id: i32,
    pub product_id: i32,
    pub name: String,
    pub image: String,
    pub price: BigDecimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::shopping_carts)]
pub struct CartItem {
    pub id: i32,
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub checked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::shopping_carts)]
pub struct NewCartItem {
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub checked: bool,
}

/// Line of an order about to be placed, priced at order time.
#[derive(Debug, Clone, PartialEq)]
pub struct LineDraft {
    pub product_id: i32,
    pub name: String,
    pub image: String,
    pub price: BigDecimal,
    pub quantity: i32,
}

/// Everything the order transaction writes for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub order_serial: String,
    pub user_id: i32,
    pub address: String,
    pub signer_name: String,
    pub signer_mobile: String,
    pub post: String,
    pub lines: Vec<LineDraft>,
    /// Cart rows consumed by this order.
    pub cart_item_ids: Vec<i32>,
}

impl OrderDraft {
    pub fn amount(&self) -> BigDecimal {
        self.lines
            .iter()
            .fold(BigDecimal::zero(), |total, line| {
                total + &line.price * BigDecimal::from(line.quantity)
            })
    }

    pub fn new_order(&self) -> NewOrder {
        NewOrder {
            order_serial: self.order_serial.clone(),
            user_id: self.user_id,
            status: OrderStatus::PendingPayment.as_str().to_string(),
            amount: self.amount(),
            address: self.address.clone(),
            signer_name: self.signer_name.clone(),
            signer_mobile: self.signer_mobile.clone(),
            post: self.post.clone(),
        }
    }

    pub fn new_lines(&self, order_id: i32) -> Vec<NewOrderLine> {
        self.lines
            .iter()
            .map(|line| NewOrderLine {
                order_id,
                product_id: line.product_id,
                name: line.name.clone(),
                image: line.image.clone(),
                price: line.price.clone(),
                quantity: line.quantity,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderDetail {
    pub order: Order,
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPage {
    pub total: i64,
    pub orders: Vec<Order>,
}

/// Fields written by the payment callback.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub status: OrderStatus,
    pub trade_no: Option<String>,
    pub pay_type: Option<String>,
    pub pay_time: DateTime<Utc>,
}

/// Result of the timeout consumer's guarded close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    NotPending(OrderStatus),
    NotFound,
}

/// Validates a requested status change. `Ok(false)` means the order already
/// has that status.
pub fn check_transition(order_serial: &str, current: OrderStatus, next: OrderStatus) -> ServiceResult<bool> {
    if current == next {
        return Ok(false);
    }
    if !current.can_transition_to(next) {
        return Err(ServiceError::Conflict(format!(
            "order {} cannot move from {} to {}",
            order_serial,
            current.as_str(),
            next.as_str()
        )));
    }
    Ok(true)
}
