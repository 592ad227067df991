use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transactional topic: the half-message of an order placement.
pub const ORDER_RESERVE_TOPIC: &str = "order_reserve";
/// Delayed topic: fires once the payment window of an order elapses.
pub const ORDER_TIMEOUT_TOPIC: &str = "order_timeout";
/// Regular topic: asks the inventory service to release a reservation.
pub const INVENTORY_REBACK_TOPIC: &str = "inventory_reback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub product_id: i32,
    pub quantity: i32,
}

/// Payload of the `order_reserve` half-message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReservePayload {
    pub order_serial: String,
    pub user_id: i32,
    pub address: String,
    pub signer_name: String,
    pub signer_mobile: String,
    pub post: String,
}

/// Payload of `order_timeout` and `inventory_reback` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSerialPayload {
    pub order_serial: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Reserved,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "RESERVED",
            ReservationState::Released => "RELEASED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RESERVED" => Some(ReservationState::Reserved),
            "RELEASED" => Some(ReservationState::Released),
            _ => None,
        }
    }
}

// Inventory HTTP contract, shared by the server and the order-side client.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStockRequest {
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockInfo {
    pub product_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub order_serial: String,
    pub lines: Vec<StockLine>,
    /// When the caller stops waiting. A reserve still running at that point
    /// is undone and never recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    pub order_serial: String,
    pub state: ReservationState,
    pub lines: Vec<StockLine>,
}
