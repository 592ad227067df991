mod memory;
mod pg;

pub use memory::MemoryOrderStore;
pub use pg::PgOrderStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::broker::Message;
use shared::ServiceResult;

use crate::models::{CartItem, CloseOutcome, Order, OrderDetail, OrderDraft, OrderPage, PaymentUpdate};

/// Persistence of orders, order lines and shopping carts. Shares its
/// database with the outbox so order writes and messages commit together.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// The order transaction of the reserve pipeline. In one transaction:
    /// moves half-message `half_message_id` to COMMITTED, inserts the order
    /// and its lines, deletes the consumed cart rows and enqueues `timeout`
    /// for delivery at `deliver_at`.
    ///
    /// Returns `None`, writing nothing, when the half-message was already
    /// resolved (for instance rolled back by a check-back).
    async fn place_order(
        &self,
        half_message_id: i64,
        draft: &OrderDraft,
        timeout: &Message,
        deliver_at: DateTime<Utc>,
    ) -> ServiceResult<Option<Order>>;

    async fn find_by_serial(&self, order_serial: &str) -> ServiceResult<Option<Order>>;

    async fn find_detail(&self, order_id: i32) -> ServiceResult<Option<OrderDetail>>;

    /// Orders of `user_id`, newest first. `page` starts at 1.
    async fn list(&self, user_id: i32, page: i64, per_page: i64) -> ServiceResult<OrderPage>;

    /// CAS PENDING_PAYMENT -> CLOSED; on success `release` is enqueued in the
    /// same transaction.
    async fn close_if_pending(&self, order_serial: &str, release: &Message) -> ServiceResult<CloseOutcome>;

    /// Applies a payment status change. Returns false when the order already
    /// had that status.
    async fn update_status(&self, order_serial: &str, update: &PaymentUpdate) -> ServiceResult<bool>;

    async fn cart_items(&self, user_id: i32) -> ServiceResult<Vec<CartItem>>;

    async fn checked_cart_items(&self, user_id: i32) -> ServiceResult<Vec<CartItem>>;

    /// Adds `quantity` of a product to the cart, merging with an existing row.
    async fn add_cart_item(&self, user_id: i32, product_id: i32, quantity: i32) -> ServiceResult<CartItem>;

    async fn update_cart_item(
        &self,
        id: i32,
        quantity: Option<i32>,
        checked: Option<bool>,
    ) -> ServiceResult<CartItem>;

    async fn delete_cart_item(&self, id: i32) -> ServiceResult<()>;
}
