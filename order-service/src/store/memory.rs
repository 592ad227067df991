use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::broker::outbox::{MemoryOutboxStore, RecordState};
use shared::broker::Message;
use shared::{ServiceError, ServiceResult};

use super::OrderStore;
use crate::models::*;

#[derive(Default)]
struct Tables {
    next_order_id: i32,
    next_line_id: i32,
    next_cart_id: i32,
    orders: Vec<Order>,
    lines: Vec<OrderLine>,
    carts: Vec<CartItem>,
}

/// In-process order tables. Outbox writes go to the shared
/// [`MemoryOutboxStore`] while the table lock is held, which stands in for
/// the single database transaction of the Postgres store.
pub struct MemoryOrderStore {
    tables: Mutex<Tables>,
    outbox: Arc<MemoryOutboxStore>,
    fail_order_writes: AtomicBool,
}

impl MemoryOrderStore {
    pub fn new(outbox: Arc<MemoryOutboxStore>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            outbox,
            fail_order_writes: AtomicBool::new(false),
        }
    }

    /// Makes `place_order` fail with a transient error, before writing
    /// anything, until reset.
    pub fn set_fail_order_writes(&self, fail: bool) {
        self.fail_order_writes.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn orders(&self) -> Vec<Order> {
        self.tables().orders.clone()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn place_order(
        &self,
        half_message_id: i64,
        draft: &OrderDraft,
        timeout: &Message,
        deliver_at: DateTime<Utc>,
    ) -> ServiceResult<Option<Order>> {
        if self.fail_order_writes.load(Ordering::SeqCst) {
            return Err(ServiceError::TransientDb("order tables unavailable".to_string()));
        }

        let mut tables = self.tables();
        // Same outcomes as the database transaction: a half-message resolved
        // elsewhere wins, and a failed insert leaves it unresolved.
        if !matches!(self.outbox.state_now(half_message_id), Some(state) if state.is_unresolved()) {
            return Ok(None);
        }
        if tables.orders.iter().any(|o| o.order_serial == draft.order_serial) {
            return Err(ServiceError::FatalDb(format!(
                "duplicate order serial {}",
                draft.order_serial
            )));
        }
        if !self.outbox.resolve_now(half_message_id, RecordState::Committed) {
            return Ok(None);
        }

        let now = Utc::now();
        tables.next_order_id += 1;
        let order = Order {
            id: tables.next_order_id,
            order_serial: draft.order_serial.clone(),
            user_id: draft.user_id,
            status: OrderStatus::PendingPayment,
            pay_type: None,
            trade_no: None,
            amount: draft.amount(),
            address: draft.address.clone(),
            signer_name: draft.signer_name.clone(),
            signer_mobile: draft.signer_mobile.clone(),
            post: draft.post.clone(),
            pay_time: None,
            created_at: now,
            updated_at: now,
        };

        for line in draft.new_lines(order.id) {
            tables.next_line_id += 1;
            let id = tables.next_line_id;
            tables.lines.push(OrderLine {
                id,
                order_id: line.order_id,
                product_id: line.product_id,
                name: line.name,
                image: line.image,
                price: line.price,
                quantity: line.quantity,
            });
        }
        tables.carts.retain(|item| !draft.cart_item_ids.contains(&item.id));
        tables.orders.push(order.clone());
        self.outbox.enqueue_now(timeout, deliver_at);

        Ok(Some(order))
    }

    async fn find_by_serial(&self, order_serial: &str) -> ServiceResult<Option<Order>> {
        Ok(self
            .tables()
            .orders
            .iter()
            .find(|o| o.order_serial == order_serial)
            .cloned())
    }

    async fn find_detail(&self, order_id: i32) -> ServiceResult<Option<OrderDetail>> {
        let tables = self.tables();
        let order = match tables.orders.iter().find(|o| o.id == order_id) {
            Some(order) => order.clone(),
            None => return Ok(None),
        };
        let mut lines: Vec<OrderLine> = tables
            .lines
            .iter()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.product_id);

        Ok(Some(OrderDetail { order, lines }))
    }

    async fn list(&self, user_id: i32, page: i64, per_page: i64) -> ServiceResult<OrderPage> {
        let tables = self.tables();
        let mut owned: Vec<&Order> = tables.orders.iter().filter(|o| o.user_id == user_id).collect();
        owned.sort_by(|a, b| b.id.cmp(&a.id));

        let orders = owned
            .iter()
            .skip(((page - 1) * per_page).max(0) as usize)
            .take(per_page.max(0) as usize)
            .map(|o| (*o).clone())
            .collect();

        Ok(OrderPage {
            total: owned.len() as i64,
            orders,
        })
    }

    async fn close_if_pending(&self, order_serial: &str, release: &Message) -> ServiceResult<CloseOutcome> {
        let mut tables = self.tables();
        let order = match tables.orders.iter_mut().find(|o| o.order_serial == order_serial) {
            Some(order) => order,
            None => return Ok(CloseOutcome::NotFound),
        };
        if order.status != OrderStatus::PendingPayment {
            return Ok(CloseOutcome::NotPending(order.status));
        }

        let now = Utc::now();
        order.status = OrderStatus::Closed;
        order.updated_at = now;
        self.outbox.enqueue_now(release, now);
        Ok(CloseOutcome::Closed)
    }

    async fn update_status(&self, order_serial: &str, update: &PaymentUpdate) -> ServiceResult<bool> {
        let mut tables = self.tables();
        let order = tables
            .orders
            .iter_mut()
            .find(|o| o.order_serial == order_serial)
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_serial)))?;

        if !check_transition(order_serial, order.status, update.status)? {
            return Ok(false);
        }

        order.status = update.status;
        if update.trade_no.is_some() {
            order.trade_no = update.trade_no.clone();
        }
        if update.pay_type.is_some() {
            order.pay_type = update.pay_type.clone();
        }
        order.pay_time = Some(update.pay_time);
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn cart_items(&self, user_id: i32) -> ServiceResult<Vec<CartItem>> {
        Ok(self
            .tables()
            .carts
            .iter()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn checked_cart_items(&self, user_id: i32) -> ServiceResult<Vec<CartItem>> {
        Ok(self
            .tables()
            .carts
            .iter()
            .filter(|item| item.user_id == user_id && item.checked)
            .cloned()
            .collect())
    }

    async fn add_cart_item(&self, user_id: i32, product_id: i32, quantity: i32) -> ServiceResult<CartItem> {
        let now = Utc::now();
        let mut tables = self.tables();

        if let Some(item) = tables
            .carts
            .iter_mut()
            .find(|item| item.user_id == user_id && item.product_id == product_id)
        {
            item.quantity += quantity;
            item.updated_at = now;
            return Ok(item.clone());
        }

        tables.next_cart_id += 1;
        let item = CartItem {
            id: tables.next_cart_id,
            user_id,
            product_id,
            quantity,
            checked: true,
            created_at: now,
            updated_at: now,
        };
        tables.carts.push(item.clone());
        Ok(item)
    }

    async fn update_cart_item(
        &self,
        id: i32,
        quantity: Option<i32>,
        checked: Option<bool>,
    ) -> ServiceResult<CartItem> {
        let mut tables = self.tables();
        let item = tables
            .carts
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| ServiceError::NotFound(format!("cart item {}", id)))?;

        if let Some(quantity) = quantity {
            item.quantity = quantity;
        }
        if let Some(checked) = checked {
            item.checked = checked;
        }
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn delete_cart_item(&self, id: i32) -> ServiceResult<()> {
        let mut tables = self.tables();
        let before = tables.carts.len();
        tables.carts.retain(|item| item.id != id);
        if tables.carts.len() == before {
            return Err(ServiceError::NotFound(format!("cart item {}", id)));
        }
        Ok(())
    }
}
