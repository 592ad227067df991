//! Local transaction and check-back behind the `order_reserve` half-message.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::broker::outbox::{deliver_at, OutboxStore};
use shared::broker::{HalfMessage, Message, Resolution, TransactionListener};
use shared::{
    OrderReservePayload, OrderSerialPayload, ReservationState, ServiceError, ServiceResult, StockLine,
    INVENTORY_REBACK_TOPIC, ORDER_TIMEOUT_TOPIC,
};
use tracing::{error, info, warn};

use crate::clients::{InventoryClient, ProductCatalog};
use crate::models::{LineDraft, Order, OrderDraft};
use crate::store::OrderStore;

pub fn release_message(order_serial: &str) -> ServiceResult<Message> {
    Message::json(
        INVENTORY_REBACK_TOPIC,
        order_serial,
        &OrderSerialPayload {
            order_serial: order_serial.to_string(),
        },
    )
}

pub fn timeout_message(order_serial: &str) -> ServiceResult<Message> {
    Message::json(
        ORDER_TIMEOUT_TOPIC,
        order_serial,
        &OrderSerialPayload {
            order_serial: order_serial.to_string(),
        },
    )
}

/// How long after its half-message a reserve may still land by default.
pub const DEFAULT_RESERVE_GRACE: Duration = Duration::from_secs(60);

enum Verdict {
    Commit(Order),
    Rollback(ServiceError),
    Unknown(ServiceError),
}

pub struct OrderReserveListener {
    store: Arc<dyn OrderStore>,
    outbox: Arc<dyn OutboxStore>,
    inventory: Arc<dyn InventoryClient>,
    catalog: Arc<dyn ProductCatalog>,
    order_timeout: Duration,
    reserve_grace: Duration,
    outcomes: Mutex<HashMap<String, ServiceResult<Order>>>,
}

impl OrderReserveListener {
    pub fn new(
        store: Arc<dyn OrderStore>,
        outbox: Arc<dyn OutboxStore>,
        inventory: Arc<dyn InventoryClient>,
        catalog: Arc<dyn ProductCatalog>,
        order_timeout: Duration,
    ) -> Self {
        Self {
            store,
            outbox,
            inventory,
            catalog,
            order_timeout,
            reserve_grace: DEFAULT_RESERVE_GRACE,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    /// Until a half-message is this old, a check-back that finds no
    /// reservation assumes the reserve may still be in flight. Must outlast
    /// the deadline sent with each reserve.
    pub fn with_reserve_grace(mut self, grace: Duration) -> Self {
        self.reserve_grace = grace;
        self
    }

    fn reserve_in_flight(&self, half: &HalfMessage, now: DateTime<Utc>) -> bool {
        now < deliver_at(half.created_at, self.reserve_grace)
    }

    fn outcomes(&self) -> MutexGuard<'_, HashMap<String, ServiceResult<Order>>> {
        self.outcomes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Result of the local transaction run for `order_serial`, handed to the
    /// caller of CreateOrder once.
    pub fn take_outcome(&self, order_serial: &str) -> Option<ServiceResult<Order>> {
        self.outcomes().remove(order_serial)
    }

    async fn draft(&self, payload: &OrderReservePayload) -> ServiceResult<OrderDraft> {
        let cart = self.store.checked_cart_items(payload.user_id).await?;
        if cart.is_empty() {
            return Err(ServiceError::InvalidArgument(format!(
                "user {} has no checked items in the cart",
                payload.user_id
            )));
        }

        let mut quantities: BTreeMap<i32, i32> = BTreeMap::new();
        for item in &cart {
            *quantities.entry(item.product_id).or_insert(0) += item.quantity;
        }
        let ids: Vec<i32> = quantities.keys().copied().collect();
        let products: HashMap<i32, _> = self
            .catalog
            .batch_get(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut lines = Vec::with_capacity(quantities.len());
        for (product_id, quantity) in quantities {
            let product = products
                .get(&product_id)
                .ok_or_else(|| ServiceError::NotFound(format!("product {}", product_id)))?;
            lines.push(LineDraft {
                product_id,
                name: product.name.clone(),
                image: product.front_image.clone(),
                price: product.shop_price.clone(),
                quantity,
            });
        }

        Ok(OrderDraft {
            order_serial: payload.order_serial.clone(),
            user_id: payload.user_id,
            address: payload.address.clone(),
            signer_name: payload.signer_name.clone(),
            signer_mobile: payload.signer_mobile.clone(),
            post: payload.post.clone(),
            lines,
            cart_item_ids: cart.iter().map(|item| item.id).collect(),
        })
    }

    async fn place(&self, half: &HalfMessage, payload: &OrderReservePayload) -> Verdict {
        let serial = payload.order_serial.as_str();

        // Nothing is reserved yet: any failure here is a plain rollback.
        let draft = match self.draft(payload).await {
            Ok(draft) => draft,
            Err(e) => return Verdict::Rollback(e),
        };

        let stock_lines: Vec<StockLine> = draft
            .lines
            .iter()
            .map(|line| StockLine {
                product_id: line.product_id,
                quantity: line.quantity,
            })
            .collect();

        if let Err(e) = self.inventory.reserve(serial, &stock_lines).await {
            return match e {
                ServiceError::OutOfStock { .. }
                | ServiceError::NotFound(_)
                | ServiceError::InvalidArgument(_)
                | ServiceError::Conflict(_) => Verdict::Rollback(e),
                other => Verdict::Unknown(other),
            };
        }

        let timeout = match timeout_message(serial) {
            Ok(message) => message,
            Err(e) => return Verdict::Unknown(e),
        };
        let due = deliver_at(Utc::now(), self.order_timeout);

        match self.store.place_order(half.id, &draft, &timeout, due).await {
            Ok(Some(order)) => Verdict::Commit(order),
            Ok(None) => self.placement_lost(serial).await,
            Err(e) => Verdict::Unknown(e),
        }
    }

    /// The half-message was resolved while the order was being placed.
    async fn placement_lost(&self, serial: &str) -> Verdict {
        match self.store.find_by_serial(serial).await {
            // Replay of an order that already exists.
            Ok(Some(order)) => return Verdict::Commit(order),
            Ok(None) => {}
            Err(e) => return Verdict::Unknown(e),
        }

        warn!(order_serial = serial, "Half-message rolled back during placement, releasing stock");
        let enqueued = match release_message(serial) {
            Ok(message) => self.outbox.enqueue(&message, Utc::now()).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = enqueued {
            warn!(order_serial = serial, error = %e, "Could not enqueue release, releasing directly");
            if let Err(e) = self.inventory.release(serial).await {
                error!(order_serial = serial, error = %e, "Reservation of a rolled back order is still held");
                return Verdict::Unknown(e);
            }
        }

        Verdict::Rollback(ServiceError::Conflict(format!(
            "order {} was rolled back while being placed",
            serial
        )))
    }
}

#[async_trait]
impl TransactionListener for OrderReserveListener {
    async fn execute_local_transaction(&self, half: &HalfMessage) -> Resolution {
        let payload: OrderReservePayload = match half.message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(id = half.id, "Undecodable order_reserve half-message: {}", e);
                return Resolution::rollback();
            }
        };

        let (resolution, outcome) = match self.place(half, &payload).await {
            Verdict::Commit(order) => {
                info!(order_serial = %payload.order_serial, order_id = order.id, "Order placed");
                (Resolution::commit(), Ok(order))
            }
            Verdict::Rollback(e) => {
                info!(order_serial = %payload.order_serial, error = %e, "Order placement rolled back");
                (Resolution::rollback(), Err(e))
            }
            Verdict::Unknown(e) => {
                warn!(order_serial = %payload.order_serial, error = %e, "Order placement undecided, leaving it to check-back");
                (Resolution::unknown(), Err(e))
            }
        };

        self.outcomes().insert(payload.order_serial, outcome);
        resolution
    }

    async fn check_local_transaction(&self, half: &HalfMessage, now: DateTime<Utc>) -> Resolution {
        let payload: OrderReservePayload = match half.message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(id = half.id, "Undecodable order_reserve half-message: {}", e);
                return Resolution::rollback();
            }
        };
        let serial = payload.order_serial.as_str();

        match self.store.find_by_serial(serial).await {
            Ok(Some(_)) => return Resolution::commit(),
            Ok(None) => {}
            Err(e) => {
                warn!(order_serial = serial, error = %e, "Check-back could not read orders");
                return Resolution::unknown();
            }
        }

        let release = match release_message(serial) {
            Ok(message) => message,
            Err(e) => {
                error!(order_serial = serial, error = %e, "Could not build release message");
                return Resolution::unknown();
            }
        };

        match self.inventory.reservation(serial).await {
            Ok(Some(info)) if info.state == ReservationState::Reserved => {
                info!(order_serial = serial, "No order for a reserved ledger entry, releasing");
                Resolution::rollback().with_follow_up(release)
            }
            Ok(Some(_)) => Resolution::rollback(),
            Ok(None) if self.reserve_in_flight(half, now) => {
                info!(order_serial = serial, "No reservation yet, the reserve may still land");
                Resolution::unknown()
            }
            Ok(None) => Resolution::rollback(),
            Err(e) if self.reserve_in_flight(half, now) => {
                warn!(order_serial = serial, error = %e, "Ledger lookup failed, checking again later");
                Resolution::unknown()
            }
            Err(e) => {
                // Release is idempotent, so sending one blind is safe.
                warn!(order_serial = serial, error = %e, "Ledger lookup failed, releasing blindly");
                Resolution::rollback().with_follow_up(release)
            }
        }
    }

    // Placing an order commits its half-message in the same transaction, so an
    // abandoned one never has an order whose stock this could take back.
    async fn abandon(&self, half: &HalfMessage) -> Resolution {
        let serial = half.message.key.as_str();
        match release_message(serial) {
            Ok(release) => {
                warn!(order_serial = serial, "Giving up on undecided order, releasing any reservation");
                Resolution::rollback().with_follow_up(release)
            }
            Err(e) => {
                error!(order_serial = serial, error = %e, "Could not build release message");
                Resolution::rollback()
            }
        }
    }
}
