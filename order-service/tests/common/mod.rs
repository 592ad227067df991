#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use inventory_service::handlers::ReleaseHandler;
use inventory_service::lock::{LockSettings, MemoryLock, StockLocks};
use inventory_service::service::{InventoryConfig, InventoryService};
use inventory_service::store::MemoryInventoryStore;
use order_service::clients::{InventoryClient, MemoryCatalog, ProductInfo};
use order_service::handlers::{ReserveAuditHandler, TimeoutHandler};
use order_service::service::{CreateOrderRequest, CreatedOrder, OrderService};
use order_service::store::MemoryOrderStore;
use order_service::transaction::OrderReserveListener;
use shared::broker::memory::MemoryBroker;
use shared::broker::outbox::{MemoryOutboxStore, OutboxRelay, RelayConfig};
use shared::{
    ReservationInfo, ServiceError, ServiceResult, StockLine, INVENTORY_REBACK_TOPIC, ORDER_RESERVE_TOPIC,
    ORDER_TIMEOUT_TOPIC,
};

pub const ORDER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const RESERVE_GRACE: Duration = Duration::from_secs(30);

/// Inventory service called in-process instead of over HTTP.
pub struct LocalInventory {
    pub service: Arc<InventoryService>,
}

#[async_trait]
impl InventoryClient for LocalInventory {
    async fn reserve(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<()> {
        self.service.reserve(order_serial, lines).await
    }

    async fn release(&self, order_serial: &str) -> ServiceResult<()> {
        self.service.release(order_serial).await.map(|_| ())
    }

    async fn reservation(&self, order_serial: &str) -> ServiceResult<Option<ReservationInfo>> {
        match self.service.reservation(order_serial).await {
            Ok(entry) => Ok(Some(entry.into())),
            Err(ServiceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Both services wired over in-memory stores, outbox and broker.
pub struct Harness {
    pub inventory: Arc<InventoryService>,
    pub inventory_store: Arc<MemoryInventoryStore>,
    pub lock: Arc<MemoryLock>,
    pub outbox: Arc<MemoryOutboxStore>,
    pub store: Arc<MemoryOrderStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub broker: Arc<MemoryBroker>,
    pub listener: Arc<OrderReserveListener>,
    pub relay: OutboxRelay,
    pub orders: Arc<OrderService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_inventory_client(|service, _| Arc::new(LocalInventory { service }))
    }

    /// Puts the client built by `client` in front of the inventory instead
    /// of calling it directly.
    pub fn with_inventory_client(
        client: impl FnOnce(Arc<InventoryService>, Arc<MemoryOutboxStore>) -> Arc<dyn InventoryClient>,
    ) -> Self {
        let inventory_store = Arc::new(MemoryInventoryStore::new());
        let lock = Arc::new(MemoryLock::new());
        let inventory = Arc::new(InventoryService::new(
            inventory_store.clone(),
            StockLocks::new(lock.clone(), LockSettings::default()),
            InventoryConfig::default(),
        ));

        let outbox = Arc::new(MemoryOutboxStore::new());
        let client = client(inventory.clone(), outbox.clone());
        let store = Arc::new(MemoryOrderStore::new(outbox.clone()));
        let catalog = Arc::new(MemoryCatalog::new());
        let listener = Arc::new(OrderReserveListener::new(
            store.clone(),
            outbox.clone(),
            client,
            catalog.clone(),
            ORDER_TIMEOUT,
        )
        .with_reserve_grace(RESERVE_GRACE));
        let orders = Arc::new(OrderService::new(store.clone(), outbox.clone(), listener.clone()));

        let broker = Arc::new(MemoryBroker::new());
        broker.subscribe(INVENTORY_REBACK_TOPIC, Arc::new(ReleaseHandler::new(inventory.clone())));
        broker.subscribe(ORDER_TIMEOUT_TOPIC, Arc::new(TimeoutHandler::new(orders.clone())));
        broker.subscribe(ORDER_RESERVE_TOPIC, Arc::new(ReserveAuditHandler));

        let relay = OutboxRelay::new(outbox.clone(), broker.clone(), RelayConfig::default())
            .with_listener(ORDER_RESERVE_TOPIC, listener.clone());

        Self {
            inventory,
            inventory_store,
            lock,
            outbox,
            store,
            catalog,
            broker,
            listener,
            relay,
            orders,
        }
    }

    pub fn add_product(&self, id: i32, price: &str) {
        self.catalog.insert(ProductInfo {
            id,
            name: format!("product {}", id),
            front_image: format!("https://img.example.com/{}.png", id),
            shop_price: BigDecimal::from_str(price).unwrap(),
        });
    }

    pub async fn set_stock(&self, product_id: i32, quantity: i32) {
        self.inventory.set_stock(product_id, quantity).await.unwrap();
    }

    pub async fn stock(&self, product_id: i32) -> i32 {
        self.inventory.read_stock(product_id).await.unwrap().quantity
    }

    pub async fn add_to_cart(&self, user_id: i32, product_id: i32, quantity: i32) {
        self.orders
            .create_cart_item(user_id, product_id, quantity)
            .await
            .unwrap();
    }

    pub async fn create_order(&self, user_id: i32) -> ServiceResult<CreatedOrder> {
        self.orders.create_order(order_request(user_id)).await
    }

    /// Publishes whatever the outbox has due at `now` and delivers it, until
    /// nothing moves any more.
    pub async fn run_until_quiet(&self, now: DateTime<Utc>) {
        for _ in 0..10 {
            let published = self.relay.publish_due(now).await.unwrap();
            let delivered = self.broker.drain(10).await;
            if published == 0 && delivered == 0 {
                break;
            }
        }
    }
}

pub fn order_request(user_id: i32) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id,
        address: "No. 1 Main Street".to_string(),
        name: "Bobby".to_string(),
        mobile: "13800138000".to_string(),
        post: "leave at the door".to_string(),
    }
}

pub fn after_timeout() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::minutes(31)
}
