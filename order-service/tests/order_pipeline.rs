mod common;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use common::{after_timeout, order_request, Harness, LocalInventory};
use inventory_service::lock::DistributedLock;
use inventory_service::models::SellLedgerEntry;
use inventory_service::service::InventoryService;
use order_service::clients::InventoryClient;
use order_service::handlers::TimeoutHandler;
use order_service::models::OrderStatus;
use order_service::transaction::timeout_message;
use shared::broker::outbox::{MemoryOutboxStore, RecordState};
use shared::broker::{ConsumeResult, MessageHandler, Publisher, TransactionListener, TransactionState};
use shared::{
    ErrorCode, ReservationInfo, ReservationState, ServiceError, ServiceResult, StockLine, INVENTORY_REBACK_TOPIC,
    ORDER_RESERVE_TOPIC, ORDER_TIMEOUT_TOPIC,
};

async fn happy_order(h: &Harness) -> String {
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 2).await;
    h.create_order(12).await.unwrap().order_serial
}

fn reserve_record_state(h: &Harness, serial: &str) -> RecordState {
    h.outbox
        .records_for(ORDER_RESERVE_TOPIC)
        .into_iter()
        .find(|r| r.message.key == serial)
        .map(|r| r.state)
        .unwrap()
}

#[tokio::test]
async fn happy_path_reserves_stock_and_persists_order() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 2).await;

    let created = h.create_order(12).await.unwrap();

    assert_eq!(created.total, BigDecimal::from_str("25.00").unwrap());
    assert_eq!(h.stock(421).await, 98);
    let entry = h.inventory.reservation(&created.order_serial).await.unwrap();
    assert_eq!(entry.state, ReservationState::Reserved);
    assert_eq!(entry.lines, vec![StockLine { product_id: 421, quantity: 2 }]);

    let detail = h.orders.order_detail(created.id, Some(12)).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::PendingPayment);
    assert_eq!(detail.order.signer_name, "Bobby");
    assert_eq!(detail.lines.len(), 1);
    assert_eq!(detail.lines[0].price, BigDecimal::from_str("12.50").unwrap());
    assert_eq!(detail.lines[0].quantity, 2);
    assert!(h.orders.cart_items(12).await.unwrap().is_empty());

    assert_eq!(reserve_record_state(&h, &created.order_serial), RecordState::Committed);
    let timeouts = h.outbox.records_for(ORDER_TIMEOUT_TOPIC);
    assert_eq!(timeouts.len(), 1);
    assert!(timeouts[0].deliver_at > Utc::now() + chrono::Duration::minutes(29));

    h.run_until_quiet(Utc::now()).await;
    assert_eq!(h.broker.published(ORDER_RESERVE_TOPIC).len(), 1);
    assert!(h.broker.published(ORDER_TIMEOUT_TOPIC).is_empty());
}

#[tokio::test]
async fn insufficient_stock_rolls_back_without_side_effects() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 1).await;
    h.add_to_cart(12, 421, 2).await;

    let err = h.create_order(12).await.unwrap_err();

    match &err {
        ServiceError::OutOfStock { products } => assert_eq!(products, &vec![421]),
        other => panic!("expected out of stock, got {:?}", other),
    }
    assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    assert_eq!(h.stock(421).await, 1);
    assert!(h.store.orders().is_empty());
    assert!(h.inventory_store.ledger_entries().is_empty());
    assert_eq!(h.orders.cart_items(12).await.unwrap().len(), 1);

    let records = h.outbox.records_for(ORDER_RESERVE_TOPIC);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, RecordState::RolledBack);

    h.run_until_quiet(after_timeout()).await;
    assert!(h.broker.published(ORDER_RESERVE_TOPIC).is_empty());
    assert!(h.broker.published(ORDER_TIMEOUT_TOPIC).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_orders_sell_exactly_the_stock() {
    let h = Harness::new();
    h.add_product(421, "3.00");
    h.set_stock(421, 10).await;
    for user_id in 1..=20 {
        h.add_to_cart(user_id, 421, 1).await;
    }

    let mut tasks = Vec::new();
    for user_id in 1..=20 {
        let orders = h.orders.clone();
        tasks.push(tokio::spawn(async move { orders.create_order(order_request(user_id)).await }));
    }

    let mut succeeded = 0;
    let mut out_of_stock = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(ServiceError::OutOfStock { .. }) => out_of_stock += 1,
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(out_of_stock, 10);
    assert_eq!(h.stock(421).await, 0);
    assert_eq!(h.store.orders().len(), 10);

    let entries = h.inventory_store.ledger_entries();
    assert_eq!(entries.len(), 10);
    let reserved: i64 = entries.iter().map(SellLedgerEntry::total_quantity).sum();
    assert_eq!(reserved, 10);
    for order in h.store.orders() {
        assert!(entries.iter().any(|e| e.order_serial == order.order_serial));
    }
}

#[tokio::test]
async fn unpaid_order_is_closed_and_stock_restored_after_timeout() {
    let h = Harness::new();
    let serial = happy_order(&h).await;

    h.run_until_quiet(Utc::now()).await;
    let order = h.store.orders().pop().unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(h.stock(421).await, 98);

    h.run_until_quiet(after_timeout()).await;

    let order = h.store.orders().pop().unwrap();
    assert_eq!(order.status, OrderStatus::Closed);
    assert_eq!(
        h.inventory.reservation(&serial).await.unwrap().state,
        ReservationState::Released
    );
    assert_eq!(h.stock(421).await, 100);
    assert_eq!(h.broker.published(INVENTORY_REBACK_TOPIC).len(), 1);
}

#[tokio::test]
async fn payment_before_timeout_keeps_the_reservation() {
    let h = Harness::new();
    let serial = happy_order(&h).await;

    h.orders
        .update_order_status(&serial, "TRADE_SUCCESS", Some("trade-77".to_string()), Some("alipay".to_string()))
        .await
        .unwrap();
    h.run_until_quiet(after_timeout()).await;

    let order = h.store.orders().pop().unwrap();
    assert_eq!(order.status, OrderStatus::TradeSuccess);
    assert_eq!(order.trade_no.as_deref(), Some("trade-77"));
    assert_eq!(order.pay_type.as_deref(), Some("alipay"));
    assert!(order.pay_time.is_some());
    assert_eq!(h.stock(421).await, 98);
    assert_eq!(
        h.inventory.reservation(&serial).await.unwrap().state,
        ReservationState::Reserved
    );
    assert_eq!(h.broker.published(ORDER_TIMEOUT_TOPIC).len(), 1);
    assert!(h.broker.published(INVENTORY_REBACK_TOPIC).is_empty());
}

#[tokio::test]
async fn failed_order_write_is_settled_by_check_back() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 2).await;
    h.store.set_fail_order_writes(true);

    let err = h.create_order(12).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);
    assert_eq!(h.stock(421).await, 98);

    let serial = h.outbox.records_for(ORDER_RESERVE_TOPIC)[0].message.key.clone();
    assert_eq!(reserve_record_state(&h, &serial), RecordState::Unknown);

    h.store.set_fail_order_writes(false);
    // Too early: the half-message is not old enough for a check-back.
    assert_eq!(h.relay.check_unresolved(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + chrono::Duration::minutes(1);
    assert_eq!(h.relay.check_unresolved(later).await.unwrap(), 1);
    assert_eq!(reserve_record_state(&h, &serial), RecordState::RolledBack);

    h.run_until_quiet(later).await;

    assert!(h.store.orders().is_empty());
    assert_eq!(h.stock(421).await, 100);
    assert_eq!(
        h.inventory.reservation(&serial).await.unwrap().state,
        ReservationState::Released
    );
    assert!(h.broker.published(ORDER_RESERVE_TOPIC).is_empty());
    assert_eq!(h.relay.check_unresolved(later).await.unwrap(), 0);
}

#[tokio::test]
async fn replayed_local_transaction_creates_nothing_new() {
    let h = Harness::new();
    let serial = happy_order(&h).await;
    let record = h
        .outbox
        .records_for(ORDER_RESERVE_TOPIC)
        .into_iter()
        .find(|r| r.message.key == serial)
        .unwrap();

    // The cart is filled again so the replay has something to reserve.
    h.add_to_cart(12, 421, 5).await;
    for _ in 0..3 {
        let resolution = h.listener.execute_local_transaction(&record.half_message()).await;
        assert_eq!(resolution.state, TransactionState::Commit);
        assert!(h.listener.take_outcome(&serial).unwrap().is_ok());
    }

    assert_eq!(h.store.orders().len(), 1);
    assert_eq!(h.inventory_store.ledger_entries().len(), 1);
    assert_eq!(h.stock(421).await, 98);
    assert_eq!(h.outbox.records_for(ORDER_TIMEOUT_TOPIC).len(), 1);
    assert!(h.outbox.records_for(INVENTORY_REBACK_TOPIC).is_empty());
}

#[tokio::test]
async fn redelivered_timeouts_release_once() {
    let h = Harness::new();
    let serial = happy_order(&h).await;
    let handler = TimeoutHandler::new(h.orders.clone());
    let message = timeout_message(&serial).unwrap();

    for _ in 0..3 {
        assert_eq!(handler.handle(&message).await, ConsumeResult::Success);
    }
    h.run_until_quiet(Utc::now()).await;

    assert_eq!(h.outbox.records_for(INVENTORY_REBACK_TOPIC).len(), 1);
    assert_eq!(h.stock(421).await, 100);

    // Redelivering the release itself changes nothing either.
    for message in h.broker.published(INVENTORY_REBACK_TOPIC) {
        h.broker.publish(&message).await.unwrap();
    }
    h.run_until_quiet(Utc::now()).await;
    assert_eq!(h.stock(421).await, 100);
}

#[tokio::test]
async fn timeout_for_unknown_order_is_acknowledged() {
    let h = Harness::new();
    let handler = TimeoutHandler::new(h.orders.clone());

    let result = handler.handle(&timeout_message("no-such-order").unwrap()).await;

    assert_eq!(result, ConsumeResult::Success);
    assert!(h.outbox.records_for(INVENTORY_REBACK_TOPIC).is_empty());
}

#[tokio::test]
async fn closed_order_rejects_payment() {
    let h = Harness::new();
    let serial = happy_order(&h).await;
    h.run_until_quiet(after_timeout()).await;

    let err = h
        .orders
        .update_order_status(&serial, "TRADE_SUCCESS", None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(h.stock(421).await, 100);
}

#[tokio::test]
async fn status_updates_are_idempotent_and_forward_only() {
    let h = Harness::new();
    let serial = happy_order(&h).await;

    h.orders.update_order_status(&serial, "PAID", None, None).await.unwrap();
    h.orders.update_order_status(&serial, "PAID", None, None).await.unwrap();
    h.orders
        .update_order_status(&serial, "TRADE_SUCCESS", Some("t-1".to_string()), None)
        .await
        .unwrap();

    let err = h.orders.update_order_status(&serial, "PAID", None, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let err = h.orders.update_order_status(&serial, "CLOSED", None, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));

    let err = h.orders.update_order_status("missing", "PAID", None, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn empty_cart_is_rejected_before_reserving() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;

    let err = h.create_order(12).await.unwrap_err();

    assert!(matches!(err, ServiceError::InvalidArgument(_)));
    assert_eq!(h.stock(421).await, 100);
    assert_eq!(h.outbox.records_for(ORDER_RESERVE_TOPIC)[0].state, RecordState::RolledBack);
}

#[tokio::test]
async fn unchecked_cart_items_are_not_ordered() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 2).await;
    let item = h.orders.cart_items(12).await.unwrap().remove(0);
    h.orders.update_cart_item(item.id, None, Some(false)).await.unwrap();

    let err = h.create_order(12).await.unwrap_err();

    assert!(matches!(err, ServiceError::InvalidArgument(_)));
    assert_eq!(h.stock(421).await, 100);
}

#[tokio::test]
async fn unknown_product_rolls_back() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.set_stock(9, 100).await;
    h.add_to_cart(12, 421, 1).await;
    h.add_to_cart(12, 9, 1).await;

    let err = h.create_order(12).await.unwrap_err();

    assert!(matches!(err, ServiceError::NotFound(_)));
    assert_eq!(h.stock(421).await, 100);
    assert_eq!(h.stock(9).await, 100);
    assert!(h.inventory_store.ledger_entries().is_empty());
}

#[tokio::test]
async fn catalog_outage_asks_the_caller_to_retry() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 1).await;
    h.catalog.set_unavailable(true);

    let err = h.create_order(12).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::Unavailable);
    assert_eq!(h.stock(421).await, 100);
    assert_eq!(h.outbox.records_for(ORDER_RESERVE_TOPIC)[0].state, RecordState::RolledBack);
}

#[tokio::test]
async fn outbox_outage_fails_before_anything_is_reserved() {
    let h = Harness::new();
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 1).await;
    h.outbox.set_unavailable(true);

    let err = h.create_order(12).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(h.stock(421).await, 100);
    assert!(h.inventory_store.ledger_entries().is_empty());
}

/// Inventory that cannot be reached: reserves time out, lookups find nothing.
struct UnreachableInventory;

#[async_trait]
impl InventoryClient for UnreachableInventory {
    async fn reserve(&self, _order_serial: &str, _lines: &[StockLine]) -> ServiceResult<()> {
        Err(ServiceError::ServiceUnavailable("inventory unreachable: timed out".to_string()))
    }

    async fn release(&self, _order_serial: &str) -> ServiceResult<()> {
        Ok(())
    }

    async fn reservation(&self, _order_serial: &str) -> ServiceResult<Option<ReservationInfo>> {
        Ok(None)
    }
}

#[tokio::test]
async fn unreachable_inventory_is_rolled_back_by_check_back() {
    let h = Harness::with_inventory_client(|_, _| Arc::new(UnreachableInventory));
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 1).await;

    let err = h.create_order(12).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);

    let serial = h.outbox.records_for(ORDER_RESERVE_TOPIC)[0].message.key.clone();
    assert_eq!(reserve_record_state(&h, &serial), RecordState::Unknown);

    let later = Utc::now() + chrono::Duration::minutes(1);
    assert_eq!(h.relay.check_unresolved(later).await.unwrap(), 1);
    assert_eq!(reserve_record_state(&h, &serial), RecordState::RolledBack);
    assert!(h.outbox.records_for(INVENTORY_REBACK_TOPIC).is_empty());
    assert_eq!(h.orders.cart_items(12).await.unwrap().len(), 1);
}

const RPC_TIMEOUT: Duration = Duration::from_millis(50);

/// Calls the inventory the way the HTTP client does: the reserve runs on
/// its own task with a deadline, and the caller stops waiting at the timeout.
struct DeadlineInventory {
    service: Arc<InventoryService>,
}

#[async_trait]
impl InventoryClient for DeadlineInventory {
    async fn reserve(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<()> {
        let service = self.service.clone();
        let order_serial = order_serial.to_string();
        let lines = lines.to_vec();
        let deadline = Some(Utc::now() + chrono::Duration::from_std(RPC_TIMEOUT).unwrap());
        let call = tokio::spawn(async move { service.reserve_within(&order_serial, &lines, deadline).await });

        match tokio::time::timeout(RPC_TIMEOUT, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ServiceError::ServiceUnavailable(format!("inventory call failed: {}", e))),
            Err(_) => Err(ServiceError::ServiceUnavailable("inventory unreachable: timed out".to_string())),
        }
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

#[tokio::test]
async fn reserve_outliving_the_caller_leaves_no_stock_behind() {
    let h = Harness::with_inventory_client(|service, _| Arc::new(DeadlineInventory { service }));
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 1).await;
    // Another reserve holds the stock lock past the caller's timeout.
    assert!(h
        .lock
        .try_acquire("stock:421", "holder", Duration::from_millis(200))
        .await
        .unwrap());

    let err = h.create_order(12).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unavailable);
    let serial = h.outbox.records_for(ORDER_RESERVE_TOPIC)[0].message.key.clone();

    // Within the grace a missing reservation may still land.
    let soon = Utc::now() + chrono::Duration::seconds(15);
    assert_eq!(h.relay.check_unresolved(soon).await.unwrap(), 0);
    assert_eq!(reserve_record_state(&h, &serial), RecordState::Unknown);

    let later = Utc::now() + chrono::Duration::minutes(1);
    assert_eq!(h.relay.check_unresolved(later).await.unwrap(), 1);
    assert_eq!(reserve_record_state(&h, &serial), RecordState::RolledBack);

    tokio::time::sleep(Duration::from_millis(500)).await;
    h.run_until_quiet(later).await;

    assert!(h.store.orders().is_empty());
    assert_eq!(h.stock(421).await, 100);
    assert!(h.inventory_store.ledger_entries().is_empty());
    assert!(h.inventory.reservation(&serial).await.is_err());
}

/// Reserves for real, then loses the half-message to a concurrent rollback
/// before the order can be written.
struct RacingInventory {
    inner: LocalInventory,
    outbox: Arc<MemoryOutboxStore>,
    outbox_down_after: bool,
}

#[async_trait]
impl InventoryClient for RacingInventory {
    async fn reserve(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<()> {
        self.inner.reserve(order_serial, lines).await?;

        let record = self
            .outbox
            .records_for(ORDER_RESERVE_TOPIC)
            .into_iter()
            .find(|r| r.message.key == order_serial)
            .unwrap();
        assert!(self.outbox.resolve_now(record.id, RecordState::RolledBack));
        self.outbox.set_unavailable(self.outbox_down_after);
        Ok(())
    }

    async fn release(&self, order_serial: &str) -> ServiceResult<()> {
        self.inner.release(order_serial).await
    }

    async fn reservation(&self, order_serial: &str) -> ServiceResult<Option<ReservationInfo>> {
        self.inner.reservation(order_serial).await
    }
}

fn racing_harness(outbox_down_after: bool) -> Harness {
    Harness::with_inventory_client(move |service, outbox| {
        Arc::new(RacingInventory {
            inner: LocalInventory { service },
            outbox,
            outbox_down_after,
        })
    })
}

#[tokio::test]
async fn rollback_during_placement_releases_the_reservation() {
    let h = racing_harness(false);
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 2).await;

    let err = h.create_order(12).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert_eq!(h.stock(421).await, 98);

    let serial = h.outbox.records_for(ORDER_RESERVE_TOPIC)[0].message.key.clone();
    assert_eq!(reserve_record_state(&h, &serial), RecordState::RolledBack);
    let rebacks = h.outbox.records_for(INVENTORY_REBACK_TOPIC);
    assert_eq!(rebacks.len(), 1);
    assert_eq!(rebacks[0].message.key, serial);

    h.run_until_quiet(Utc::now()).await;

    assert!(h.store.orders().is_empty());
    assert_eq!(h.stock(421).await, 100);
    assert_eq!(
        h.inventory.reservation(&serial).await.unwrap().state,
        ReservationState::Released
    );
    assert_eq!(h.orders.cart_items(12).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rollback_during_placement_releases_directly_when_outbox_is_down() {
    let h = racing_harness(true);
    h.add_product(421, "12.50");
    h.set_stock(421, 100).await;
    h.add_to_cart(12, 421, 2).await;

    let err = h.create_order(12).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Aborted);

    let serial = h.outbox.records_for(ORDER_RESERVE_TOPIC)[0].message.key.clone();
    assert!(h.outbox.records_for(INVENTORY_REBACK_TOPIC).is_empty());
    assert!(h.store.orders().is_empty());
    assert_eq!(h.stock(421).await, 100);
    assert_eq!(
        h.inventory.reservation(&serial).await.unwrap().state,
        ReservationState::Released
    );
}
