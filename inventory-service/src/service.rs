use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::{ServiceError, ServiceResult, StockInfo, StockLine};
use tracing::{error, info, warn};

use crate::lock::StockLocks;
use crate::models::{SellLedgerEntry, Stock};
use crate::store::InventoryStore;

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Optimistic-lock losses tolerated per line before a reserve gives up.
    pub cas_max_retries: u32,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self { cas_max_retries: 5 }
    }
}

pub struct InventoryService {
    store: Arc<dyn InventoryStore>,
    locks: StockLocks,
    config: InventoryConfig,
}

impl InventoryService {
    pub fn new(store: Arc<dyn InventoryStore>, locks: StockLocks, config: InventoryConfig) -> Self {
        Self { store, locks, config }
    }

    pub async fn set_stock(&self, product_id: i32, quantity: i32) -> ServiceResult<Stock> {
        if product_id <= 0 {
            return Err(ServiceError::InvalidArgument(format!("invalid product id {}", product_id)));
        }
        if quantity < 0 {
            return Err(ServiceError::InvalidArgument(format!(
                "stock quantity must not be negative, got {}",
                quantity
            )));
        }

        let stock = self.store.upsert_stock(product_id, quantity).await?;
        info!(product_id, quantity, version = stock.version, "Stock set");
        Ok(stock)
    }

    pub async fn read_stock(&self, product_id: i32) -> ServiceResult<StockInfo> {
        let stock = self
            .store
            .find_stock(product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("stock for product {}", product_id)))?;

        Ok(StockInfo {
            product_id: stock.product_id,
            quantity: stock.quantity,
        })
    }

    pub async fn reservation(&self, order_serial: &str) -> ServiceResult<SellLedgerEntry> {
        self.store
            .find_ledger(order_serial)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("reservation for order {}", order_serial)))
    }

    /// Deducts every line and records one sell-ledger entry for
    /// `order_serial`. Has at most one effect per order serial; a failed
    /// reserve leaves stock as it found it.
    pub async fn reserve(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<()> {
        self.reserve_within(order_serial, lines, None).await
    }

    /// [`reserve`](Self::reserve) on behalf of a caller that stops waiting at
    /// `deadline`. Work still in flight then is undone, and the ledger entry
    /// is never written after the deadline.
    pub async fn reserve_within(
        &self,
        order_serial: &str,
        lines: &[StockLine],
        deadline: Option<DateTime<Utc>>,
    ) -> ServiceResult<()> {
        let lines = normalize_lines(order_serial, lines)?;

        if self.store.find_ledger(order_serial).await?.is_some() {
            info!(order_serial, "Reservation already recorded, skipping");
            return Ok(());
        }

        let mut deducted: Vec<StockLine> = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if let Err(e) = self.deduct(order_serial, line, deadline).await {
                let e = match e {
                    ServiceError::OutOfStock { mut products } => {
                        products.extend(self.short_lines(&lines[index + 1..]).await);
                        ServiceError::OutOfStock { products }
                    }
                    other => other,
                };
                warn!(order_serial, product_id = line.product_id, error = %e, "Reserve failed, undoing deducted lines");
                self.undo(order_serial, &deducted).await;
                return Err(e);
            }
            deducted.push(*line);
        }

        if let Err(e) = time_left(order_serial, deadline) {
            warn!(order_serial, "Caller deadline passed before recording the reservation, undoing");
            self.undo(order_serial, &deducted).await;
            return Err(e);
        }

        match self.store.insert_ledger(order_serial, &lines).await {
            Ok(true) => {
                info!(order_serial, lines = lines.len(), "Stock reserved");
                Ok(())
            }
            Ok(false) => {
                info!(order_serial, "Concurrent duplicate reserve, undoing");
                self.undo(order_serial, &deducted).await;
                Ok(())
            }
            Err(e) => {
                error!(order_serial, error = %e, "Failed to write sell-ledger entry, undoing");
                self.undo(order_serial, &deducted).await;
                Err(e)
            }
        }
    }

    /// Gives back the stock reserved for `order_serial`. Succeeds without
    /// effect when there is no reservation or it was already released.
    /// Returns whether stock was restored.
    pub async fn release(&self, order_serial: &str) -> ServiceResult<bool> {
        let entry = match self.store.find_ledger(order_serial).await? {
            Some(entry) if entry.state == shared::ReservationState::Reserved => entry,
            Some(_) => {
                info!(order_serial, "Reservation already released");
                return Ok(false);
            }
            None => {
                info!(order_serial, "No reservation to release");
                return Ok(false);
            }
        };

        let product_ids: Vec<i32> = entry.lines.iter().map(|l| l.product_id).collect();
        let handles = self.locks.acquire_all(&product_ids).await?;
        let released = self.store.release_ledger(order_serial).await;
        self.locks.release_all(handles).await;

        match released? {
            Some(entry) => {
                info!(order_serial, quantity = entry.total_quantity(), "Reservation released");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read-check-CAS of one line under its product lock, retried while the
    /// version keeps moving.
    async fn deduct(
        &self,
        order_serial: &str,
        line: &StockLine,
        deadline: Option<DateTime<Utc>>,
    ) -> ServiceResult<()> {
        for attempt in 1..=self.config.cas_max_retries {
            let limit = time_left(order_serial, deadline)?;
            let handle = match self.locks.acquire_within(line.product_id, limit).await {
                Ok(handle) => handle,
                Err(ServiceError::LockTimeout(key)) => {
                    // A wait cut short by the deadline reports the deadline.
                    time_left(order_serial, deadline)?;
                    return Err(ServiceError::LockTimeout(key));
                }
                Err(e) => return Err(e),
            };
            let outcome = self.try_deduct(line).await;
            self.locks.release(handle).await;

            if outcome? {
                return Ok(());
            }
            warn!(product_id = line.product_id, attempt, "Stock version moved, retrying");
        }

        Err(ServiceError::Conflict(format!(
            "gave up on product {} after {} optimistic retries",
            line.product_id, self.config.cas_max_retries
        )))
    }

    async fn try_deduct(&self, line: &StockLine) -> ServiceResult<bool> {
        let stock = self
            .store
            .find_stock(line.product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("stock for product {}", line.product_id)))?;

        if stock.quantity < line.quantity {
            return Err(ServiceError::OutOfStock {
                products: vec![line.product_id],
            });
        }

        self.store
            .decrement_if_version(line.product_id, line.quantity, stock.version)
            .await
    }

    /// Products among `lines` that could not be served right now.
    async fn short_lines(&self, lines: &[StockLine]) -> Vec<i32> {
        let mut short = Vec::new();
        for line in lines {
            if let Ok(Some(stock)) = self.store.find_stock(line.product_id).await {
                if stock.quantity < line.quantity {
                    short.push(line.product_id);
                }
            }
        }
        short
    }

    async fn undo(&self, order_serial: &str, deducted: &[StockLine]) {
        for line in deducted {
            let mut restored = false;
            for attempt in 1..=self.config.cas_max_retries {
                match self.restore(line).await {
                    Ok(()) => {
                        restored = true;
                        break;
                    }
                    Err(e) => warn!(order_serial, product_id = line.product_id, attempt, error = %e, "Undo attempt failed"),
                }
            }
            if !restored {
                error!(order_serial, product_id = line.product_id, quantity = line.quantity, "Could not give back deducted stock");
            }
        }
    }

    async fn restore(&self, line: &StockLine) -> ServiceResult<()> {
        let handle = self.locks.acquire(line.product_id).await?;
        let result = self.store.increment(line.product_id, line.quantity).await;
        self.locks.release(handle).await;
        result
    }
}

/// Time the caller is still willing to wait; `None` when it set no deadline.
fn time_left(order_serial: &str, deadline: Option<DateTime<Utc>>) -> ServiceResult<Option<Duration>> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };
    match (deadline - Utc::now()).to_std() {
        Ok(left) if !left.is_zero() => Ok(Some(left)),
        _ => Err(ServiceError::DeadlineExceeded(format!("reserve for order {}", order_serial))),
    }
}

/// Validates the request and merges repeated products, ascending by product
/// id so concurrent reserves always lock in the same order.
fn normalize_lines(order_serial: &str, lines: &[StockLine]) -> ServiceResult<Vec<StockLine>> {
    if order_serial.trim().is_empty() {
        return Err(ServiceError::InvalidArgument("order serial is required".to_string()));
    }
    if lines.is_empty() {
        return Err(ServiceError::InvalidArgument("no lines to reserve".to_string()));
    }

    let mut merged: BTreeMap<i32, i32> = BTreeMap::new();
    for line in lines {
        if line.product_id <= 0 || line.quantity <= 0 {
            return Err(ServiceError::InvalidArgument(format!(
                "invalid line: product {} quantity {}",
                line.product_id, line.quantity
            )));
        }
        let quantity = merged.entry(line.product_id).or_insert(0);
        *quantity = quantity
            .checked_add(line.quantity)
            .ok_or_else(|| ServiceError::InvalidArgument("line quantity overflow".to_string()))?;
    }

    Ok(merged
        .into_iter()
        .map(|(product_id, quantity)| StockLine { product_id, quantity })
        .collect())
}
