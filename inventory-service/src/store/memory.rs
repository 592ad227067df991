use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use shared::{ReservationState, ServiceError, ServiceResult, StockLine};

use super::InventoryStore;
use crate::models::{SellLedgerEntry, Stock};

#[derive(Default)]
struct Tables {
    stocks: BTreeMap<i32, Stock>,
    ledger: HashMap<String, SellLedgerEntry>,
}

/// In-process inventory tables, used by tests and local runs.
#[derive(Default)]
pub struct MemoryInventoryStore {
    tables: Mutex<Tables>,
    fail_ledger_writes: AtomicBool,
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `insert_ledger` fail with a transient error until reset.
    pub fn set_fail_ledger_writes(&self, fail: bool) {
        self.fail_ledger_writes.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ledger_entries(&self) -> Vec<SellLedgerEntry> {
        self.tables().ledger.values().cloned().collect()
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn upsert_stock(&self, product_id: i32, quantity: i32) -> ServiceResult<Stock> {
        let now = Utc::now();
        let mut tables = self.tables();
        let stock = tables.stocks.entry(product_id).or_insert_with(|| Stock {
            product_id,
            quantity,
            version: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });
        stock.quantity = quantity;
        stock.updated_at = now;
        stock.deleted_at = None;
        Ok(stock.clone())
    }

    async fn find_stock(&self, product_id: i32) -> ServiceResult<Option<Stock>> {
        Ok(self
            .tables()
            .stocks
            .get(&product_id)
            .filter(|s| s.deleted_at.is_none())
            .cloned())
    }

    async fn decrement_if_version(
        &self,
        product_id: i32,
        requested: i32,
        expected_version: i32,
    ) -> ServiceResult<bool> {
        let mut tables = self.tables();
        match tables.stocks.get_mut(&product_id) {
            Some(stock) if stock.version == expected_version && stock.quantity >= requested => {
                stock.quantity -= requested;
                stock.version += 1;
                stock.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, product_id: i32, amount: i32) -> ServiceResult<()> {
        let mut tables = self.tables();
        let stock = tables
            .stocks
            .get_mut(&product_id)
            .ok_or_else(|| ServiceError::NotFound(format!("stock for product {}", product_id)))?;
        stock.quantity += amount;
        stock.version += 1;
        stock.updated_at = Utc::now();
        Ok(())
    }

    async fn find_ledger(&self, order_serial: &str) -> ServiceResult<Option<SellLedgerEntry>> {
        Ok(self.tables().ledger.get(order_serial).cloned())
    }

    async fn insert_ledger(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<bool> {
        if self.fail_ledger_writes.load(Ordering::SeqCst) {
            return Err(ServiceError::TransientDb("ledger write failed".to_string()));
        }
        let mut tables = self.tables();
        if tables.ledger.contains_key(order_serial) {
            return Ok(false);
        }
        tables.ledger.insert(
            order_serial.to_string(),
            SellLedgerEntry {
                order_serial: order_serial.to_string(),
                state: ReservationState::Reserved,
                lines: lines.to_vec(),
            },
        );
        Ok(true)
    }

    async fn release_ledger(&self, order_serial: &str) -> ServiceResult<Option<SellLedgerEntry>> {
        let mut tables = self.tables();
        let lines = match tables.ledger.get(order_serial) {
            Some(entry) if entry.state == ReservationState::Reserved => entry.lines.clone(),
            _ => return Ok(None),
        };

        let now = Utc::now();
        for line in &lines {
            if let Some(stock) = tables.stocks.get_mut(&line.product_id) {
                stock.quantity += line.quantity;
                stock.version += 1;
                stock.updated_at = now;
            }
        }

        let entry = tables
            .ledger
            .get_mut(order_serial)
            .ok_or_else(|| ServiceError::FatalDb("ledger entry vanished".to_string()))?;
        entry.state = ReservationState::Released;
        Ok(Some(entry.clone()))
    }
}
