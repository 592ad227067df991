mod memory;
mod pg;

pub use memory::MemoryInventoryStore;
pub use pg::PgInventoryStore;

use async_trait::async_trait;
use shared::{ServiceResult, StockLine};

use crate::models::{SellLedgerEntry, Stock};

/// Persistence of stock rows and sell-ledger entries.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Creates the row with version 0, or overwrites the quantity of an
    /// existing row keeping its version.
    async fn upsert_stock(&self, product_id: i32, quantity: i32) -> ServiceResult<Stock>;

    async fn find_stock(&self, product_id: i32) -> ServiceResult<Option<Stock>>;

    /// `quantity -= requested, version += 1` guarded by the observed version
    /// and by `quantity >= requested`. Returns false when the guard failed.
    async fn decrement_if_version(
        &self,
        product_id: i32,
        requested: i32,
        expected_version: i32,
    ) -> ServiceResult<bool>;

    /// `quantity += amount, version += 1`, unconditionally.
    async fn increment(&self, product_id: i32, amount: i32) -> ServiceResult<()>;

    async fn find_ledger(&self, order_serial: &str) -> ServiceResult<Option<SellLedgerEntry>>;

    /// Writes a RESERVED entry. Returns false if one already exists for
    /// `order_serial`, in which case nothing is written.
    async fn insert_ledger(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<bool>;

    /// In one transaction: flips a RESERVED entry to RELEASED and adds its
    /// quantities back. Returns the released entry, or `None` when there was
    /// no RESERVED entry.
    async fn release_ledger(&self, order_serial: &str) -> ServiceResult<Option<SellLedgerEntry>>;
}
