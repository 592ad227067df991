use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{ReservationInfo, ReservationState, ServiceError, StockLine};

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stocks)]
pub struct Stock {
    pub product_id: i32,
    pub quantity: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stocks)]
pub struct NewStock {
    pub product_id: i32,
    pub quantity: i32,
    pub version: i32,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::sell_ledger)]
pub struct DbSellLedgerEntry {
    pub order_serial: String,
    pub state: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::sell_ledger)]
pub struct NewSellLedgerEntry {
    pub order_serial: String,
    pub state: String,
    pub detail: serde_json::Value,
}

/// Inventory-side record of the reservation made for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellLedgerEntry {
    pub order_serial: String,
    pub state: ReservationState,
    pub lines: Vec<StockLine>,
}

impl SellLedgerEntry {
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity as i64).sum()
    }
}

impl TryFrom<DbSellLedgerEntry> for SellLedgerEntry {
    type Error = ServiceError;

    fn try_from(row: DbSellLedgerEntry) -> Result<Self, Self::Error> {
        let state = ReservationState::parse(&row.state)
            .ok_or_else(|| ServiceError::FatalDb(format!("unknown ledger state {}", row.state)))?;
        let lines: Vec<StockLine> = serde_json::from_value(row.detail)
            .map_err(|e| ServiceError::FatalDb(format!("corrupt ledger detail: {}", e)))?;

        Ok(Self {
            order_serial: row.order_serial,
            state,
            lines,
        })
    }
}

impl From<SellLedgerEntry> for ReservationInfo {
    fn from(entry: SellLedgerEntry) -> Self {
        Self {
            order_serial: entry.order_serial,
            state: entry.state,
            lines: entry.lines,
        }
    }
}
