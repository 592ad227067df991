use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::db::DbPool;
use shared::{ReservationState, ServiceError, ServiceResult, StockLine};

use super::InventoryStore;
use crate::models::*;
use crate::schema::*;

pub struct PgInventoryStore {
    pool: DbPool,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn upsert_stock(&self, product_id: i32, quantity: i32) -> ServiceResult<Stock> {
        let mut conn = self.pool.get().await?;

        let stock = diesel::insert_into(stocks::table)
            .values(&NewStock {
                product_id,
                quantity,
                version: 0,
            })
            .on_conflict(stocks::product_id)
            .do_update()
            .set((
                stocks::quantity.eq(excluded(stocks::quantity)),
                stocks::updated_at.eq(Utc::now()),
                stocks::deleted_at.eq(None::<chrono::DateTime<Utc>>),
            ))
            .returning(Stock::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(stock)
    }

    async fn find_stock(&self, product_id: i32) -> ServiceResult<Option<Stock>> {
        let mut conn = self.pool.get().await?;

        let stock = stocks::table
            .filter(stocks::product_id.eq(product_id))
            .filter(stocks::deleted_at.is_null())
            .select(Stock::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(stock)
    }

    async fn decrement_if_version(
        &self,
        product_id: i32,
        requested: i32,
        expected_version: i32,
    ) -> ServiceResult<bool> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            stocks::table
                .filter(stocks::product_id.eq(product_id))
                .filter(stocks::version.eq(expected_version))
                .filter(stocks::quantity.ge(requested)),
        )
        .set((
            stocks::quantity.eq(stocks::quantity - requested),
            stocks::version.eq(stocks::version + 1),
            stocks::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }

    async fn increment(&self, product_id: i32, amount: i32) -> ServiceResult<()> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(stocks::table.filter(stocks::product_id.eq(product_id)))
            .set((
                stocks::quantity.eq(stocks::quantity + amount),
                stocks::version.eq(stocks::version + 1),
                stocks::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;

        if updated == 0 {
            return Err(ServiceError::NotFound(format!("stock for product {}", product_id)));
        }
        Ok(())
    }

    async fn find_ledger(&self, order_serial: &str) -> ServiceResult<Option<SellLedgerEntry>> {
        let mut conn = self.pool.get().await?;

        let row = sell_ledger::table
            .filter(sell_ledger::order_serial.eq(order_serial))
            .select(DbSellLedgerEntry::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(SellLedgerEntry::try_from).transpose()
    }

    async fn insert_ledger(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<bool> {
        let mut conn = self.pool.get().await?;

        let inserted = diesel::insert_into(sell_ledger::table)
            .values(&NewSellLedgerEntry {
                order_serial: order_serial.to_string(),
                state: ReservationState::Reserved.as_str().to_string(),
                detail: serde_json::to_value(lines)
                    .map_err(|e| ServiceError::FatalDb(format!("failed to encode ledger detail: {}", e)))?,
            })
            .on_conflict(sell_ledger::order_serial)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted == 1)
    }

    async fn release_ledger(&self, order_serial: &str) -> ServiceResult<Option<SellLedgerEntry>> {
        let mut conn = self.pool.get().await?;
        let order_serial = order_serial.to_string();

        conn.transaction::<_, ServiceError, _>(|conn| {
            Box::pin(async move {
                let row = sell_ledger::table
                    .filter(sell_ledger::order_serial.eq(&order_serial))
                    .select(DbSellLedgerEntry::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;

                let entry = match row {
                    Some(row) => SellLedgerEntry::try_from(row)?,
                    None => return Ok(None),
                };
                if entry.state != ReservationState::Reserved {
                    return Ok(None);
                }

                let now = Utc::now();
                for line in &entry.lines {
                    diesel::update(stocks::table.filter(stocks::product_id.eq(line.product_id)))
                        .set((
                            stocks::quantity.eq(stocks::quantity + line.quantity),
                            stocks::version.eq(stocks::version + 1),
                            stocks::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;
                }

                diesel::update(sell_ledger::table.filter(sell_ledger::order_serial.eq(&order_serial)))
                    .set((
                        sell_ledger::state.eq(ReservationState::Released.as_str()),
                        sell_ledger::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                Ok(Some(SellLedgerEntry {
                    state: ReservationState::Released,
                    ..entry
                }))
            })
        })
        .await
    }
}
