use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::broker::outbox::{enqueue_in, resolve_in, RecordState};
use shared::broker::Message;
use shared::db::DbPool;
use shared::{ServiceError, ServiceResult};

use super::OrderStore;
use crate::models::*;
use crate::schema::*;

pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn place_order(
        &self,
        half_message_id: i64,
        draft: &OrderDraft,
        timeout: &Message,
        deliver_at: DateTime<Utc>,
    ) -> ServiceResult<Option<Order>> {
        let mut conn = self.pool.get().await?;
        let draft = draft.clone();
        let timeout = timeout.clone();

        conn.transaction::<_, ServiceError, _>(|conn| {
            Box::pin(async move {
                if !resolve_in(conn, half_message_id, RecordState::Committed).await? {
                    return Ok(None);
                }

                let row: DbOrder = diesel::insert_into(orders::table)
                    .values(&draft.new_order())
                    .returning(DbOrder::as_returning())
                    .get_result(conn)
                    .await?;

                diesel::insert_into(order_lines::table)
                    .values(&draft.new_lines(row.id))
                    .execute(conn)
                    .await?;

                diesel::delete(shopping_carts::table.filter(shopping_carts::id.eq_any(&draft.cart_item_ids)))
                    .execute(conn)
                    .await?;

                enqueue_in(conn, &timeout, deliver_at).await?;

                Ok(Some(Order::try_from(row)?))
            })
        })
        .await
    }

    async fn find_by_serial(&self, order_serial: &str) -> ServiceResult<Option<Order>> {
        let mut conn = self.pool.get().await?;

        let row = orders::table
            .filter(orders::order_serial.eq(order_serial))
            .select(DbOrder::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(Order::try_from).transpose()
    }

    async fn find_detail(&self, order_id: i32) -> ServiceResult<Option<OrderDetail>> {
        let mut conn = self.pool.get().await?;

        let row = orders::table
            .filter(orders::id.eq(order_id))
            .select(DbOrder::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        let order = match row {
            Some(row) => Order::try_from(row)?,
            None => return Ok(None),
        };

        let lines = order_lines::table
            .filter(order_lines::order_id.eq(order.id))
            .order(order_lines::product_id.asc())
            .select(OrderLine::as_select())
            .load(&mut conn)
            .await?;

        Ok(Some(OrderDetail { order, lines }))
    }

    async fn list(&self, user_id: i32, page: i64, per_page: i64) -> ServiceResult<OrderPage> {
        let mut conn = self.pool.get().await?;

        let total = orders::table
            .filter(orders::user_id.eq(user_id))
            .count()
            .get_result(&mut conn)
            .await?;

        let rows = orders::table
            .filter(orders::user_id.eq(user_id))
            .order(orders::id.desc())
            .offset((page - 1) * per_page)
            .limit(per_page)
            .select(DbOrder::as_select())
            .load(&mut conn)
            .await?;

        let orders = rows
            .into_iter()
            .map(Order::try_from)
            .collect::<ServiceResult<Vec<_>>>()?;

        Ok(OrderPage { total, orders })
    }

    async fn close_if_pending(&self, order_serial: &str, release: &Message) -> ServiceResult<CloseOutcome> {
        let mut conn = self.pool.get().await?;
        let order_serial = order_serial.to_string();
        let release = release.clone();

        conn.transaction::<_, ServiceError, _>(|conn| {
            Box::pin(async move {
                let now = Utc::now();
                let closed = diesel::update(
                    orders::table
                        .filter(orders::order_serial.eq(&order_serial))
                        .filter(orders::status.eq(OrderStatus::PendingPayment.as_str())),
                )
                .set((
                    orders::status.eq(OrderStatus::Closed.as_str()),
                    orders::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                if closed == 1 {
                    enqueue_in(conn, &release, now).await?;
                    return Ok(CloseOutcome::Closed);
                }

                let status: Option<String> = orders::table
                    .filter(orders::order_serial.eq(&order_serial))
                    .select(orders::status)
                    .first(conn)
                    .await
                    .optional()?;

                Ok(match status.as_deref().and_then(OrderStatus::parse) {
                    Some(status) => CloseOutcome::NotPending(status),
                    None => CloseOutcome::NotFound,
                })
            })
        })
        .await
    }

    async fn update_status(&self, order_serial: &str, update: &PaymentUpdate) -> ServiceResult<bool> {
        let mut conn = self.pool.get().await?;
        let order_serial = order_serial.to_string();
        let update = update.clone();

        conn.transaction::<_, ServiceError, _>(|conn| {
            Box::pin(async move {
                let row = orders::table
                    .filter(orders::order_serial.eq(&order_serial))
                    .select(DbOrder::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_serial)))?;
                let current = Order::try_from(row)?;

                if !check_transition(&order_serial, current.status, update.status)? {
                    return Ok(false);
                }

                diesel::update(orders::table.filter(orders::id.eq(current.id)))
                    .set((
                        orders::status.eq(update.status.as_str()),
                        orders::trade_no.eq(update.trade_no.or(current.trade_no)),
                        orders::pay_type.eq(update.pay_type.or(current.pay_type)),
                        orders::pay_time.eq(Some(update.pay_time)),
                        orders::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                Ok(true)
            })
        })
        .await
    }

    async fn cart_items(&self, user_id: i32) -> ServiceResult<Vec<CartItem>> {
        let mut conn = self.pool.get().await?;

        let items = shopping_carts::table
            .filter(shopping_carts::user_id.eq(user_id))
            .order(shopping_carts::id.asc())
            .select(CartItem::as_select())
            .load(&mut conn)
            .await?;

        Ok(items)
    }

    async fn checked_cart_items(&self, user_id: i32) -> ServiceResult<Vec<CartItem>> {
        let mut conn = self.pool.get().await?;

        let items = shopping_carts::table
            .filter(shopping_carts::user_id.eq(user_id))
            .filter(shopping_carts::checked.eq(true))
            .order(shopping_carts::id.asc())
            .select(CartItem::as_select())
            .load(&mut conn)
            .await?;

        Ok(items)
    }

    async fn add_cart_item(&self, user_id: i32, product_id: i32, quantity: i32) -> ServiceResult<CartItem> {
        let mut conn = self.pool.get().await?;

        let item = diesel::insert_into(shopping_carts::table)
            .values(&NewCartItem {
                user_id,
                product_id,
                quantity,
                checked: true,
            })
            .on_conflict((shopping_carts::user_id, shopping_carts::product_id))
            .do_update()
            .set((
                shopping_carts::quantity.eq(shopping_carts::quantity + quantity),
                shopping_carts::updated_at.eq(Utc::now()),
            ))
            .returning(CartItem::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(item)
    }

    async fn update_cart_item(
        &self,
        id: i32,
        quantity: Option<i32>,
        checked: Option<bool>,
    ) -> ServiceResult<CartItem> {
        let mut conn = self.pool.get().await?;

        let mut item = shopping_carts::table
            .filter(shopping_carts::id.eq(id))
            .select(CartItem::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| ServiceError::NotFound(format!("cart item {}", id)))?;

        if let Some(quantity) = quantity {
            item.quantity = quantity;
        }
        if let Some(checked) = checked {
            item.checked = checked;
        }

        let item = diesel::update(shopping_carts::table.filter(shopping_carts::id.eq(id)))
            .set((
                shopping_carts::quantity.eq(item.quantity),
                shopping_carts::checked.eq(item.checked),
                shopping_carts::updated_at.eq(Utc::now()),
            ))
            .returning(CartItem::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(item)
    }

    async fn delete_cart_item(&self, id: i32) -> ServiceResult<()> {
        let mut conn = self.pool.get().await?;

        let deleted = diesel::delete(shopping_carts::table.filter(shopping_carts::id.eq(id)))
            .execute(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(ServiceError::NotFound(format!("cart item {}", id)));
        }
        Ok(())
    }
}
