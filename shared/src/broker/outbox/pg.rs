use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use super::schema::broker_messages;
use super::{OutboxRecord, OutboxStore, RecordState};
use crate::broker::{Message, TransactionState};
use crate::db::DbPool;
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = broker_messages)]
struct DbBrokerMessage {
    id: i64,
    topic: String,
    message_key: String,
    payload: serde_json::Value,
    state: String,
    deliver_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    check_times: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = broker_messages)]
struct NewBrokerMessage<'a> {
    topic: &'a str,
    message_key: &'a str,
    payload: &'a serde_json::Value,
    state: &'a str,
    deliver_at: DateTime<Utc>,
}

impl From<DbBrokerMessage> for OutboxRecord {
    fn from(row: DbBrokerMessage) -> Self {
        Self {
            id: row.id,
            message: Message {
                topic: row.topic,
                key: row.message_key,
                payload: row.payload,
            },
            state: RecordState::parse(&row.state).unwrap_or(RecordState::Unknown),
            deliver_at: row.deliver_at,
            published_at: row.published_at,
            check_times: row.check_times,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

async fn insert_record(
    conn: &mut AsyncPgConnection,
    message: &Message,
    state: RecordState,
    deliver_at: DateTime<Utc>,
) -> QueryResult<i64> {
    diesel::insert_into(broker_messages::table)
        .values(&NewBrokerMessage {
            topic: &message.topic,
            message_key: &message.key,
            payload: &message.payload,
            state: state.as_str(),
            deliver_at,
        })
        .returning(broker_messages::id)
        .get_result(conn)
        .await
}

/// Enqueues a COMMITTED message on an open connection, so callers can make
/// it part of their own transaction.
pub async fn enqueue_in(
    conn: &mut AsyncPgConnection,
    message: &Message,
    deliver_at: DateTime<Utc>,
) -> QueryResult<i64> {
    insert_record(conn, message, RecordState::Committed, deliver_at).await
}

/// CAS of a half-message out of PREPARED/UNKNOWN on an open connection.
pub async fn resolve_in(
    conn: &mut AsyncPgConnection,
    id: i64,
    state: RecordState,
) -> QueryResult<bool> {
    let updated = diesel::update(
        broker_messages::table
            .filter(broker_messages::id.eq(id))
            .filter(broker_messages::state.eq_any([
                RecordState::Prepared.as_str(),
                RecordState::Unknown.as_str(),
            ])),
    )
    .set((
        broker_messages::state.eq(state.as_str()),
        broker_messages::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    Ok(updated == 1)
}

pub struct PgOutboxStore {
    pool: DbPool,
}

impl PgOutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn prepare(&self, message: &Message) -> ServiceResult<i64> {
        let mut conn = self.pool.get().await?;
        Ok(insert_record(&mut conn, message, RecordState::Prepared, Utc::now()).await?)
    }

    async fn enqueue(&self, message: &Message, deliver_at: DateTime<Utc>) -> ServiceResult<i64> {
        let mut conn = self.pool.get().await?;
        Ok(enqueue_in(&mut conn, message, deliver_at).await?)
    }

    async fn resolve(
        &self,
        id: i64,
        state: TransactionState,
        follow_up: &[Message],
    ) -> ServiceResult<bool> {
        let mut conn = self.pool.get().await?;
        let follow_up = follow_up.to_vec();

        conn.transaction::<_, ServiceError, _>(|conn| {
            Box::pin(async move {
                let resolved = resolve_in(conn, id, state.into()).await?;
                if resolved {
                    let now = Utc::now();
                    for message in &follow_up {
                        enqueue_in(conn, message, now).await?;
                    }
                }
                Ok(resolved)
            })
        })
        .await
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> ServiceResult<Vec<OutboxRecord>> {
        let mut conn = self.pool.get().await?;
        let rows = broker_messages::table
            .filter(broker_messages::state.eq(RecordState::Committed.as_str()))
            .filter(broker_messages::published_at.is_null())
            .filter(broker_messages::deliver_at.le(now))
            .order(broker_messages::id.asc())
            .limit(limit)
            .select(DbBrokerMessage::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }

    async fn mark_published(&self, id: i64) -> ServiceResult<()> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        diesel::update(broker_messages::table.filter(broker_messages::id.eq(id)))
            .set((
                broker_messages::published_at.eq(Some(now)),
                broker_messages::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn unresolved(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> ServiceResult<Vec<OutboxRecord>> {
        let mut conn = self.pool.get().await?;
        let rows = broker_messages::table
            .filter(broker_messages::state.eq_any([
                RecordState::Prepared.as_str(),
                RecordState::Unknown.as_str(),
            ]))
            .filter(broker_messages::updated_at.le(older_than))
            .order(broker_messages::id.asc())
            .limit(limit)
            .select(DbBrokerMessage::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }

    async fn record_check(&self, id: i64) -> ServiceResult<i32> {
        let mut conn = self.pool.get().await?;
        let checks = diesel::update(broker_messages::table.filter(broker_messages::id.eq(id)))
            .set((
                broker_messages::check_times.eq(broker_messages::check_times + 1),
                broker_messages::updated_at.eq(Utc::now()),
            ))
            .returning(broker_messages::check_times)
            .get_result(&mut conn)
            .await?;
        Ok(checks)
    }
}
