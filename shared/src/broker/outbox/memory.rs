use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{OutboxRecord, OutboxStore, RecordState};
use crate::broker::{Message, TransactionState};
use crate::error::{ServiceError, ServiceResult};

#[derive(Default)]
struct OutboxTable {
    next_id: i64,
    records: Vec<OutboxRecord>,
}

impl OutboxTable {
    fn insert(&mut self, message: &Message, state: RecordState, deliver_at: DateTime<Utc>) -> i64 {
        self.next_id += 1;
        let now = Utc::now();
        self.records.push(OutboxRecord {
            id: self.next_id,
            message: message.clone(),
            state,
            deliver_at,
            published_at: None,
            check_times: 0,
            created_at: now,
            updated_at: now,
        });
        self.next_id
    }

    fn get_mut(&mut self, id: i64) -> Option<&mut OutboxRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }
}

/// In-process outbox table for tests and single-node runs.
///
/// The `*_now` methods are synchronous so other in-memory stores can fold an
/// outbox write into their own critical section.
#[derive(Default)]
pub struct MemoryOutboxStore {
    table: Mutex<OutboxTable>,
    unavailable: AtomicBool,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with a transient error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> ServiceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::TransientDb("outbox store unavailable".to_string()));
        }
        Ok(())
    }

    fn table(&self) -> std::sync::MutexGuard<'_, OutboxTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue_now(&self, message: &Message, deliver_at: DateTime<Utc>) -> i64 {
        self.table().insert(message, RecordState::Committed, deliver_at)
    }

    pub fn resolve_now(&self, id: i64, state: RecordState) -> bool {
        let mut table = self.table();
        match table.get_mut(id) {
            Some(record) if record.state.is_unresolved() => {
                record.state = state;
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn state_now(&self, id: i64) -> Option<RecordState> {
        self.table().records.iter().find(|r| r.id == id).map(|r| r.state)
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        self.table().records.clone()
    }

    pub fn records_for(&self, topic: &str) -> Vec<OutboxRecord> {
        self.table()
            .records
            .iter()
            .filter(|r| r.message.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn prepare(&self, message: &Message) -> ServiceResult<i64> {
        self.check_available()?;
        Ok(self.table().insert(message, RecordState::Prepared, Utc::now()))
    }

    async fn enqueue(&self, message: &Message, deliver_at: DateTime<Utc>) -> ServiceResult<i64> {
        self.check_available()?;
        Ok(self.enqueue_now(message, deliver_at))
    }

    async fn resolve(
        &self,
        id: i64,
        state: TransactionState,
        follow_up: &[Message],
    ) -> ServiceResult<bool> {
        self.check_available()?;
        let mut table = self.table();
        let resolved = match table.get_mut(id) {
            Some(record) if record.state.is_unresolved() => {
                record.state = state.into();
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if resolved {
            let now = Utc::now();
            for message in follow_up {
                table.insert(message, RecordState::Committed, now);
            }
        }
        Ok(resolved)
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> ServiceResult<Vec<OutboxRecord>> {
        self.check_available()?;
        Ok(self
            .table()
            .records
            .iter()
            .filter(|r| {
                r.state == RecordState::Committed && r.published_at.is_none() && r.deliver_at <= now
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: i64) -> ServiceResult<()> {
        self.check_available()?;
        if let Some(record) = self.table().get_mut(id) {
            let now = Utc::now();
            record.published_at = Some(now);
            record.updated_at = now;
        }
        Ok(())
    }

    async fn unresolved(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> ServiceResult<Vec<OutboxRecord>> {
        self.check_available()?;
        Ok(self
            .table()
            .records
            .iter()
            .filter(|r| r.state.is_unresolved() && r.updated_at <= older_than)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_check(&self, id: i64) -> ServiceResult<i32> {
        self.check_available()?;
        let mut table = self.table();
        let record = table
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("outbox record {}", id)))?;
        record.check_times += 1;
        record.updated_at = Utc::now();
        Ok(record.check_times)
    }
}
