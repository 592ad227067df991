//! Per-product mutual exclusion with a bounded lease.

mod memory;
mod redis;

pub use self::memory::MemoryLock;
pub use self::redis::RedisLock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared::{ServiceError, ServiceResult};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// A mutex keyed by string whose ownership expires after its lease.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes `key` for `lease` unless someone else holds it.
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> ServiceResult<bool>;

    /// Frees `key` if it is still held under `token`.
    async fn release(&self, key: &str, token: &str) -> ServiceResult<()>;
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub lease: Duration,
    pub wait: Duration,
    pub retry_delay: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(3),
            wait: Duration::from_secs(2),
            retry_delay: Duration::from_millis(20),
        }
    }
}

#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
}

/// Stock locks, keyed `stock:<product_id>`.
pub struct StockLocks {
    backend: Arc<dyn DistributedLock>,
    settings: LockSettings,
}

impl StockLocks {
    pub fn new(backend: Arc<dyn DistributedLock>, settings: LockSettings) -> Self {
        Self { backend, settings }
    }

    pub fn key(product_id: i32) -> String {
        format!("stock:{}", product_id)
    }

    /// Polls the backend until the lock is ours or the wait budget is spent.
    pub async fn acquire(&self, product_id: i32) -> ServiceResult<LockHandle> {
        self.acquire_within(product_id, None).await
    }

    /// Like [`acquire`](Self::acquire), waiting at most `limit` when that is
    /// shorter than the configured wait.
    pub async fn acquire_within(&self, product_id: i32, limit: Option<Duration>) -> ServiceResult<LockHandle> {
        let key = Self::key(product_id);
        let token = Uuid::new_v4().to_string();
        let wait = limit.map_or(self.settings.wait, |limit| limit.min(self.settings.wait));
        let deadline = Instant::now() + wait;

        loop {
            if self.backend.try_acquire(&key, &token, self.settings.lease).await? {
                debug!(key = %key, "Lock acquired");
                return Ok(LockHandle { key, token });
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::LockTimeout(key));
            }
            tokio::time::sleep(self.settings.retry_delay).await;
        }
    }

    /// Acquires the locks of `product_ids` in ascending order. On failure the
    /// locks already taken are given back.
    pub async fn acquire_all(&self, product_ids: &[i32]) -> ServiceResult<Vec<LockHandle>> {
        let mut ids = product_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut handles = Vec::with_capacity(ids.len());
        for product_id in ids {
            match self.acquire(product_id).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.release_all(handles).await;
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Release failures are only logged: the lease expires on its own.
    pub async fn release(&self, handle: LockHandle) {
        if let Err(e) = self.backend.release(&handle.key, &handle.token).await {
            warn!(key = %handle.key, error = %e, "Failed to release lock");
        }
    }

    pub async fn release_all(&self, handles: Vec<LockHandle>) {
        for handle in handles.into_iter().rev() {
            self.release(handle).await;
        }
    }
}
