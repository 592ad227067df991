use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use shared::ServiceResult;
use tokio::time::Instant;

use super::DistributedLock;

/// Lease lock held in process memory.
#[derive(Default)]
pub struct MemoryLock {
    holders: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn holders(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.holders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.holders()
            .get(key)
            .map(|(_, expires_at)| *expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> ServiceResult<bool> {
        let now = Instant::now();
        let mut holders = self.holders();
        match holders.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                holders.insert(key.to_string(), (token.to_string(), now + lease));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> ServiceResult<()> {
        let mut holders = self.holders();
        if holders.get(key).map(|(owner, _)| owner == token).unwrap_or(false) {
            holders.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_waits_for_release() {
        let lock = MemoryLock::new();
        let lease = Duration::from_secs(5);

        assert!(lock.try_acquire("stock:1", "a", lease).await.unwrap());
        assert!(!lock.try_acquire("stock:1", "b", lease).await.unwrap());
        assert!(lock.try_acquire("stock:2", "b", lease).await.unwrap());

        lock.release("stock:1", "a").await.unwrap();
        assert!(lock.try_acquire("stock:1", "b", lease).await.unwrap());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_new_owner() {
        let lock = MemoryLock::new();

        assert!(lock.try_acquire("stock:1", "a", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Lease expired: a new owner may take over.
        assert!(lock.try_acquire("stock:1", "b", Duration::from_secs(5)).await.unwrap());
        lock.release("stock:1", "a").await.unwrap();
        assert!(lock.is_held("stock:1"));
    }
}
