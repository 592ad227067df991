use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use shared::{ServiceError, ServiceResult};
use tracing::info;

use super::DistributedLock;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Single-instance Redis lock: `SET key token NX PX lease`, released by a
/// compare-and-delete script so an expired holder cannot free a new owner's lock.
pub struct RedisLock {
    conn: ConnectionManager,
    release_script: Script,
}

impl RedisLock {
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for stock locks");

        Ok(Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }
}

fn unavailable(err: redis::RedisError) -> ServiceError {
    ServiceError::ServiceUnavailable(format!("lock backend: {}", err))
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> ServiceResult<bool> {
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> ServiceResult<()> {
        let mut conn = self.conn.clone();

        let _: i32 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(())
    }
}
