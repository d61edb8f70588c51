use async_trait::async_trait;
use redis::Script;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::RedisService;
use crate::common::error::{AdapterError, AdapterResult};
use crate::common::retry::{with_backoff, RetryPolicy};
use crate::modules::transcoding::lock::{LeaseToken, LockManager};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Whether the value stored under a lease key is `token`.
fn held_by(stored: Option<&str>, token: &LeaseToken) -> bool {
    stored == Some(token.as_str())
}

/// Redis-backed leases. The value stored under each key is the holder's
/// `LeaseToken`; release and extend compare it inside a script.
pub struct RedisLockManager {
    redis: RedisService,
    instance_id: String,
    acquire_retry: RetryPolicy,
}

impl RedisLockManager {
    pub fn new(redis: RedisService, instance_id: String, acquire_attempts: u32) -> Self {
        Self {
            redis,
            instance_id,
            acquire_retry: RetryPolicy::new(acquire_attempts, Duration::from_millis(100)),
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> AdapterResult<Option<LeaseToken>> {
        let token = LeaseToken::generate(&self.instance_id);
        let acquired = with_backoff(&self.acquire_retry, "lock acquire", || async {
            let mut conn = self.redis.get_conn().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token.as_str())
                .arg("NX")
                .arg("PX")
                .arg(Self::ttl_millis(ttl))
                .query_async(&mut conn)
                .await?;
            let acquired = match reply {
                Some(_) => true,
                None => {
                    // A previous attempt may have landed with its reply lost.
                    let holder: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
                    held_by(holder.as_deref(), &token)
                }
            };
            Ok::<_, AdapterError>(acquired)
        })
        .await?;

        if !acquired {
            return Ok(None);
        }
        debug!(key = %key, "Lease acquired");
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> AdapterResult<bool> {
        let mut conn = self.redis.get_conn().await?;
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn force_release(&self, key: &str) -> AdapterResult<bool> {
        let mut conn = self.redis.get_conn().await?;
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn extend(&self, key: &str, token: &LeaseToken, ttl: Duration) -> AdapterResult<bool> {
        let mut conn = self.redis.get_conn().await?;
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token.as_str())
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        if extended == 0 {
            warn!(key = %key, "Lease expired or changed owner");
        }
        Ok(extended > 0)
    }

    async fn exists(&self, key: &str) -> AdapterResult<bool> {
        let mut conn = self.redis.get_conn().await?;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }
}
