use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// Delete only if we still own the lease, so a lock that expired mid-flight
// never clobbers a successor's acquisition.
const RELEASE_SCRIPT: &str =
    r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("del", KEYS[1]) else return 0 end"#;

/// A held advisory lock. Released explicitly; the lease expires on its own
/// if the holder dies.
pub struct LockGuard {
    key: String,
    token: String,
}

/// Redis-backed advisory locks (`SET key token NX PX lease`).
///
/// Serves the per-product admission lock and the sweeper's named lock. Both
/// are advisory: database row locks remain the correctness gate.
#[derive(Clone)]
pub struct LockService {
    conn_manager: ConnectionManager,
}

impl LockService {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self { conn_manager })
    }

    /// Acquire `key` for `lease`, blocking up to `wait`.
    ///
    /// `Ok(None)` means the lock is held elsewhere and the wait budget ran
    /// out; `Err` means the lock service itself failed and the caller decides
    /// whether to fail open.
    pub async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        wait: Duration,
    ) -> redis::RedisResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.conn_manager.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(lease.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                return Ok(Some(LockGuard {
                    key: key.to_string(),
                    token,
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Single non-blocking attempt, used by the sweeper.
    pub async fn try_acquire(
        &self,
        key: &str,
        lease: Duration,
    ) -> redis::RedisResult<Option<LockGuard>> {
        self.acquire(key, lease, Duration::ZERO).await
    }

    pub async fn release(&self, guard: LockGuard) {
        let mut conn = self.conn_manager.clone();
        let released: Result<i32, _> = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(&guard.key)
            .arg(&guard.token)
            .query_async(&mut conn)
            .await;
        match released {
            Ok(0) => warn!(key = %guard.key, "lock lease expired before release"),
            Ok(_) => {}
            Err(e) => warn!(key = %guard.key, error = %e, "lock release failed"),
        }
    }
}

pub fn admission_lock_key(product_id: i32) -> String {
    format!("hold_lock:product:{product_id}")
}

pub fn sweep_lock_key() -> &'static str {
    "sweep_lock:checkout"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_lock_keys_are_per_product() {
        assert_eq!(admission_lock_key(17), "hold_lock:product:17");
        assert_ne!(admission_lock_key(1), admission_lock_key(2));
    }
}
