use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::scoped_futures::ScopedBoxFuture;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use rand::Rng;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConn<'a> = PooledConnection<'a, AsyncPgConnection>;

/// Transactional access to Postgres.
///
/// All engine writes go through [`Store::transaction`], which owns the
/// deadlock retry policy; callers never hand-roll retry loops. Plain reads
/// borrow a pooled connection via [`Store::conn`].
pub struct Store {
    pool: DbPool,
    max_attempts: u32,
    backoff_ms_min: u64,
    backoff_ms_max: u64,
}

impl Store {
    pub fn new(pool: DbPool, config: &Config) -> Self {
        Self {
            pool,
            max_attempts: config.txn_max_attempts.max(1),
            backoff_ms_min: config.deadlock_backoff_ms_min,
            backoff_ms_max: config
                .deadlock_backoff_ms_max
                .max(config.deadlock_backoff_ms_min),
        }
    }

    pub async fn conn(&self) -> EngineResult<DbConn<'_>> {
        self.pool
            .get()
            .await
            .map_err(|e| EngineError::Pool(e.to_string()))
    }

    /// Run `callback` inside a database transaction.
    ///
    /// Deadlock-class failures roll back and re-run the callback with fresh
    /// jitter, up to the configured attempt budget; exhaustion surfaces as
    /// [`EngineError::Transient`]. Every other error rolls back and is
    /// returned verbatim, so business outcomes pass through untouched.
    pub async fn transaction<'a, R, F>(&self, callback: F) -> EngineResult<R>
    where
        R: Send + 'a,
        F: for<'r> Fn(&'r mut AsyncPgConnection) -> ScopedBoxFuture<'a, 'r, EngineResult<R>>
            + Send
            + Sync
            + 'a,
    {
        let callback = std::sync::Arc::new(callback);
        let mut attempt: u32 = 1;
        loop {
            let mut pooled = self.conn().await?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            let cb = std::sync::Arc::clone(&callback);
            let result = conn
                .transaction::<R, EngineError, _>(move |conn| (*cb)(conn))
                .await;
            match result {
                Err(err) if err.is_deadlock() && attempt < self.max_attempts => {
                    let backoff = backoff_ms(self.backoff_ms_min, self.backoff_ms_max);
                    warn!(attempt, backoff_ms = backoff, "deadlock detected, retrying transaction");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) if err.is_deadlock() => {
                    return Err(err.into_transient(attempt));
                }
                other => return other,
            }
        }
    }
}

fn backoff_ms(min: u64, max: u64) -> u64 {
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_configured_bounds() {
        for _ in 0..200 {
            let ms = backoff_ms(10, 50);
            assert!((10..=50).contains(&ms), "jitter {ms} out of range");
        }
    }

    #[test]
    fn backoff_handles_degenerate_range() {
        assert_eq!(backoff_ms(25, 25), 25);
    }
}
