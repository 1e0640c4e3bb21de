use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::warn;

use crate::error::EngineResult;
use crate::models::{HoldStatus, Product};
use crate::schema::{holds, products};
use crate::store::Store;

/// Short-TTL read-through cache of available stock per product.
///
/// Never authoritative: admission recomputes under row locks. A redis fault
/// degrades to a direct store read; invalidation faults are logged and
/// swallowed, TTL self-heals.
#[derive(Clone)]
pub struct StockCache {
    conn_manager: ConnectionManager,
    ttl_seconds: u64,
}

impl StockCache {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self {
            conn_manager,
            ttl_seconds,
        })
    }

    fn key(product_id: i32) -> String {
        format!("stock:available:{product_id}")
    }

    /// Possibly-stale available stock; populated from the store on miss.
    pub async fn get(&self, store: &Store, product_id: i32) -> EngineResult<i64> {
        let key = Self::key(product_id);
        let mut conn = self.conn_manager.clone();

        match conn.get::<_, Option<i64>>(&key).await {
            Ok(Some(cached)) => return Ok(cached.max(0)),
            Ok(None) => {}
            Err(e) => {
                warn!(product_id, error = %e, "stock cache read failed, falling back to store");
            }
        }

        let mut db = store.conn().await?;
        let available = available_stock(&mut db, product_id).await?;

        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, available, self.ttl_seconds)
            .await
        {
            warn!(product_id, error = %e, "stock cache populate failed");
        }
        Ok(available)
    }

    /// Best-effort, idempotent. Called on every event that changes
    /// availability: hold created/expired/released, order paid/cancelled.
    pub async fn invalidate(&self, product_id: i32) {
        let mut conn = self.conn_manager.clone();
        if let Err(e) = conn.del::<_, ()>(Self::key(product_id)).await {
            warn!(product_id, error = %e, "stock cache invalidation failed");
        }
    }
}

/// `stock − Σ active unexpired hold quantity`, floored at zero.
///
/// Unlocked view for read endpoints and cache population; returns 0 for an
/// unknown product.
pub async fn available_stock(conn: &mut AsyncPgConnection, product_id: i32) -> EngineResult<i64> {
    let product: Option<Product> = products::table
        .find(product_id)
        .first(conn)
        .await
        .optional()?;
    let Some(product) = product else {
        return Ok(0);
    };

    let held: Option<i64> = holds::table
        .filter(holds::product_id.eq(product_id))
        .filter(holds::status.eq(HoldStatus::Active.as_str()))
        .filter(holds::expires_at.gt(Utc::now()))
        .select(diesel::dsl::sum(holds::quantity))
        .first(conn)
        .await?;

    Ok((i64::from(product.stock) - held.unwrap_or(0)).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_are_scoped_per_product() {
        assert_eq!(StockCache::key(42), "stock:available:42");
        assert_ne!(StockCache::key(1), StockCache::key(2));
    }
}
