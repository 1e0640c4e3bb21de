use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::StockCache;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::lock::{admission_lock_key, LockService};
use crate::models::{Hold, HoldStatus, NewHold, Product};
use crate::schema::{holds, products};
use crate::store::Store;

const EXPIRE_PAGE_SIZE: i64 = 100;

/// Creates, releases, converts, and expires holds. Source of the no-oversell
/// invariant: admission recomputes availability under the product row lock
/// and an aggregate lock over that product's active holds.
pub struct HoldEngine {
    store: Arc<Store>,
    cache: Arc<StockCache>,
    locks: Arc<LockService>,
    config: Arc<Config>,
}

impl HoldEngine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<StockCache>,
        locks: Arc<LockService>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            locks,
            config,
        }
    }

    pub async fn create_hold(&self, product_id: i32, quantity: i32) -> EngineResult<Hold> {
        if quantity < 1 || quantity > self.config.max_hold_qty {
            return Err(EngineError::Validation(format!(
                "quantity must be between 1 and {}",
                self.config.max_hold_qty
            )));
        }

        // Advisory admission lock to keep the thundering herd off the row
        // lock. The row lock below stays the authoritative gate, so a lock
        // service fault falls back to database locking unless configured
        // strict.
        let lock_key = admission_lock_key(product_id);
        let guard = match self
            .locks
            .acquire(
                &lock_key,
                self.config.admission_lock_timeout(),
                self.config.admission_lock_wait(),
            )
            .await
        {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => return Err(EngineError::SystemBusy(product_id)),
            Err(e) if self.config.strict_admission => {
                warn!(product_id, error = %e, "admission lock unavailable, strict mode refuses");
                return Err(EngineError::SystemBusy(product_id));
            }
            Err(e) => {
                warn!(product_id, error = %e, "admission lock unavailable, relying on row locks");
                None
            }
        };

        let result = self.admit_and_insert(product_id, quantity).await;

        if let Some(guard) = guard {
            self.locks.release(guard).await;
        }

        match result {
            Ok(hold) => {
                self.cache.invalidate(product_id).await;
                info!(hold_id = %hold.id, product_id, quantity, "hold created");
                Ok(hold)
            }
            Err(err) => Err(err),
        }
    }

    async fn admit_and_insert(&self, product_id: i32, quantity: i32) -> EngineResult<Hold> {
        let hold_duration = self.config.hold_duration();
        self.store
            .transaction(move |conn| {
                async move {
                    let product: Option<Product> = products::table
                        .find(product_id)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    let Some(product) = product else {
                        return Err(EngineError::not_found("product", product_id));
                    };

                    // Freeze the set of live holds for this product; sums and
                    // inserts by concurrent creators serialize behind these
                    // locks.
                    let now = Utc::now();
                    let active: Vec<Hold> = holds::table
                        .filter(holds::product_id.eq(product_id))
                        .filter(holds::status.eq(HoldStatus::Active.as_str()))
                        .filter(holds::expires_at.gt(now))
                        .for_update()
                        .load(conn)
                        .await?;
                    let held_qty: i64 = active.iter().map(|h| i64::from(h.quantity)).sum();

                    let available = available_for_admission(product.stock, held_qty);
                    if available < i64::from(quantity) {
                        return Err(EngineError::InsufficientStock {
                            product_id,
                            requested: quantity,
                            available: available.max(0),
                        });
                    }

                    let new_hold = NewHold {
                        id: Uuid::new_v4(),
                        product_id,
                        quantity,
                        status: HoldStatus::Active.as_str().to_string(),
                        expires_at: now + hold_duration,
                    };
                    let hold: Hold = diesel::insert_into(holds::table)
                        .values(&new_hold)
                        .get_result(conn)
                        .await?;
                    Ok(hold)
                }
                .scope_boxed()
            })
            .await
    }

    /// Transition an active hold to `converted`. Runs inside the caller's
    /// transaction (order creation) with the hold row already locked.
    pub async fn convert_hold(
        &self,
        conn: &mut AsyncPgConnection,
        hold: &Hold,
    ) -> EngineResult<Hold> {
        let updated: Hold = diesel::update(holds::table.find(hold.id))
            .set((
                holds::status.eq(HoldStatus::Converted.as_str()),
                holds::updated_at.eq(Utc::now()),
            ))
            .get_result(conn)
            .await?;
        Ok(updated)
    }

    pub async fn release_hold(&self, hold_id: Uuid) -> EngineResult<()> {
        let released_product = self
            .store
            .transaction(move |conn| {
                async move {
                    let hold: Option<Hold> = holds::table
                        .find(hold_id)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    let Some(hold) = hold else {
                        return Err(EngineError::not_found("hold", hold_id));
                    };
                    if HoldStatus::parse(&hold.status) != Some(HoldStatus::Active) {
                        return Ok(None);
                    }
                    diesel::update(holds::table.find(hold_id))
                        .set((
                            holds::status.eq(HoldStatus::Released.as_str()),
                            holds::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                    Ok(Some(hold.product_id))
                }
                .scope_boxed()
            })
            .await?;

        if let Some(product_id) = released_product {
            self.cache.invalidate(product_id).await;
            info!(%hold_id, product_id, "hold released");
        }
        Ok(())
    }

    /// Sweep active holds past their deadline into `expired`.
    ///
    /// Pages by id so a row that refuses to settle cannot wedge the sweep;
    /// every candidate is re-verified under its row lock because the state
    /// may have moved between page read and lock.
    pub async fn expire_due(&self) -> EngineResult<u64> {
        let mut expired: u64 = 0;
        let mut last_id = Uuid::nil();

        loop {
            let now = Utc::now();
            let mut conn = self.store.conn().await?;
            let page: Vec<Uuid> = holds::table
                .filter(holds::status.eq(HoldStatus::Active.as_str()))
                .filter(holds::expires_at.le(now))
                .filter(holds::id.gt(last_id))
                .order(holds::id.asc())
                .select(holds::id)
                .limit(EXPIRE_PAGE_SIZE)
                .load(&mut conn)
                .await?;
            drop(conn);

            let Some(&tail) = page.last() else {
                break;
            };
            last_id = tail;

            for hold_id in page {
                match self.expire_one(hold_id).await {
                    Ok(Some(product_id)) => {
                        self.cache.invalidate(product_id).await;
                        expired += 1;
                    }
                    Ok(None) => {}
                    Err(e) => error!(%hold_id, error = %e, "failed to expire hold"),
                }
            }
        }

        if expired > 0 {
            info!(expired, "expired due holds");
        }
        Ok(expired)
    }

    async fn expire_one(&self, hold_id: Uuid) -> EngineResult<Option<i32>> {
        self.store
            .transaction(move |conn| {
                async move {
                    let hold: Option<Hold> = holds::table
                        .find(hold_id)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    let Some(hold) = hold else {
                        return Ok(None);
                    };
                    if HoldStatus::parse(&hold.status) != Some(HoldStatus::Active)
                        || hold.expires_at > Utc::now()
                    {
                        return Ok(None);
                    }
                    diesel::update(holds::table.find(hold_id))
                        .set((
                            holds::status.eq(HoldStatus::Expired.as_str()),
                            holds::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                    Ok(Some(hold.product_id))
                }
                .scope_boxed()
            })
            .await
    }
}

/// Availability at admission time: physical stock minus everything already
/// promised to live holds.
fn available_for_admission(stock: i32, held_qty: i64) -> i64 {
    i64::from(stock) - held_qty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_subtracts_live_holds() {
        assert_eq!(available_for_admission(10, 0), 10);
        assert_eq!(available_for_admission(10, 7), 3);
        assert_eq!(available_for_admission(10, 10), 0);
    }

    #[test]
    fn burst_of_unit_requests_never_oversells() {
        // Twenty racing qty=1 requests against stock 10, serialized by the
        // product row lock: exactly ten admitted.
        let stock = 10;
        let mut held: i64 = 0;
        let mut admitted = 0;
        let mut refused = 0;
        for _ in 0..20 {
            if available_for_admission(stock, held) >= 1 {
                held += 1;
                admitted += 1;
            } else {
                refused += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(refused, 10);
        assert_eq!(held, i64::from(stock));
    }

    #[test]
    fn expired_holds_release_availability() {
        let stock = 5;
        let mut held: i64 = 0;

        assert!(available_for_admission(stock, held) >= 5);
        held += 5;
        assert!(available_for_admission(stock, held) < 5);

        // Sweep transitions the hold out of `active`; its quantity leaves
        // the aggregate.
        held -= 5;
        assert!(available_for_admission(stock, held) >= 5);
    }
}
