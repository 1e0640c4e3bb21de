use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::StockCache;
use crate::engines::hold::HoldEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{line_total, Hold, HoldStatus, NewOrder, Order, OrderStatus, Product};
use crate::schema::{holds, orders, products};
use crate::store::Store;

enum Conversion {
    Order(Order),
    ExpiredHold { product_id: i32 },
}

/// Converts a valid hold into an order exactly once and applies terminal
/// transitions. The stock decrement happens here, on payment success, never
/// at conversion time: cancellations restore availability by releasing the
/// hold instead.
pub struct OrderEngine {
    store: Arc<Store>,
    cache: Arc<StockCache>,
    holds: Arc<HoldEngine>,
}

impl OrderEngine {
    pub fn new(store: Arc<Store>, cache: Arc<StockCache>, holds: Arc<HoldEngine>) -> Self {
        Self {
            store,
            cache,
            holds,
        }
    }

    pub async fn create_order_from_hold(&self, hold_id: Uuid) -> EngineResult<Order> {
        let outcome = self
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

                    // The public endpoint may be retried; a hold that already
                    // became an order returns that order unchanged.
                    let existing: Option<Order> = orders::table
                        .filter(orders::hold_id.eq(hold_id))
                        .first(conn)
                        .await
                        .optional()?;
                    if let Some(order) = existing {
                        return Ok(Conversion::Order(order));
                    }

                    if HoldStatus::parse(&hold.status) != Some(HoldStatus::Active) {
                        return Err(EngineError::HoldNotActive {
                            hold_id,
                            status: hold.status.clone(),
                        });
                    }

                    // Lazy expiry: commit the transition even though the call
                    // fails, so the sweeper is not needed for correctness.
                    if hold.expires_at <= Utc::now() {
                        diesel::update(holds::table.find(hold_id))
                            .set((
                                holds::status.eq(HoldStatus::Expired.as_str()),
                                holds::updated_at.eq(Utc::now()),
                            ))
                            .execute(conn)
                            .await?;
                        return Ok(Conversion::ExpiredHold {
                            product_id: hold.product_id,
                        });
                    }

                    let hold = self.holds.convert_hold(conn, &hold).await?;

                    let product: Option<Product> = products::table
                        .find(hold.product_id)
                        .first(conn)
                        .await
                        .optional()?;
                    let Some(product) = product else {
                        return Err(EngineError::not_found("product", hold.product_id));
                    };

                    let unit_price = product.price.clone();
                    let new_order = NewOrder {
                        id: Uuid::new_v4(),
                        hold_id,
                        product_id: hold.product_id,
                        quantity: hold.quantity,
                        total_price: line_total(&unit_price, hold.quantity),
                        unit_price,
                        status: OrderStatus::PendingPayment.as_str().to_string(),
                    };
                    let order: Order = diesel::insert_into(orders::table)
                        .values(&new_order)
                        .get_result(conn)
                        .await?;
                    Ok(Conversion::Order(order))
                }
                .scope_boxed()
            })
            .await?;

        match outcome {
            Conversion::Order(order) => {
                info!(order_id = %order.id, %hold_id, "order created from hold");
                Ok(order)
            }
            Conversion::ExpiredHold { product_id } => {
                self.cache.invalidate(product_id).await;
                Err(EngineError::HoldExpired(hold_id))
            }
        }
    }

    /// Settle an order as paid and commit the physical stock decrement in
    /// the same transaction. Runs inside the caller's transaction; the
    /// caller invalidates the stock cache after commit.
    pub async fn mark_paid(
        &self,
        conn: &mut AsyncPgConnection,
        order_id: Uuid,
    ) -> EngineResult<Order> {
        let order: Option<Order> = orders::table
            .find(order_id)
            .for_update()
            .first(conn)
            .await
            .optional()?;
        let Some(order) = order else {
            return Err(EngineError::not_found("order", order_id));
        };

        match OrderStatus::parse(&order.status) {
            Some(OrderStatus::Paid) => return Ok(order),
            Some(OrderStatus::PendingPayment) => {}
            _ => {
                return Err(EngineError::TerminalState {
                    order_id,
                    status: order.status.clone(),
                });
            }
        }

        let product: Option<Product> = products::table
            .find(order.product_id)
            .for_update()
            .first(conn)
            .await
            .optional()?;
        let Some(product) = product else {
            return Err(EngineError::not_found("product", order.product_id));
        };

        // Holds guarantee this by construction; a shortfall here means a
        // higher layer skipped admission.
        if product.stock < order.quantity {
            error!(
                product_id = product.id,
                stock = product.stock,
                quantity = order.quantity,
                "stock invariant violation on payment settlement"
            );
            return Err(EngineError::StockInvariantViolation {
                product_id: product.id,
                stock: product.stock,
                quantity: order.quantity,
            });
        }

        diesel::update(products::table.find(product.id))
            .set((
                products::stock.eq(products::stock - order.quantity),
                products::version.eq(products::version + 1),
                products::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;

        let updated: Order = diesel::update(orders::table.find(order_id))
            .set((
                orders::status.eq(OrderStatus::Paid.as_str()),
                orders::updated_at.eq(Utc::now()),
            ))
            .get_result(conn)
            .await?;
        info!(%order_id, product_id = product.id, "order paid, stock deducted");
        Ok(updated)
    }

    /// Cancel a pending order and release its hold. Stock is untouched, it
    /// was never deducted. Runs inside the caller's transaction.
    pub async fn cancel_order(
        &self,
        conn: &mut AsyncPgConnection,
        order_id: Uuid,
    ) -> EngineResult<Order> {
        let order: Option<Order> = orders::table
            .find(order_id)
            .for_update()
            .first(conn)
            .await
            .optional()?;
        let Some(order) = order else {
            return Err(EngineError::not_found("order", order_id));
        };

        match OrderStatus::parse(&order.status) {
            Some(OrderStatus::Cancelled) => return Ok(order),
            Some(OrderStatus::PendingPayment) => {}
            _ => {
                return Err(EngineError::TerminalState {
                    order_id,
                    status: order.status.clone(),
                });
            }
        }

        let hold: Option<Hold> = holds::table
            .find(order.hold_id)
            .for_update()
            .first(conn)
            .await
            .optional()?;
        if let Some(hold) = hold {
            if HoldStatus::parse(&hold.status) == Some(HoldStatus::Converted) {
                diesel::update(holds::table.find(hold.id))
                    .set((
                        holds::status.eq(HoldStatus::Released.as_str()),
                        holds::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;
            }
        }

        let updated: Order = diesel::update(orders::table.find(order_id))
            .set((
                orders::status.eq(OrderStatus::Cancelled.as_str()),
                orders::updated_at.eq(Utc::now()),
            ))
            .get_result(conn)
            .await?;
        info!(%order_id, "order cancelled, hold released");
        Ok(updated)
    }

    pub async fn get_order(&self, order_id: Uuid) -> EngineResult<Order> {
        let mut conn = self.store.conn().await?;
        let order: Option<Order> = orders::table
            .find(order_id)
            .first(&mut conn)
            .await
            .optional()?;
        order.ok_or_else(|| EngineError::not_found("order", order_id))
    }
}
