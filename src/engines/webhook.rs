use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use diesel_async::scoped_futures::ScopedFutureExt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::StockCache;
use crate::config::Config;
use crate::engines::order::OrderEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    NewPaymentWebhook, Order, OrderStatus, PaymentStatus, PaymentWebhook, ProcessingStatus,
};
use crate::schema::{orders, payment_webhooks};
use crate::store::Store;

const DRAIN_PAGE_SIZE: i64 = 100;

/// Outcome of a webhook delivery. Exactly one effect is ever applied per
/// idempotency key; everything else is an absorption.
#[derive(Debug)]
pub enum WebhookOutcome {
    /// Effect applied in this call.
    Processed { webhook_id: Uuid, order: Order },
    /// Key seen before; nothing re-applied.
    Duplicate {
        webhook_id: Uuid,
        processing_status: String,
        order_status: Option<String>,
    },
    /// Order not there yet; webhook parked for the sweeper.
    Pending { webhook_id: Uuid },
    /// Order already settled; conflicting or late delivery absorbed.
    AlreadyFinalized {
        webhook_id: Uuid,
        order_status: String,
    },
}

enum Settlement {
    Skipped,
    Processed { invalidate: Option<i32> },
}

/// Enforces at-most-once application of payment notifications and drives the
/// OrderEngine to settle orders, tolerating duplicates and out-of-order
/// arrival.
pub struct WebhookEngine {
    store: Arc<Store>,
    cache: Arc<StockCache>,
    orders: Arc<OrderEngine>,
    config: Arc<Config>,
}

impl WebhookEngine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<StockCache>,
        orders: Arc<OrderEngine>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            orders,
            config,
        }
    }

    pub async fn process_webhook(
        &self,
        idempotency_key: &str,
        order_id: Uuid,
        payment_status: PaymentStatus,
        payload: Option<serde_json::Value>,
    ) -> EngineResult<WebhookOutcome> {
        validate_idempotency_key(idempotency_key)?;

        // Two concurrent firsts with the same key can both pass the lock-read;
        // the unique index lets exactly one insert through. The loser re-runs
        // once and observes the winner's row as a duplicate.
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .process_once(idempotency_key, order_id, payment_status, &payload)
                .await;
            match result {
                Err(err) if err.is_unique_violation() && attempt == 1 => {
                    warn!(idempotency_key, "idempotency key race lost, re-reading");
                    continue;
                }
                Err(err) => return Err(err),
                Ok((outcome, invalidate)) => {
                    if let Some(product_id) = invalidate {
                        self.cache.invalidate(product_id).await;
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    async fn process_once(
        &self,
        idempotency_key: &str,
        order_id: Uuid,
        payment_status: PaymentStatus,
        payload: &Option<serde_json::Value>,
    ) -> EngineResult<(WebhookOutcome, Option<i32>)> {
        let wait_attempts = self.config.order_wait_attempts.max(1);
        let wait_sleep = self.config.order_wait_sleep();

        self.store
            .transaction(move |conn| {
                let key = idempotency_key.to_string();
                let payload = payload.clone();
                async move {
                    let existing: Option<PaymentWebhook> = payment_webhooks::table
                        .filter(payment_webhooks::idempotency_key.eq(&key))
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    if let Some(row) = existing {
                        let order_status: Option<String> = orders::table
                            .find(row.order_id)
                            .select(orders::status)
                            .first(conn)
                            .await
                            .optional()?;
                        return Ok((
                            WebhookOutcome::Duplicate {
                                webhook_id: row.id,
                                processing_status: row.processing_status,
                                order_status,
                            },
                            None,
                        ));
                    }

                    // The order's creating transaction may not have committed
                    // yet; poll briefly before parking the webhook.
                    let mut order: Option<Order> = None;
                    for attempt in 0..wait_attempts {
                        order = orders::table
                            .find(order_id)
                            .for_update()
                            .first(conn)
                            .await
                            .optional()?;
                        if order.is_some() {
                            break;
                        }
                        if attempt + 1 < wait_attempts {
                            tokio::time::sleep(wait_sleep).await;
                        }
                    }

                    let Some(order) = order else {
                        let row =
                            insert_webhook(conn, &key, order_id, payment_status, payload, ProcessingStatus::Pending)
                                .await?;
                        return Ok((WebhookOutcome::Pending { webhook_id: row.id }, None));
                    };

                    let finalized = OrderStatus::parse(&order.status)
                        .map_or(false, |status| status.is_terminal());
                    if finalized {
                        let row =
                            insert_webhook(conn, &key, order_id, payment_status, payload, ProcessingStatus::Processed)
                                .await?;
                        return Ok((
                            WebhookOutcome::AlreadyFinalized {
                                webhook_id: row.id,
                                order_status: order.status,
                            },
                            None,
                        ));
                    }

                    let row =
                        insert_webhook(conn, &key, order_id, payment_status, payload, ProcessingStatus::Pending)
                            .await?;
                    let order = match payment_status {
                        PaymentStatus::Success => self.orders.mark_paid(conn, order.id).await?,
                        PaymentStatus::Failed => self.orders.cancel_order(conn, order.id).await?,
                    };
                    let row = mark_processed(conn, row.id).await?;
                    let product_id = order.product_id;
                    Ok((
                        WebhookOutcome::Processed {
                            webhook_id: row.id,
                            order,
                        },
                        Some(product_id),
                    ))
                }
                .scope_boxed()
            })
            .await
    }

    /// Settle webhooks that arrived before their orders.
    pub async fn drain_pending(&self) -> EngineResult<u64> {
        let mut processed: u64 = 0;
        let mut last_id = Uuid::nil();

        loop {
            let mut conn = self.store.conn().await?;
            let page: Vec<Uuid> = payment_webhooks::table
                .filter(payment_webhooks::processing_status.eq(ProcessingStatus::Pending.as_str()))
                .filter(payment_webhooks::id.gt(last_id))
                .order(payment_webhooks::id.asc())
                .select(payment_webhooks::id)
                .limit(DRAIN_PAGE_SIZE)
                .load(&mut conn)
                .await?;
            drop(conn);

            let Some(&tail) = page.last() else {
                break;
            };
            last_id = tail;

            for webhook_id in page {
                match self.settle_one(webhook_id).await {
                    Ok(Settlement::Processed { invalidate }) => {
                        if let Some(product_id) = invalidate {
                            self.cache.invalidate(product_id).await;
                        }
                        processed += 1;
                    }
                    Ok(Settlement::Skipped) => {}
                    Err(e) => error!(%webhook_id, error = %e, "failed to settle pending webhook"),
                }
            }
        }

        if processed > 0 {
            info!(processed, "drained pending webhooks");
        }
        Ok(processed)
    }

    async fn settle_one(&self, webhook_id: Uuid) -> EngineResult<Settlement> {
        self.store
            .transaction(move |conn| {
                async move {
                    let webhook: Option<PaymentWebhook> = payment_webhooks::table
                        .find(webhook_id)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    let Some(webhook) = webhook else {
                        return Ok(Settlement::Skipped);
                    };
                    if webhook.processing_status == ProcessingStatus::Processed.as_str() {
                        return Ok(Settlement::Skipped);
                    }

                    let order: Option<Order> = orders::table
                        .find(webhook.order_id)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    // Order still absent: the webhook stays pending for a
                    // later pass.
                    let Some(order) = order else {
                        return Ok(Settlement::Skipped);
                    };

                    let finalized = OrderStatus::parse(&order.status)
                        .map_or(false, |status| status.is_terminal());
                    let invalidate = if finalized {
                        None
                    } else {
                        match PaymentStatus::parse(&webhook.payment_status) {
                            Some(PaymentStatus::Success) => {
                                let order = self.orders.mark_paid(conn, order.id).await?;
                                Some(order.product_id)
                            }
                            Some(PaymentStatus::Failed) => {
                                let order = self.orders.cancel_order(conn, order.id).await?;
                                Some(order.product_id)
                            }
                            None => {
                                warn!(
                                    %webhook_id,
                                    payment_status = %webhook.payment_status,
                                    "unknown payment status, marking processed without effect"
                                );
                                None
                            }
                        }
                    };

                    mark_processed(conn, webhook_id).await?;
                    Ok(Settlement::Processed { invalidate })
                }
                .scope_boxed()
            })
            .await
    }
}

async fn insert_webhook(
    conn: &mut diesel_async::AsyncPgConnection,
    idempotency_key: &str,
    order_id: Uuid,
    payment_status: PaymentStatus,
    payload: Option<serde_json::Value>,
    processing_status: ProcessingStatus,
) -> EngineResult<PaymentWebhook> {
    let row = NewPaymentWebhook {
        id: Uuid::new_v4(),
        idempotency_key: idempotency_key.to_string(),
        order_id,
        payment_status: payment_status.as_str().to_string(),
        processing_status: processing_status.as_str().to_string(),
        payload,
    };
    let webhook: PaymentWebhook = diesel::insert_into(payment_webhooks::table)
        .values(&row)
        .get_result(conn)
        .await?;
    Ok(webhook)
}

async fn mark_processed(
    conn: &mut diesel_async::AsyncPgConnection,
    webhook_id: Uuid,
) -> EngineResult<PaymentWebhook> {
    let webhook: PaymentWebhook = diesel::update(payment_webhooks::table.find(webhook_id))
        .set((
            payment_webhooks::processing_status.eq(ProcessingStatus::Processed.as_str()),
            payment_webhooks::updated_at.eq(Utc::now()),
        ))
        .get_result(conn)
        .await?;
    Ok(webhook)
}

fn validate_idempotency_key(key: &str) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::Validation(
            "idempotency_key must not be empty".to_string(),
        ));
    }
    if key.len() > 255 {
        return Err(EngineError::Validation(
            "idempotency_key must be at most 255 characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_bounds() {
        assert!(validate_idempotency_key("k1").is_ok());
        assert!(validate_idempotency_key(&"x".repeat(255)).is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(&"x".repeat(256)).is_err());
    }
}
