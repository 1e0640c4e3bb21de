use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;
use uuid::Uuid;

use crate::cache::StockCache;
use crate::engines::{HoldEngine, OrderEngine, WebhookEngine, WebhookOutcome};
use crate::error::EngineError;
use crate::models::{Order, PaymentStatus, Product};
use crate::schema::products;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub cache: Arc<StockCache>,
    pub holds: Arc<HoldEngine>,
    pub orders: Arc<OrderEngine>,
    pub webhooks: Arc<WebhookEngine>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/products/:id", get(get_product))
        .route("/api/holds", post(create_hold))
        .route("/api/holds/:id", axum::routing::delete(release_hold))
        .route("/api/orders", post(create_order))
        .route("/api/orders/:id", get(get_order))
        .route("/api/payments/webhook", post(payment_webhook))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

#[derive(Debug, Serialize)]
pub struct ProductResponse {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub price: BigDecimal,
    pub available_stock: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateHoldRequest {
    pub product_id: i32,
    pub qty: i32,
}

#[derive(Debug, Serialize)]
pub struct HoldResponse {
    pub hold_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub product_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub hold_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub hold_id: Uuid,
    pub product_id: i32,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub total_price: BigDecimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.id,
            hold_id: order.hold_id,
            product_id: order.product_id,
            quantity: order.quantity,
            unit_price: order.unit_price,
            total_price: order.total_price,
            status: order.status,
            created_at: order.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub idempotency_key: String,
    pub order_id: Uuid,
    pub status: PaymentStatus,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookResponse {
    Processed {
        order_id: Uuid,
        order_status: String,
        webhook_id: Uuid,
        processing_time_ms: u64,
    },
    Duplicate {
        webhook_id: Uuid,
        processing_status: String,
        order_status: Option<String>,
    },
    Pending {
        webhook_id: Uuid,
        message: String,
    },
    AlreadyFinalized {
        order_status: String,
        webhook_id: Uuid,
    },
}

async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<i32>,
) -> Result<Json<ProductResponse>, ApiError> {
    let mut conn = state.store.conn().await?;
    let product: Option<Product> = products::table
        .find(product_id)
        .first(&mut conn)
        .await
        .optional()
        .map_err(EngineError::from)?;
    drop(conn);
    let Some(product) = product else {
        return Err(EngineError::not_found("product", product_id).into());
    };

    let available_stock = state.cache.get(&state.store, product_id).await?;
    Ok(Json(ProductResponse {
        id: product.id,
        name: product.name,
        description: product.description,
        price: product.price,
        available_stock,
        updated_at: product.updated_at,
    }))
}

async fn create_hold(
    State(state): State<AppState>,
    Json(request): Json<CreateHoldRequest>,
) -> Result<(StatusCode, Json<HoldResponse>), ApiError> {
    let hold = state
        .holds
        .create_hold(request.product_id, request.qty)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(HoldResponse {
            hold_id: hold.id,
            expires_at: hold.expires_at,
            product_id: hold.product_id,
            quantity: hold.quantity,
        }),
    ))
}

async fn release_hold(
    State(state): State<AppState>,
    Path(hold_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.holds.release_hold(hold_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let order = state.orders.create_order_from_hold(request.hold_id).await?;
    Ok((StatusCode::CREATED, Json(OrderResponse::from(order))))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = state.orders.get_order(order_id).await?;
    Ok(Json(OrderResponse::from(order)))
}

async fn payment_webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let started = Instant::now();
    let outcome = state
        .webhooks
        .process_webhook(
            &request.idempotency_key,
            request.order_id,
            request.status,
            request.payload,
        )
        .await?;

    let response = match outcome {
        WebhookOutcome::Processed { webhook_id, order } => WebhookResponse::Processed {
            order_id: order.id,
            order_status: order.status,
            webhook_id,
            processing_time_ms: started.elapsed().as_millis() as u64,
        },
        WebhookOutcome::Duplicate {
            webhook_id,
            processing_status,
            order_status,
        } => WebhookResponse::Duplicate {
            webhook_id,
            processing_status,
            order_status,
        },
        WebhookOutcome::Pending { webhook_id } => WebhookResponse::Pending {
            webhook_id,
            message: "order not found yet, webhook stored for later processing".to_string(),
        },
        WebhookOutcome::AlreadyFinalized {
            webhook_id,
            order_status,
        } => WebhookResponse::AlreadyFinalized {
            order_status,
            webhook_id,
        },
    };
    Ok(Json(response))
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Bridges engine errors to HTTP responses; the single place the error
/// taxonomy maps to status codes.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InsufficientStock { .. } => StatusCode::CONFLICT,
            EngineError::HoldExpired(_) => StatusCode::GONE,
            EngineError::HoldNotActive { .. } => StatusCode::CONFLICT,
            EngineError::TerminalState { .. } => StatusCode::CONFLICT,
            EngineError::SystemBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::StockInvariantViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Transient { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound { .. } => "not_found",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::HoldNotActive { .. } => "hold_not_active",
            EngineError::TerminalState { .. } => "terminal_state",
            EngineError::SystemBusy(_) => "system_busy",
            EngineError::StockInvariantViolation { .. } => "stock_invariant_violation",
            EngineError::Transient { .. } => "transient",
            EngineError::Database(_) | EngineError::Pool(_) => "internal_error",
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = %self.0, "request failed");
        }
        let body = ErrorResponse {
            error: self.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: EngineError) -> StatusCode {
        ApiError::from(err).status()
    }

    #[test]
    fn error_kinds_map_to_contracted_statuses() {
        assert_eq!(
            status_of(EngineError::Validation("bad".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(EngineError::not_found("product", 1)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(EngineError::InsufficientStock {
                product_id: 1,
                requested: 2,
                available: 1,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(EngineError::HoldExpired(Uuid::nil())),
            StatusCode::GONE
        );
        assert_eq!(
            status_of(EngineError::HoldNotActive {
                hold_id: Uuid::nil(),
                status: "released".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(EngineError::SystemBusy(1)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(EngineError::StockInvariantViolation {
                product_id: 1,
                stock: 0,
                quantity: 1,
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(EngineError::Pool("pool exhausted".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn webhook_response_bodies_are_tagged_by_result() {
        let processed = serde_json::to_value(WebhookResponse::Processed {
            order_id: Uuid::nil(),
            order_status: "paid".into(),
            webhook_id: Uuid::nil(),
            processing_time_ms: 12,
        })
        .unwrap();
        assert_eq!(processed["status"], "processed");
        assert_eq!(processed["order_status"], "paid");
        assert_eq!(processed["processing_time_ms"], 12);

        let duplicate = serde_json::to_value(WebhookResponse::Duplicate {
            webhook_id: Uuid::nil(),
            processing_status: "processed".into(),
            order_status: Some("paid".into()),
        })
        .unwrap();
        assert_eq!(duplicate["status"], "duplicate");
        assert_eq!(duplicate["processing_status"], "processed");

        let pending = serde_json::to_value(WebhookResponse::Pending {
            webhook_id: Uuid::nil(),
            message: "stored".into(),
        })
        .unwrap();
        assert_eq!(pending["status"], "pending");

        let finalized = serde_json::to_value(WebhookResponse::AlreadyFinalized {
            order_status: "paid".into(),
            webhook_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(finalized["status"], "already_finalized");
        assert_eq!(finalized["order_status"], "paid");
    }

    #[test]
    fn webhook_request_parses_wire_statuses() {
        let request: WebhookRequest = serde_json::from_value(serde_json::json!({
            "idempotency_key": "k1",
            "order_id": "550e8400-e29b-41d4-a716-446655440000",
            "status": "success",
        }))
        .unwrap();
        assert_eq!(request.status, PaymentStatus::Success);
        assert!(request.payload.is_none());

        let failed: WebhookRequest = serde_json::from_value(serde_json::json!({
            "idempotency_key": "k2",
            "order_id": "550e8400-e29b-41d4-a716-446655440000",
            "status": "failed",
            "payload": {"reason": "card_declined"},
        }))
        .unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert!(failed.payload.is_some());
    }
}
