use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tracing::info;

use checkout_service::api::{self, AppState};
use checkout_service::cache::StockCache;
use checkout_service::config::Config;
use checkout_service::engines::{HoldEngine, OrderEngine, WebhookEngine};
use checkout_service::lock::LockService;
use checkout_service::store::Store;
use checkout_service::sweeper::Sweeper;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = Arc::new(Config::parse());

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder().build(manager).await?;
    let store = Arc::new(Store::new(pool, &config));

    let cache = Arc::new(StockCache::connect(&config.redis_url, config.stock_cache_ttl_seconds).await?);
    let locks = Arc::new(LockService::connect(&config.redis_url).await?);

    let holds = Arc::new(HoldEngine::new(
        store.clone(),
        cache.clone(),
        locks.clone(),
        config.clone(),
    ));
    let orders = Arc::new(OrderEngine::new(store.clone(), cache.clone(), holds.clone()));
    let webhooks = Arc::new(WebhookEngine::new(
        store.clone(),
        cache.clone(),
        orders.clone(),
        config.clone(),
    ));

    let sweeper = Sweeper::new(
        holds.clone(),
        webhooks.clone(),
        locks.clone(),
        config.sweep_period(),
    );
    tokio::spawn(async move {
        sweeper.run().await;
    });

    let app_state = AppState {
        store,
        cache,
        holds,
        orders,
        webhooks,
    };
    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Checkout service listening on port {}", config.port);
    axum::serve(listener, app).await?;

    Ok(())
}
