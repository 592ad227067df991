use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use inventory_service::config::Config;
use inventory_service::handlers::ReleaseHandler;
use inventory_service::lock::{RedisLock, StockLocks};
use inventory_service::service::InventoryService;
use inventory_service::store::PgInventoryStore;
use inventory_service::api;
use shared::broker::kafka::{self, KafkaPublisher, KafkaSubscriber};
use tracing::info;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    shared::telemetry::init_tracing();
    let config = Config::parse();

    shared::db::run_migrations(&config.database_url, MIGRATIONS)?;
    let pool = shared::db::build_pool(&config.database_url).await?;

    let lock = RedisLock::new(&config.redis_url).await?;
    let service = Arc::new(InventoryService::new(
        Arc::new(PgInventoryStore::new(pool)),
        StockLocks::new(Arc::new(lock), config.lock_settings()),
        config.inventory_config(),
    ));

    let publisher = Arc::new(KafkaPublisher::new(kafka::producer(&config.kafka_brokers)?));
    let consumer = kafka::consumer(
        &config.kafka_brokers,
        &config.consumer_group,
        &[&config.release_topic],
    )?;
    let subscriber = KafkaSubscriber::new(consumer, publisher, config.redelivery_policy());
    let release_handler = Arc::new(ReleaseHandler::new(service.clone()));

    tokio::spawn(async move {
        subscriber.run(release_handler).await;
    });

    let app = api::create_router(api::AppState { service });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Inventory service started on port {}", config.port);
    info!(topic = %config.release_topic, "Consuming release messages");

    axum::serve(listener, app).await?;

    Ok(())
}
