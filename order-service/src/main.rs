use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use order_service::api;
use order_service::clients::{HttpInventoryClient, HttpProductCatalog};
use order_service::config::Config;
use order_service::handlers::{ReserveAuditHandler, TimeoutHandler};
use order_service::service::OrderService;
use order_service::store::PgOrderStore;
use order_service::transaction::OrderReserveListener;
use shared::broker::kafka::{self, KafkaPublisher, KafkaSubscriber};
use shared::broker::outbox::{OutboxRelay, PgOutboxStore};
use shared::{ORDER_RESERVE_TOPIC, ORDER_TIMEOUT_TOPIC};
use tracing::info;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    shared::telemetry::init_tracing();
    let config = Config::parse();

    shared::db::run_migrations(&config.database_url, MIGRATIONS)?;
    let pool = shared::db::build_pool(&config.database_url).await?;

    let store = Arc::new(PgOrderStore::new(pool.clone()));
    let outbox = Arc::new(PgOutboxStore::new(pool));
    let inventory = Arc::new(HttpInventoryClient::new(&config.inventory_url, config.rpc_timeout())?);
    let catalog = Arc::new(HttpProductCatalog::new(&config.product_url, config.rpc_timeout())?);

    let listener = Arc::new(
        OrderReserveListener::new(store.clone(), outbox.clone(), inventory, catalog, config.order_timeout())
            .with_reserve_grace(config.reserve_grace()),
    );
    let service = Arc::new(OrderService::new(store, outbox.clone(), listener.clone()));

    let publisher = Arc::new(KafkaPublisher::new(kafka::producer(&config.kafka_brokers)?));
    let relay = OutboxRelay::new(outbox, publisher.clone(), config.relay_config())
        .with_listener(ORDER_RESERVE_TOPIC, listener);

    let timeout_consumer = kafka::consumer(
        &config.kafka_brokers,
        &format!("{}-timeout", config.consumer_group),
        &[ORDER_TIMEOUT_TOPIC],
    )?;
    let audit_consumer = kafka::consumer(
        &config.kafka_brokers,
        &format!("{}-audit", config.consumer_group),
        &[ORDER_RESERVE_TOPIC],
    )?;
    let timeout_subscriber = KafkaSubscriber::new(timeout_consumer, publisher.clone(), config.redelivery_policy());
    let audit_subscriber = KafkaSubscriber::new(audit_consumer, publisher, config.redelivery_policy());
    let timeout_handler = Arc::new(TimeoutHandler::new(service.clone()));

    tokio::spawn(async move {
        relay.run().await;
    });

    tokio::spawn(async move {
        timeout_subscriber.run(timeout_handler).await;
    });

    tokio::spawn(async move {
        audit_subscriber.run(Arc::new(ReserveAuditHandler)).await;
    });

    let app = api::create_router(api::AppState { service });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Order service started on port {}", config.port);
    info!(timeout_secs = config.order_timeout_secs, "Unpaid orders close after the order timeout");

    axum::serve(listener, app).await?;

    Ok(())
}
