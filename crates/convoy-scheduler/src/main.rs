use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy_bus::{MessageBus, PostgresMessageBus, SubscriptionSpec};
use convoy_core::{SUB_ORCHESTRATOR, TOPIC_ORCHESTRATOR_EVENTS, TOPIC_WORKER_RESULTS};
use convoy_datasource::SourceRegistry;
use convoy_scheduler::{Scheduler, SchedulerConfig};
use convoy_storage::Database;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_scheduler=info,convoy_storage=info,convoy_bus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("convoy-scheduler starting");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let db = Database::from_url(&database_url).await?;
    db.migrate().await?;
    tracing::info!("database ready");

    let bus = Arc::new(PostgresMessageBus::new(db.pool().clone()));

    // The orchestrator owns these subscriptions, but ensuring them here too
    // means events published before its first start are not lost
    bus.ensure_subscription(&SubscriptionSpec::new(TOPIC_ORCHESTRATOR_EVENTS, SUB_ORCHESTRATOR))
        .await?;
    bus.ensure_subscription(&SubscriptionSpec::new(TOPIC_WORKER_RESULTS, SUB_ORCHESTRATOR))
        .await?;

    let scheduler = Scheduler::new(
        db,
        bus,
        SourceRegistry::new(),
        SchedulerConfig::from_env(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler.run(shutdown_rx).await
}
