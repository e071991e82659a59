use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy_bus::PostgresMessageBus;
use convoy_orchestrator::{EventRouter, Orchestrator, RouterConfig};
use convoy_storage::Database;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "convoy_orchestrator=info,convoy_storage=info,convoy_bus=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("convoy-orchestrator starting");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let db = Database::from_url(&database_url).await?;
    db.migrate().await?;
    tracing::info!("database ready");

    let bus: Arc<PostgresMessageBus> = Arc::new(PostgresMessageBus::new(db.pool().clone()));
    let orchestrator = Arc::new(Orchestrator::new(db, bus.clone()));
    let router = EventRouter::new(orchestrator, bus, RouterConfig::from_env());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    router.run(shutdown_rx).await
}
