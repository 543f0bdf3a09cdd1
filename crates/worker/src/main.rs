use std::sync::Arc;

use anyhow::Context;

use courier_infra::pool::{ConnectionPoolManager, PgConnector};
use courier_infra::queue::PostgresQueueStore;
use courier_infra::tenants::PostgresTenantDirectory;
use courier_infra::workers::QueueWorker;
use courier_infra::{CircuitBreakerRegistry, CourierConfig, RateLimiterRegistry};
use courier_worker::relay::HttpRelayTransport;
use courier_worker::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    courier_observability::init_with(settings.log_format);

    let config = CourierConfig::from_env().context("loading COURIER_* configuration")?;

    let connector = PgConnector::new(config.pool.clone()).context("configuring postgres")?;
    let pools = Arc::new(ConnectionPoolManager::new(connector));
    pools
        .get_system_connection()
        .await
        .context("connecting to the system database")?;

    let store = PostgresQueueStore::new(pools.clone()).with_stale_after(config.stale_processing_after);
    let tenants = PostgresTenantDirectory::new(pools.clone());
    let transport = HttpRelayTransport::new(&settings.relay.url, settings.relay.timeout)
        .context("building relay transport")?;

    let mut handle = QueueWorker::new(
        Arc::new(store),
        Arc::new(tenants),
        Arc::new(transport),
        config.worker.clone(),
    )
    .with_rate_limiters(Arc::new(RateLimiterRegistry::new(config.rate_limiter)))
    .with_circuit_breakers(Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker)))
    .spawn();

    tracing::info!(
        worker = %config.worker.name,
        relay = %settings.relay.url,
        "courier worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    handle.shutdown().await;
    let stats = handle.run_stats();
    tracing::info!(
        polls = stats.polls,
        sent = stats.sent,
        failed = stats.failed,
        dead_lettered = stats.dead_lettered,
        deferred = stats.deferred,
        "courier worker stopped"
    );

    pools.cleanup().await;
    Ok(())
}
