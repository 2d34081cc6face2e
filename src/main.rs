use marketplace_payments::api::{self, ApiState};
use marketplace_payments::config::AppConfig;
use marketplace_payments::database::{init_pool_from_config, run_migrations, Repositories};
use marketplace_payments::health::HealthChecker;
use marketplace_payments::logging::init_tracing;
use marketplace_payments::middleware::logging::{request_logging_middleware, UuidRequestId};
use marketplace_payments::payments::factory::ProviderRegistry;
use marketplace_payments::services::Services;
use marketplace_payments::workers::{BillingCycleWorker, ReconciliationSweepWorker};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.validate()?;

    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        "starting marketplace payments service"
    );

    let repos = match config.database.url.as_deref() {
        Some(url) => {
            let pool = init_pool_from_config(&config.database, url)
                .await
                .map_err(|e| {
                    error!(error = %e, "failed to initialize database pool");
                    e
                })?;
            run_migrations(&pool).await?;
            info!(
                max_connections = pool.options().get_max_connections(),
                "database connection pool initialized"
            );
            Repositories::postgres(pool)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store; nothing will persist");
            Repositories::in_memory()
        }
    };

    let providers = ProviderRegistry::from_env();
    let available = providers.list_available();
    if available.is_empty() {
        warn!("no payment providers configured");
    } else {
        info!(providers = ?available, "payment providers registered");
    }

    let services = Services::new(
        &repos,
        providers.clone(),
        config.billing.clone(),
        config.payout.clone(),
    );
    let health = Arc::new(HealthChecker::new(repos.clone(), providers));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handles = Vec::new();

    let sweep = ReconciliationSweepWorker::new(
        services.reconciliation.clone(),
        config.reconciliation.clone(),
    );
    worker_handles.push(tokio::spawn(sweep.run(shutdown_rx.clone())));

    let billing_cycle = BillingCycleWorker::new(
        services.billing.clone(),
        config.billing.cycle_poll_interval,
    );
    worker_handles.push(tokio::spawn(billing_cycle.run(shutdown_rx)));

    let app = api::router(ApiState { services, health }).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(axum::middleware::from_fn(request_logging_middleware))
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx))
        .await?;

    for handle in worker_handles {
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("worker did not stop within 5s");
        }
    }

    info!("server shut down");
    Ok(())
}
