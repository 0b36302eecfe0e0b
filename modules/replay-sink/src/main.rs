use replay_bus::{DurableStream, InMemoryStream, JetStreamBus};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use replay_sink::config::{BusType, Config, StoreType};
use replay_sink::dlq::DeadLetter;
use replay_sink::health::{self, HealthState};
use replay_sink::jetstream_setup;
use replay_sink::metrics::Metrics;
use replay_sink::store::{ClickHouseStore, EventStore, InMemoryStore};
use replay_sink::{SinkError, SinkPool, SinkSettings};

#[tokio::main]
async fn main() -> Result<(), SinkError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let metrics = Metrics::new()?;

    // Durable stream (fail-fast)
    let bus: Arc<dyn DurableStream> = match config.bus_type {
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            Arc::new(JetStreamBus::connect(&config.nats_url).await?)
        }
        BusType::InMemory => {
            tracing::info!("Using in-memory stream");
            Arc::new(InMemoryStream::new())
        }
    };

    let store: Arc<dyn EventStore> = match config.store_type {
        StoreType::ClickHouse => Arc::new(ClickHouseStore::new(config.clickhouse.clone())),
        StoreType::InMemory => {
            tracing::info!("Using in-memory event store");
            Arc::new(InMemoryStore::new())
        }
    };

    let health_state = Arc::new(HealthState {
        store: Arc::clone(&store),
        bus: Arc::clone(&bus),
        metrics: metrics.clone(),
    });
    health_state.check_stream();

    // Stream, consumer and schema (fail-fast)
    let consumer = jetstream_setup::provision(bus.as_ref(), store.as_ref(), &config).await?;
    metrics.set_dependency("store", true);

    let pool = SinkPool::spawn(
        config.worker_count,
        consumer,
        Arc::clone(&store),
        DeadLetter::new(Arc::clone(&bus), config.dlq_subject.clone()),
        SinkSettings::from_config(&config),
        Some(metrics.clone()),
    );

    let app = health::router(health_state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Replay sink listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.shutdown().await;
    tracing::info!("Replay sink stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping gracefully...");
}
