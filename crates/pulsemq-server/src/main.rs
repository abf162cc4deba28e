//! PulseMQ Server - Message Broker
//!
//! Serves the line-delimited JSON protocol over TCP and the admin API over HTTP.

mod api;
mod connection;
mod protocol;
mod settings;

use std::sync::Arc;

use pulsemq_core::Broker;
use pulsemq_storage::FileStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{create_router, AppState};
use crate::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    // Initialize logging
    let level = settings.tracing_level();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("pulsemq={level},pulsemq_core={level},pulsemq_storage={level},tower_http={level}").into()
        }))
        .with(settings.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!settings.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    // Create broker with file snapshots
    let store = FileStore::open(&settings.data_dir).await?;
    let broker = Arc::new(Broker::new(settings.error_mode).with_store(Arc::new(store)));
    broker.start_maintenance();

    for queue in &settings.queues {
        broker
            .create_queue(queue.name.clone(), settings.queue_config(queue))
            .await?;
        info!(queue = %queue.name, "Queue ready");
    }

    let shutdown = CancellationToken::new();

    // Protocol listener
    let listener = TcpListener::bind(settings.bind_addr()).await?;
    info!("PulseMQ listening on {}", settings.bind_addr());
    let tcp_task = tokio::spawn(connection::serve(listener, Arc::clone(&broker), shutdown.clone()));

    // Admin API
    let app = create_router(AppState {
        broker: Arc::clone(&broker),
        default_config: settings.default_queue_config(),
    });
    let admin_listener = TcpListener::bind(settings.admin_addr()).await?;
    info!("Admin API listening on {}", settings.admin_addr());
    info!("Swagger UI: http://{}/swagger-ui/", settings.admin_addr());
    let admin_shutdown = shutdown.clone();
    let admin_task = tokio::spawn(async move {
        axum::serve(admin_listener, app)
            .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    shutdown.cancel();
    broker.stop_all().await;

    if let Err(e) = tcp_task.await {
        error!(error = %e, "TCP listener task failed");
    }
    match admin_task.await {
        Ok(Err(e)) => error!(error = %e, "Admin server failed"),
        Err(e) => error!(error = %e, "Admin server task failed"),
        Ok(Ok(())) => {}
    }

    info!("PulseMQ stopped");
    Ok(())
}
