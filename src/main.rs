use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

use ruuvi_ingest::bluetooth::BluerRadio;
use ruuvi_ingest::config::SensorConfig;
use ruuvi_ingest::database::PostgresSink;
use ruuvi_ingest::service::{LifecycleState, Service};

/// Resolve on Ctrl+C or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SensorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    info!(
        "Configured for {} sensors, flushing every {:?}",
        if config.tags.is_empty() {
            "all".to_string()
        } else {
            config.tags.len().to_string()
        },
        config.flush_interval
    );

    let radio = Arc::new(BluerRadio::new());
    let (state, _) = watch::channel(LifecycleState::Starting);
    let service = Service::start(&config, radio, PostgresSink::connect(&config), state).await?;

    match service.run(shutdown_signal()).await {
        Ok(report) => {
            info!("Stopped, {}", report);
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {}", e);
            Err(e.into())
        }
    }
}
