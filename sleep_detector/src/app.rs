use crate::config::Config;
use crate::detector::Detector;
use crate::server::{HttpServer, SharedState};
use crate::telemetry::Metrics;
use crate::vision::GroqClient;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let client = match GroqClient::new(&config.vision) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to initialize vision client: {:?}", e);
            return Err(e.into());
        }
    };
    if !client.has_api_key() {
        tracing::warn!("GROQ_API_KEY is not set, every detection will report an error");
    }
    tracing::info!("Using vision model {}", config.vision.model);

    let metrics = Arc::new(Metrics::new()?);
    let detector = Arc::new(Detector::new(Arc::new(client), metrics.clone()));
    let state = SharedState { detector, metrics };

    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
