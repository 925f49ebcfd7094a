use crate::{
    config::{Config, StorageConfig},
    server::{HttpServer, SharedState},
    storage::start_sweeper,
    telemetry::Metrics,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, signal, sync::broadcast};
use yolo_worker::{fallback::OneShotInvoker, predictor::FailoverPredictor, WorkerHandle};

pub async fn start_app(mut config: Config) -> anyhow::Result<()> {
    config.storage = prepare_storage(config.storage).await?;
    tracing::info!(
        environment = config.environment.as_str(),
        uploads = %config.storage.upload_dir.display(),
        outputs = %config.storage.output_dir.display(),
        "Starting YOLO web service"
    );

    let worker = WorkerHandle::start(&config.worker);
    let fallback = OneShotInvoker::new(&config.fallback);
    let predictor = Arc::new(FailoverPredictor::new(worker.clone(), fallback));

    let metrics = Arc::new(Metrics::new()?);
    let state = SharedState::new(predictor, Some(worker.clone()), &config, metrics);
    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();
    let sweeper_shutdown_rx = shutdown_tx.subscribe();

    let sweeper_handle = start_sweeper(config.storage.clone(), sweeper_shutdown_rx);
    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("HTTP server failed: {:?}", e),
        Err(e) => tracing::error!("HTTP server task failed: {:?}", e),
        Ok(Ok(())) => {}
    }
    let _ = sweeper_handle.await;

    worker.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Creates the storage directories and makes their paths absolute, so the worker
/// can resolve them from its own working directory.
async fn prepare_storage(mut storage: StorageConfig) -> anyhow::Result<StorageConfig> {
    storage.upload_dir = ensure_dir(&storage.upload_dir).await?;
    storage.output_dir = ensure_dir(&storage.output_dir).await?;
    Ok(storage)
}

async fn ensure_dir(dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    Ok(fs::canonicalize(dir).await?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
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

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_prepare_storage_makes_absolute_dirs() {
        let root = std::env::temp_dir().join(format!("yolo_web_app_{}", Uuid::new_v4()));
        let storage = StorageConfig {
            upload_dir: root.join("uploads"),
            output_dir: root.join("outputs"),
            max_upload_bytes: 1024,
            max_age_secs: 60,
            sweep_interval_secs: 60,
        };

        let storage = prepare_storage(storage).await.unwrap();

        assert!(storage.upload_dir.is_absolute());
        assert!(storage.output_dir.is_dir());
        fs::remove_dir_all(&root).await.unwrap();
    }
}
