use crate::{
    config::{Config, Environment, ModelsConfig, StorageConfig},
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use yolo_worker::{
    predictor::Predictor,
    types::{OUTPUTS_URL_PREFIX, UPLOADS_URL_PREFIX},
    WorkerHandle,
};

#[derive(Clone)]
pub struct SharedState {
    pub predictor: Arc<dyn Predictor>,
    /// Persistent worker, for operations that only it supports.
    pub worker: Option<WorkerHandle>,
    pub storage: StorageConfig,
    pub models: ModelsConfig,
    pub environment: Environment,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        worker: Option<WorkerHandle>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            predictor,
            worker,
            storage: config.storage.clone(),
            models: config.models.clone(),
            environment: config.environment,
            metrics,
        }
    }
}

pub fn router(state: SharedState) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();
    let body_limit = state.storage.max_upload_bytes;
    let uploads = ServeDir::new(&state.storage.upload_dir);
    let outputs = ServeDir::new(&state.storage.output_dir);

    Router::new()
        .merge(api_routes())
        .nest_service(UPLOADS_URL_PREFIX, uploads)
        .nest_service(OUTPUTS_URL_PREFIX, outputs)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(metrics_layer)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let router = router(state);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
