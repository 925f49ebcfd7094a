mod health;
mod metrics;
mod models;
mod predict;
mod reload;

use crate::{server::SharedState, storage::StorageError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use yolo_worker::error::PredictError;

pub use health::health;
pub use metrics::metrics_handler;
pub use models::list_models;
pub use predict::predict;
pub use reload::reload_model;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/models/reload", post(reload_model))
        .route("/api/predict", post(predict))
        .route("/metrics", get(metrics_handler))
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{1}")]
    Multipart(StatusCode, String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Multipart(status, _) => *status,
            ApiError::Storage(StorageError::UnsupportedExtension) => StatusCode::BAD_REQUEST,
            ApiError::Storage(StorageError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Predict(PredictError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Predict(
                PredictError::WorkerUnavailable
                | PredictError::WorkerBusy
                | PredictError::ShuttingDown,
            ) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Predict(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut body = json!({ "success": false, "error": self.to_string() });
        if let ApiError::Predict(e) = &self {
            if let Some(details) = e.details() {
                body["details"] = json!(details);
            }
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{
        config::{Environment, ModelsConfig, StorageConfig},
        server::SharedState,
        telemetry::Metrics,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;
    use yolo_worker::{
        error::PredictError,
        predictor::{Predictor, Strategy},
        types::{PredictRequest, PredictionResult},
    };

    type Respond = dyn Fn(&PredictRequest) -> Result<PredictionResult, PredictError> + Send + Sync;

    pub struct MockPredictor {
        ready: bool,
        respond: Box<Respond>,
        pub requests: Mutex<Vec<PredictRequest>>,
    }

    impl MockPredictor {
        pub fn new(
            ready: bool,
            respond: impl Fn(&PredictRequest) -> Result<PredictionResult, PredictError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                ready,
                respond: Box::new(respond),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Answers like a worker that annotated the image into the output dir.
        pub fn ready() -> Self {
            Self::new(true, |request| {
                let name = std::path::Path::new(&request.image_path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(PredictionResult {
                    success: true,
                    input_image: Some(request.image_path.clone()),
                    output_image: Some(format!("{}/{}", request.output_dir, name)),
                    ..Default::default()
                }
                .with_urls())
            })
        }

        pub fn unavailable() -> Self {
            Self::new(false, |_| Err(PredictError::WorkerUnavailable))
        }
    }

    #[async_trait]
    impl Predictor for MockPredictor {
        async fn predict(&self, request: PredictRequest) -> Result<PredictionResult, PredictError> {
            let response = (self.respond)(&request);
            self.requests.lock().unwrap().push(request);
            response
        }

        fn is_available(&self) -> bool {
            self.ready
        }

        fn strategy(&self) -> Strategy {
            if self.ready {
                Strategy::Persistent
            } else {
                Strategy::Fallback
            }
        }
    }

    pub fn test_state(predictor: MockPredictor) -> SharedState {
        test_state_with(Arc::new(predictor))
    }

    pub fn test_state_with(predictor: Arc<dyn Predictor>) -> SharedState {
        let root = std::env::temp_dir().join(format!("yolo_web_routes_{}", Uuid::new_v4()));
        SharedState {
            predictor,
            worker: None,
            storage: StorageConfig {
                upload_dir: root.join("uploads"),
                output_dir: root.join("outputs"),
                max_upload_bytes: 1024 * 1024,
                max_age_secs: 3600,
                sweep_interval_secs: 3600,
            },
            models: ModelsConfig {
                dir: root.join("models"),
            },
            environment: Environment::Local,
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::Predict(PredictError::Timeout(Duration::from_secs(60))).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::Storage(StorageError::UnsupportedExtension).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Predict(PredictError::WorkerUnavailable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_error_body_is_json() {
        let response = ApiError::Predict(PredictError::FallbackParse {
            message: "no JSON result in inference output".into(),
            stderr: "ModuleNotFoundError: ultralytics".into(),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(body["success"], false);
        assert_eq!(
            body["error"],
            "Failed to parse inference output: no JSON result in inference output"
        );
        assert_eq!(body["details"], "ModuleNotFoundError: ultralytics");
    }
}
