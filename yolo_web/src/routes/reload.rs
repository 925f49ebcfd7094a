use crate::{routes::ApiError, server::SharedState};
use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use yolo_worker::{error::PredictError, types::ModelSelector};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReloadRequest {
    #[serde(default)]
    model_path: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct ReloadResponse {
    success: bool,
    message: String,
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

#[instrument(skip(state))]
pub async fn reload_model(
    State(state): State<SharedState>,
    body: Result<Json<ReloadRequest>, JsonRejection>,
) -> Result<Json<ReloadResponse>, ApiError> {
    state.metrics.record_request("/api/models/reload");

    let Json(body) = body?;
    let model = ModelSelector::from(body.model_path);
    let worker = state
        .worker
        .as_ref()
        .ok_or(ApiError::Predict(PredictError::WorkerUnavailable))?;

    tracing::info!(model = %model, "Reloading model");
    worker.reload(model.clone()).await?;

    Ok(Json(ReloadResponse {
        success: true,
        message: format!("Model {} loaded", model),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{test_state, MockPredictor};
    use axum::{http::StatusCode, response::IntoResponse};

    #[tokio::test]
    async fn test_reload_without_worker_is_unavailable() {
        let state = test_state(MockPredictor::unavailable());
        let request = ReloadRequest {
            model_path: Some("models/best.pt".into()),
        };

        let err = reload_model(State(state), Ok(Json(request)))
            .await
            .unwrap_err();

        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_through_worker() {
        use std::time::Duration;
        use yolo_worker::{config::WorkerConfig, types::WorkerState, WorkerHandle};

        let script = r#"
echo "READY:Model loaded successfully"
while IFS= read -r line; do
  case "$line" in
    *'"action":"reload"'*) echo "READY:Model reloaded" ;;
    *'"action":"shutdown"'*) exit 0 ;;
  esac
done
"#;
        let handle = WorkerHandle::start(&WorkerConfig::new(
            "sh",
            vec!["-c".into(), script.into()],
        ));
        let mut rx = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == WorkerState::Ready),
        )
        .await
        .unwrap()
        .unwrap();

        let mut state = test_state(MockPredictor::ready());
        state.worker = Some(handle.clone());
        let request = ReloadRequest {
            model_path: Some("models/best.pt".into()),
        };

        let Json(response) = reload_model(State(state), Ok(Json(request)))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.message, "Model models/best.pt loaded");
        assert_eq!(handle.state(), WorkerState::Ready);
        handle.shutdown().await;
    }
}
