use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::Serialize;
use tracing::instrument;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    status: String,
    message: String,
    model_loaded: bool,
    environment: String,
}

#[instrument(skip(state))]
pub async fn health(State(state): State<SharedState>) -> Json<HealthStatus> {
    state.metrics.record_request("/api/health");

    let model_loaded = state.predictor.is_available();
    let message = if model_loaded {
        "YOLO inference server is running"
    } else {
        "YOLO inference server is running, model not loaded"
    };

    Json(HealthStatus {
        status: "OK".into(),
        message: message.into(),
        model_loaded,
        environment: state.environment.as_str().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{test_state, MockPredictor};

    #[tokio::test]
    async fn test_health_reports_model_state() {
        let state = test_state(MockPredictor::ready());
        let Json(status) = health(State(state)).await;

        assert!(status.model_loaded);
        assert_eq!(status.environment, "local");

        let state = test_state(MockPredictor::unavailable());
        let Json(status) = health(State(state)).await;
        let body = serde_json::to_value(&status).unwrap();

        assert_eq!(body["status"], "OK");
        assert_eq!(body["modelLoaded"], false);
    }
}
