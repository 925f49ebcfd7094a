use crate::{routes::ApiError, server::SharedState};
use axum::{extract::State, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Internal(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer).map_err(|e| ApiError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{test_state, MockPredictor};

    #[tokio::test]
    async fn test_metrics_exposes_request_counter() {
        let state = test_state(MockPredictor::ready());
        state.metrics.record_request("/api/health");

        let body = metrics_handler(State(state))
            .await
            .unwrap()
            .into_response();
        let body = axum::body::to_bytes(body.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("requests_total"));
        assert!(text.contains("/api/health"));
    }
}
