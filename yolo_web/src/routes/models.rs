use crate::{
    models::{discover_models, ModelInfo},
    routes::ApiError,
    server::SharedState,
};
use axum::{extract::State, response::Json};
use serde::Serialize;
use tracing::instrument;

#[derive(Serialize, Debug)]
pub struct ModelList {
    success: bool,
    models: Vec<ModelInfo>,
}

#[instrument(skip(state))]
pub async fn list_models(State(state): State<SharedState>) -> Result<Json<ModelList>, ApiError> {
    state.metrics.record_request("/api/models");

    let models = discover_models(&state.models.dir)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to list models: {}", e)))?;

    Ok(Json(ModelList {
        success: true,
        models,
    }))
}
