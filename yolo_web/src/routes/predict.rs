use crate::{routes::ApiError, server::SharedState, storage::save_upload};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use std::time::Instant;
use tracing::instrument;
use yolo_worker::types::{ModelSelector, PredictRequest};

const IMAGE_FIELD: &str = "image";
const MODEL_FIELD: &str = "modelPath";
const INFERENCE_FAILED: &str = "Inference failed";

#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub data: Bytes,
    pub model: ModelSelector,
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::Multipart(e.status(), e.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        ApiError::Multipart(e.status(), e.body_text())
    }
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut image = None;
    let mut model = ModelSelector::Default;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(IMAGE_FIELD) => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                image = Some((file_name, field.bytes().await?));
            }
            Some(MODEL_FIELD) => model = ModelSelector::from(field.text().await?),
            _ => {}
        }
    }

    let (file_name, data) =
        image.ok_or_else(|| ApiError::BadRequest("No image file provided".into()))?;
    if data.is_empty() {
        return Err(ApiError::BadRequest("Uploaded image is empty".into()));
    }

    Ok(Upload {
        file_name,
        data,
        model,
    })
}

#[instrument(skip(state, multipart))]
pub async fn predict(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    state.metrics.record_request("/api/predict");

    let upload = read_upload(multipart?).await?;
    run_prediction(&state, upload).await
}

/// Stores the upload and runs it through the configured predictor.
pub async fn run_prediction(state: &SharedState, upload: Upload) -> Result<Response, ApiError> {
    let image_path = save_upload(&state.storage.upload_dir, &upload.file_name, &upload.data).await?;
    let request = PredictRequest::new(
        image_path.to_string_lossy(),
        upload.model,
        state.storage.output_dir.to_string_lossy(),
    );

    tracing::info!(
        image = %request.image_path,
        model = %request.model,
        "Running prediction"
    );

    let start = Instant::now();
    let (strategy, result) = state.predictor.dispatch(request).await;
    let mut result = result.inspect_err(|e| {
        tracing::error!(error = %e, strategy = strategy.as_str(), "Prediction failed");
        state.metrics.record_prediction_failure(strategy.as_str());
    })?;
    state
        .metrics
        .record_prediction_duration(start.elapsed().as_millis() as u64, strategy.as_str());

    if result.success {
        tracing::info!(
            detections = result.detections.len(),
            strategy = strategy.as_str(),
            "Prediction completed"
        );
        Ok(Json(result).into_response())
    } else {
        let error = result.error.get_or_insert_with(|| INFERENCE_FAILED.to_string());
        tracing::warn!(%error, strategy = strategy.as_str(), "Worker reported an unsuccessful prediction");
        state.metrics.record_prediction_failure(strategy.as_str());
        Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(result)).into_response())
    }
}
