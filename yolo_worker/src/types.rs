use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path};

/// URL prefix under which uploaded images are served.
pub const UPLOADS_URL_PREFIX: &str = "/uploads";
/// URL prefix under which annotated images are served.
pub const OUTPUTS_URL_PREFIX: &str = "/outputs";

pub type JobId = u64;

/// Which weights the worker should run a prediction with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelSelector {
    #[default]
    Default,
    Path(String),
}

impl ModelSelector {
    pub fn as_str(&self) -> &str {
        match self {
            ModelSelector::Default => "default",
            ModelSelector::Path(path) => path,
        }
    }
}

impl From<String> for ModelSelector {
    fn from(s: String) -> Self {
        match s.trim() {
            "" | "default" | "null" => ModelSelector::Default,
            path => ModelSelector::Path(path.to_string()),
        }
    }
}

impl From<Option<String>> for ModelSelector {
    fn from(s: Option<String>) -> Self {
        s.map(ModelSelector::from).unwrap_or_default()
    }
}

impl From<ModelSelector> for String {
    fn from(selector: ModelSelector) -> Self {
        selector.as_str().to_string()
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks for; becomes a [`Job`] once the queue assigns it an id.
#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub image_path: String,
    pub model: ModelSelector,
    pub output_dir: String,
}

impl PredictRequest {
    pub fn new(
        image_path: impl Into<String>,
        model: ModelSelector,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            image_path: image_path.into(),
            model,
            output_dir: output_dir.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub image_path: String,
    pub model_selector: ModelSelector,
    pub output_directory: String,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, request: PredictRequest) -> Self {
        Self {
            id,
            image_path: request.image_path,
            model_selector: request.model,
            output_directory: request.output_dir,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Crashed,
    Stopped,
}

impl WorkerState {
    /// The model is loaded: either idle or working through the queue.
    pub fn is_available(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Crashed => "crashed",
            WorkerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<u32>,
    pub class_name: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionStats {
    pub total_detections: u32,
    pub unique_classes: u32,
    pub avg_confidence: f32,
    pub max_confidence: f32,
    pub min_confidence: f32,
    pub classes_detected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub success: bool,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_image: Option<String>,
    #[serde(default)]
    pub stats: DetectionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Echoed back by workers that understand job ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_image_url: Option<String>,
}

impl PredictionResult {
    /// Maps the worker's absolute file paths onto the static routes that serve them.
    pub fn with_urls(mut self) -> Self {
        self.output_image_url = self
            .output_image
            .as_deref()
            .and_then(|path| served_url(OUTPUTS_URL_PREFIX, path));
        self.input_image_url = self
            .input_image
            .as_deref()
            .and_then(|path| served_url(UPLOADS_URL_PREFIX, path));
        self
    }
}

fn served_url(prefix: &str, path: &str) -> Option<String> {
    let file_name = Path::new(path).file_name()?.to_str()?;
    Some(format!("{}/{}", prefix, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_availability() {
        assert!(WorkerState::Ready.is_available());
        assert!(WorkerState::Busy.is_available());
        assert!(!WorkerState::Starting.is_available());
        assert!(!WorkerState::Crashed.is_available());
        assert_eq!(WorkerState::Crashed.as_str(), "crashed");
    }

    #[test]
    fn test_model_selector_from_form_value() {
        assert_eq!(ModelSelector::from(String::new()), ModelSelector::Default);
        assert_eq!(ModelSelector::from("null".to_string()), ModelSelector::Default);
        assert_eq!(ModelSelector::from(None), ModelSelector::Default);
        assert_eq!(
            ModelSelector::from(" models/best.pt ".to_string()),
            ModelSelector::Path("models/best.pt".into())
        );
    }

    #[test]
    fn test_with_urls_rewrites_absolute_paths() {
        let result = PredictionResult {
            success: true,
            output_image: Some("/srv/outputs/cat_predicted.jpg".into()),
            input_image: Some("/srv/uploads/cat.jpg".into()),
            ..Default::default()
        }
        .with_urls();

        assert_eq!(
            result.output_image_url.as_deref(),
            Some("/outputs/cat_predicted.jpg")
        );
        assert_eq!(result.input_image_url.as_deref(), Some("/uploads/cat.jpg"));
    }

    #[test]
    fn test_result_accepts_empty_stats() {
        let raw = r#"{"success":true,"output_image":"/x/out1.jpg","input_image":"/x/cat.jpg","detections":[],"stats":{}}"#;
        let result: PredictionResult = serde_json::from_str(raw).unwrap();

        assert!(result.success);
        assert_eq!(result.stats, DetectionStats::default());
        assert!(result.output_image_url.is_none());
    }

    #[test]
    fn test_failed_result_has_no_paths() {
        let result: PredictionResult =
            serde_json::from_str(r#"{"success":false,"error":"boom"}"#).unwrap();
        let result = result.with_urls();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.output_image_url.is_none());
    }
}
