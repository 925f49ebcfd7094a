use serde::Serialize;
use std::{io, path::Path};
use tokio::fs;

pub const DEFAULT_MODEL_NAME: &str = "yolov8n.pt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Default,
    Pytorch,
    Onnx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub model_type: ModelType,
}

impl ModelInfo {
    fn default_model() -> Self {
        Self {
            name: DEFAULT_MODEL_NAME.to_string(),
            path: None,
            model_type: ModelType::Default,
        }
    }
}

fn model_type(file_name: &str) -> Option<ModelType> {
    match Path::new(file_name).extension()?.to_str()? {
        "pt" => Some(ModelType::Pytorch),
        "onnx" => Some(ModelType::Onnx),
        _ => None,
    }
}

/// The built-in model followed by every weights file in `dir`, sorted by name.
pub async fn discover_models(dir: &Path) -> io::Result<Vec<ModelInfo>> {
    let mut found = Vec::new();

    match fs::read_dir(dir).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if let Some(model_type) = model_type(&name) {
                    found.push(ModelInfo {
                        path: Some(entry.path().to_string_lossy().into_owned()),
                        name,
                        model_type,
                    });
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "Models directory does not exist");
        }
        Err(e) => return Err(e),
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));

    let mut models = vec![ModelInfo::default_model()];
    models.extend(found);
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_discover_models() {
        let dir = std::env::temp_dir().join(format!("yolo_web_models_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).await.unwrap();
        for name in ["zebra.onnx", "best.pt", "notes.txt"] {
            fs::write(dir.join(name), b"weights").await.unwrap();
        }

        let models = discover_models(&dir).await.unwrap();
        let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();

        assert_eq!(names, vec!["yolov8n.pt", "best.pt", "zebra.onnx"]);
        assert_eq!(models[0].path, None);
        assert_eq!(models[1].model_type, ModelType::Pytorch);
        assert_eq!(models[2].model_type, ModelType::Onnx);
        assert!(models[1].path.as_deref().unwrap().ends_with("best.pt"));

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_dir_lists_default_only() {
        let models = discover_models(Path::new("/nonexistent/models")).await.unwrap();

        assert_eq!(models, vec![ModelInfo::default_model()]);
        assert_eq!(
            serde_json::to_value(&models[0]).unwrap(),
            serde_json::json!({"name": "yolov8n.pt", "path": null, "type": "default"})
        );
    }
}
