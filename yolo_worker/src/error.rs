use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawned process is missing its {0} pipe")]
    MissingPipe(&'static str),
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Prediction timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Inference worker is not ready")]
    WorkerUnavailable,
    #[error("Inference worker is busy")]
    WorkerBusy,
    #[error("Inference worker reported an error: {0}")]
    Worker(String),
    #[error("Inference worker is shutting down")]
    ShuttingDown,
    #[error("Failed to send command to worker: {0}")]
    Channel(String),
    #[error("Failed to start inference process: {0}")]
    Spawn(#[from] SpawnError),
    #[error("Failed to parse inference output: {message}")]
    FallbackParse { message: String, stderr: String },
    #[error("Failed to encode worker command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PredictError {
    /// Extra diagnostic text captured from the failing process, if any.
    pub fn details(&self) -> Option<&str> {
        match self {
            PredictError::FallbackParse { stderr, .. } if !stderr.trim().is_empty() => {
                Some(stderr.trim())
            }
            _ => None,
        }
    }
}
