//! Line protocol spoken with the inference worker over its stdin/stdout.
//!
//! Outbound messages are single-line JSON objects tagged by `action`.
//! Inbound messages are tagged by a prefix: `READY:`, `RESULT:<json>`,
//! `ERROR:<text>`. Anything else is plain diagnostic output.

use crate::types::{JobId, ModelSelector, PredictionResult};
use serde::{Deserialize, Serialize};

const READY_TAG: &str = "READY:";
const RESULT_TAG: &str = "RESULT:";
const ERROR_TAG: &str = "ERROR:";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum WorkerCommand {
    Predict {
        job_id: JobId,
        image_path: String,
        model_path: ModelSelector,
        output_dir: String,
    },
    Reload {
        model_path: ModelSelector,
    },
    Shutdown,
}

impl WorkerCommand {
    /// Serializes the command as one line, without the trailing newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Ready(String),
    Result(Box<PredictionResult>),
    MalformedResult { payload: String, error: String },
    Error(String),
    Output(String),
}

pub fn parse_line(line: &str) -> WorkerEvent {
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');

    if let Some(message) = line.strip_prefix(READY_TAG) {
        return WorkerEvent::Ready(message.trim().to_string());
    }

    if let Some(payload) = line.strip_prefix(RESULT_TAG) {
        return match serde_json::from_str::<PredictionResult>(payload) {
            Ok(result) => WorkerEvent::Result(Box::new(result)),
            Err(e) => WorkerEvent::MalformedResult {
                payload: payload.to_string(),
                error: e.to_string(),
            },
        };
    }

    if let Some(message) = line.strip_prefix(ERROR_TAG) {
        return WorkerEvent::Error(message.trim().to_string());
    }

    WorkerEvent::Output(line.to_string())
}
