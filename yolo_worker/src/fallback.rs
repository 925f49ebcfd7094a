use crate::{
    config::FallbackConfig,
    error::{PredictError, SpawnError},
    types::{PredictRequest, PredictionResult},
};
use std::process::Stdio;
use tokio::process::Command;

/// Runs one throwaway inference process per request.
#[derive(Debug, Clone)]
pub struct OneShotInvoker {
    config: FallbackConfig,
}

impl OneShotInvoker {
    pub fn new(config: &FallbackConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub async fn invoke(&self, request: &PredictRequest) -> Result<PredictionResult, PredictError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(&request.image_path)
            .arg(request.model.as_str())
            .arg(&request.output_dir)
            .env("PYTHONUNBUFFERED", "1")
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        tracing::debug!(image = %request.image_path, model = %request.model, "Running one-shot inference");
        let output = command
            .output()
            .await
            .map_err(|e| PredictError::Spawn(SpawnError::Spawn(e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(PredictError::FallbackParse {
                message: format!("inference process exited with {}", output.status),
                stderr,
            });
        }

        parse_output(&stdout, stderr)
    }
}

/// The result is the last stdout line that looks like a JSON object; earlier lines are progress chatter.
fn parse_output(stdout: &str, stderr: String) -> Result<PredictionResult, PredictError> {
    let Some(line) = stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .last()
    else {
        return Err(PredictError::FallbackParse {
            message: "no JSON result in inference output".to_string(),
            stderr,
        });
    };

    match serde_json::from_str::<PredictionResult>(line) {
        Ok(result) => Ok(result.with_urls()),
        Err(e) => Err(PredictError::FallbackParse {
            message: e.to_string(),
            stderr,
        }),
    }
}
