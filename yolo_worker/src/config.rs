use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// How to launch and supervise the long-lived inference worker.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_respawn_delay_ms() -> u64 {
    5_000
}

fn default_job_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl WorkerConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
            respawn_delay_ms: default_respawn_delay_ms(),
            job_timeout_ms: default_job_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }

    pub fn get_respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    pub fn get_job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn get_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// How to launch a throwaway one-shot inference process.
#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl FallbackConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{"program":"python3","args":["python/inference_server.py"]}"#,
        )
        .unwrap();

        assert_eq!(config.get_respawn_delay(), Duration::from_secs(5));
        assert_eq!(config.get_job_timeout(), Duration::from_secs(60));
        assert!(config.env.is_empty());
        assert!(config.working_dir.is_none());
    }
}
