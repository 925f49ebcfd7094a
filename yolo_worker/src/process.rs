//! Worker process lifecycle.
//!
//! Spawns the inference worker with piped stdio, feeds its stdout to the
//! dispatcher line by line, forwards stderr to the log, and respawns it after
//! a fixed delay when it dies.

use crate::{
    config::WorkerConfig,
    error::SpawnError,
    protocol::parse_line,
    queue::{CommandWriter, Event},
};
use futures::StreamExt;
use std::{
    collections::HashMap,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::{
    codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec},
    sync::CancellationToken,
};

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on one line of worker output.
const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Extension point for launching the worker process.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandSpawner {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("PYTHONUNBUFFERED", "1")
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        tracing::info!(program = %self.program, args = ?self.args, "Spawning inference worker");
        Ok(command.spawn()?)
    }
}

struct Running {
    child: Child,
    stdout_task: JoinHandle<()>,
}

enum Exit {
    Status(ExitStatus),
    Cancelled,
}

pub(crate) struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
    events: mpsc::UnboundedSender<Event>,
    restart_rx: mpsc::UnboundedReceiver<u64>,
    cancel: CancellationToken,
    respawn_delay: Duration,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub(crate) fn new(
        spawner: Arc<dyn WorkerSpawner>,
        events: mpsc::UnboundedSender<Event>,
        restart_rx: mpsc::UnboundedReceiver<u64>,
        cancel: CancellationToken,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            spawner,
            events,
            restart_rx,
            cancel,
            respawn_delay: config.get_respawn_delay(),
            shutdown_grace: config.get_shutdown_grace(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut generation = 0;
        let mut spawn_failures = 0u32;

        while !self.cancel.is_cancelled() {
            generation += 1;
            match self.launch(generation) {
                Ok(running) => {
                    spawn_failures = 0;
                    match self.supervise(running, generation).await {
                        Exit::Cancelled => break,
                        Exit::Status(status) if status.success() => {
                            tracing::info!("Inference worker exited cleanly, not respawning");
                            break;
                        }
                        Exit::Status(status) => {
                            tracing::error!(
                                %status,
                                delay_ms = self.respawn_delay.as_millis() as u64,
                                "Inference worker crashed, respawning"
                            );
                        }
                    }
                }
                Err(e) => {
                    spawn_failures += 1;
                    tracing::error!(
                        error = %e,
                        attempt = spawn_failures,
                        "Failed to start inference worker"
                    );
                    let _ = self.events.send(Event::SpawnFailed(e.to_string()));
                }
            }

            tokio::select! {
                _ = sleep(self.respawn_delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        tracing::info!("Worker supervisor stopped");
    }

    fn launch(&self, generation: u64) -> Result<Running, SpawnError> {
        let mut child = self.spawner.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;

        let stdout_task = tokio::spawn(forward_stdout(stdout, self.events.clone(), generation));
        tokio::spawn(forward_stderr(stderr));

        let stdin: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
        let writer: CommandWriter = FramedWrite::new(stdin, LinesCodec::new());
        let _ = self.events.send(Event::Spawned { generation, writer });

        Ok(Running { child, stdout_task })
    }

    async fn supervise(&mut self, running: Running, generation: u64) -> Exit {
        let Running {
            mut child,
            stdout_task,
        } = running;

        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => break Exit::Status(status),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to wait for inference worker");
                            let _ = child.start_kill();
                        }
                    }
                }
                Some(requested) = self.restart_rx.recv() => {
                    if requested == generation {
                        tracing::warn!(generation, "Killing unresponsive inference worker");
                        let _ = child.start_kill();
                    }
                }
                _ = self.cancel.cancelled() => {
                    break match timeout(self.shutdown_grace, child.wait()).await {
                        Ok(_) => Exit::Cancelled,
                        Err(_) => {
                            tracing::warn!("Inference worker ignored shutdown, killing it");
                            let _ = child.kill().await;
                            Exit::Cancelled
                        }
                    };
                }
            }
        };

        // Lines already written by the worker must reach the dispatcher before its exit does.
        if timeout(READER_DRAIN_TIMEOUT, stdout_task).await.is_err() {
            tracing::debug!("Worker stdout still open after exit");
        }

        let code = match &exit {
            Exit::Status(status) => status.code(),
            Exit::Cancelled => None,
        };
        let _ = self.events.send(Event::Exited { generation, code });
        exit
    }
}

/// Splits worker output on newlines without assuming it is UTF-8.
fn worker_lines<R: AsyncRead>(reader: R) -> FramedRead<R, AnyDelimiterCodec> {
    FramedRead::new(
        reader,
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_LINE_LENGTH),
    )
}

async fn forward_stdout(stdout: ChildStdout, events: mpsc::UnboundedSender<Event>, generation: u64) {
    let mut lines = worker_lines(stdout);
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let event = parse_line(&String::from_utf8_lossy(&line));
                if events.send(Event::Line { generation, event }).is_err() {
                    break;
                }
            }
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::warn!(max = MAX_LINE_LENGTH, "Skipping oversized line from worker");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = worker_lines(stderr);
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let line = String::from_utf8_lossy(&line);
                tracing::info!(target: "yolo_worker::stderr", "{}", line.trim_end_matches('\r'));
            }
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::warn!(max = MAX_LINE_LENGTH, "Skipping oversized stderr line from worker");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Worker stderr closed");
                break;
            }
        }
    }
}
