use crate::{
    config::WorkerConfig,
    error::PredictError,
    process::{CommandSpawner, Supervisor, WorkerSpawner},
    queue::{Dispatcher, Event},
    types::{Job, JobId, ModelSelector, PredictRequest, PredictionResult, WorkerState},
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Cloneable handle to one supervised inference worker and its request queue.
#[derive(Clone)]
pub struct WorkerHandle {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<WorkerState>,
    next_id: Arc<AtomicU64>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// A job waiting in the queue; resolves once the worker answers or the job times out.
#[derive(Debug)]
pub struct PendingResult {
    job_id: JobId,
    rx: oneshot::Receiver<Result<PredictionResult, PredictError>>,
}

impl PendingResult {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn wait(self) -> Result<PredictionResult, PredictError> {
        self.rx.await.map_err(|_| PredictError::ShuttingDown)?
    }
}

impl WorkerHandle {
    /// Spawns the worker process described by `config` and starts dispatching.
    pub fn start(config: &WorkerConfig) -> Self {
        Self::start_with_spawner(config, Arc::new(CommandSpawner::from_config(config)))
    }

    pub fn start_with_spawner(config: &WorkerConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            events_rx,
            state_tx,
            restart_tx,
            cancel.clone(),
            config.get_job_timeout(),
        );
        tokio::spawn(dispatcher.run());

        let supervisor = Supervisor::new(spawner, events_tx.clone(), restart_rx, cancel, config);
        let supervisor = tokio::spawn(supervisor.run());

        Self::from_parts(events_tx, state_rx, Some(supervisor))
    }

    pub(crate) fn from_parts(
        events: mpsc::UnboundedSender<Event>,
        state: watch::Receiver<WorkerState>,
        supervisor: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            events,
            state,
            next_id: Arc::new(AtomicU64::new(1)),
            supervisor: Arc::new(Mutex::new(supervisor)),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    /// The model is loaded and jobs are being served, possibly after a wait in the queue.
    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn enqueue(&self, request: PredictRequest) -> Result<PendingResult, PredictError> {
        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        self.events
            .send(Event::Submit {
                job: Job::new(job_id, request),
                reply,
            })
            .map_err(|_| PredictError::ShuttingDown)?;

        Ok(PendingResult { job_id, rx })
    }

    pub async fn predict(&self, request: PredictRequest) -> Result<PredictionResult, PredictError> {
        self.enqueue(request)?.wait().await
    }

    /// Asks the idle worker to load other weights; resolves once it reports ready again.
    pub async fn reload(&self, model: ModelSelector) -> Result<(), PredictError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Reload { model, reply })
            .map_err(|_| PredictError::ShuttingDown)?;
        rx.await.map_err(|_| PredictError::ShuttingDown)?
    }

    /// Rejects every pending job, asks the worker to exit and waits for the supervisor.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.events.send(Event::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }

        if let Some(supervisor) = self.supervisor.lock().await.take() {
            if let Err(e) = supervisor.await {
                tracing::error!("Worker supervisor task failed: {:?}", e);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const ECHO_WORKER: &str = r#"
echo "Loading YOLOv8 model..."
echo "READY:Model loaded successfully"
while IFS= read -r line; do
  case "$line" in
    *'"action":"shutdown"'*) echo "Shutting down inference server..."; exit 0 ;;
  esac
  img=$(printf '%s\n' "$line" | sed -n 's/.*"image_path":"\([^"]*\)".*/\1/p')
  echo "RESULT:{\"success\":true,\"input_image\":\"$img\",\"output_image\":\"/tmp/outputs/$(basename "$img")\",\"detections\":[],\"stats\":{}}"
done
"#;

    fn sh_worker(script: &str) -> WorkerConfig {
        let mut config = WorkerConfig::new("sh", vec!["-c".into(), script.into()]);
        config.respawn_delay_ms = 100;
        config.job_timeout_ms = 2_000;
        config.shutdown_grace_ms = 1_000;
        config
    }

    async fn wait_for(handle: &WorkerHandle, state: WorkerState) {
        let mut rx = handle.subscribe();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("worker never reached {:?}", state))
            .unwrap();
    }

    #[tokio::test]
    async fn test_persistent_worker_round_trip() {
        let handle = WorkerHandle::start(&sh_worker(ECHO_WORKER));
        wait_for(&handle, WorkerState::Ready).await;

        let first = handle
            .enqueue(PredictRequest::new(
                "/tmp/uploads/dog.jpg",
                ModelSelector::Default,
                "/tmp/outputs",
            ))
            .unwrap();
        let second = handle
            .enqueue(PredictRequest::new(
                "/tmp/uploads/cat.jpg",
                ModelSelector::Default,
                "/tmp/outputs",
            ))
            .unwrap();

        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        assert_eq!(first.input_image_url.as_deref(), Some("/uploads/dog.jpg"));
        assert_eq!(first.output_image_url.as_deref(), Some("/outputs/dog.jpg"));
        assert_eq!(second.input_image_url.as_deref(), Some("/uploads/cat.jpg"));

        handle.shutdown().await;
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_non_utf8_output_does_not_break_the_worker() {
        let script = format!(
            "printf 'Loading \\377 model\\n'\nprintf 'warning: \\377\\n' >&2\n{}",
            ECHO_WORKER
        );
        let handle = WorkerHandle::start(&sh_worker(&script));
        wait_for(&handle, WorkerState::Ready).await;

        let result = handle
            .predict(PredictRequest::new(
                "/tmp/uploads/bird.jpg",
                ModelSelector::Default,
                "/tmp/outputs",
            ))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output_image_url.as_deref(), Some("/outputs/bird.jpg"));
        assert_eq!(handle.state(), WorkerState::Ready);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_worker_is_respawned() {
        let handle = WorkerHandle::start(&sh_worker("echo READY:; read line; exit 3"));
        wait_for(&handle, WorkerState::Ready).await;

        let lost = handle
            .enqueue(PredictRequest::new("a.jpg", ModelSelector::Default, "/tmp"))
            .unwrap();
        wait_for(&handle, WorkerState::Crashed).await;
        wait_for(&handle, WorkerState::Ready).await;

        assert!(matches!(
            lost.wait().await.unwrap_err(),
            PredictError::Timeout(_)
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_program_leaves_worker_crashed() {
        let mut config = sh_worker("");
        config.program = "/nonexistent/inference-worker".into();
        let handle = WorkerHandle::start(&config);

        wait_for(&handle, WorkerState::Crashed).await;
        assert!(!handle.is_ready());
        assert!(!handle.is_available());
        handle.shutdown().await;
    }
}
