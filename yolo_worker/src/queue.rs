//! Single-concurrency dispatcher in front of the worker process.
//!
//! One task owns the waiting jobs, the in-flight slot, the worker's stdin and
//! the published [`WorkerState`]. Everything else talks to it through [`Event`]s.

use crate::{
    error::PredictError,
    protocol::{WorkerCommand, WorkerEvent},
    types::{Job, JobId, ModelSelector, PredictionResult, WorkerState},
};
use futures::{SinkExt, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};
use tokio::{
    io::AsyncWrite,
    sync::{mpsc, oneshot, watch},
};
use tokio_util::{
    codec::{FramedWrite, LinesCodec},
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};

pub(crate) type CommandWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;
pub(crate) type Reply = oneshot::Sender<Result<PredictionResult, PredictError>>;

pub(crate) enum Event {
    Submit {
        job: Job,
        reply: Reply,
    },
    Reload {
        model: ModelSelector,
        reply: oneshot::Sender<Result<(), PredictError>>,
    },
    Spawned {
        generation: u64,
        writer: CommandWriter,
    },
    SpawnFailed(String),
    Line {
        generation: u64,
        event: WorkerEvent,
    },
    Exited {
        generation: u64,
        code: Option<i32>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct QueuedJob {
    job: Job,
    reply: Reply,
}

struct InFlight {
    job_id: JobId,
    /// `None` once the caller has been answered with a timeout.
    reply: Option<Reply>,
}

pub(crate) struct Dispatcher {
    events: mpsc::UnboundedReceiver<Event>,
    state_tx: watch::Sender<WorkerState>,
    restart_tx: mpsc::UnboundedSender<u64>,
    cancel: CancellationToken,
    job_timeout: Duration,
    state: WorkerState,
    generation: u64,
    writer: Option<CommandWriter>,
    queue: VecDeque<QueuedJob>,
    in_flight: Option<InFlight>,
    // Jobs that were on the worker when it died. They are not retried and
    // only their own timer answers them.
    orphaned: HashMap<JobId, Reply>,
    timers: DelayQueue<JobId>,
    timer_keys: HashMap<JobId, delay_queue::Key>,
    pending_reload: Option<oneshot::Sender<Result<(), PredictError>>>,
}

impl Dispatcher {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<Event>,
        state_tx: watch::Sender<WorkerState>,
        restart_tx: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
        job_timeout: Duration,
    ) -> Self {
        let state = *state_tx.borrow();
        Self {
            events,
            state_tx,
            restart_tx,
            cancel,
            job_timeout,
            state,
            generation: 0,
            writer: None,
            queue: VecDeque::new(),
            in_flight: None,
            orphaned: HashMap::new(),
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            pending_reload: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                Some(expired) = self.timers.next() => {
                    self.expire(expired.into_inner());
                }
            }
        }
        tracing::info!("Worker dispatcher stopped");
    }

    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Submit { job, reply } => {
                tracing::debug!(
                    job_id = job.id,
                    image = %job.image_path,
                    queued = self.queue.len(),
                    "Job enqueued"
                );
                let key = self.timers.insert(job.id, self.job_timeout);
                self.timer_keys.insert(job.id, key);
                self.queue.push_back(QueuedJob { job, reply });
                self.dispatch_next().await;
            }
            Event::Reload { model, reply } => self.reload(model, reply).await,
            Event::Spawned { generation, writer } => {
                tracing::info!(generation, "Worker process spawned, waiting for model load");
                self.generation = generation;
                self.writer = Some(writer);
                self.set_state(WorkerState::Starting);
            }
            Event::SpawnFailed(error) => {
                tracing::debug!(%error, "Worker unavailable after spawn failure");
                self.set_state(WorkerState::Crashed);
            }
            Event::Line { generation, event } => {
                if generation != self.generation {
                    tracing::debug!(generation, "Ignoring output from a previous worker");
                } else {
                    self.on_worker_event(event).await;
                }
            }
            Event::Exited { generation, code } => {
                if generation == self.generation {
                    self.on_exit(code);
                }
            }
            Event::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready(message) => {
                if self.state != WorkerState::Starting {
                    tracing::debug!(state = self.state.as_str(), "Ignoring unexpected READY");
                    return;
                }
                tracing::info!(%message, "Inference worker ready");
                if let Some(reply) = self.pending_reload.take() {
                    let _ = reply.send(Ok(()));
                }
                self.set_state(WorkerState::Ready);
                self.dispatch_next().await;
            }
            WorkerEvent::Result(result) => self.on_result(*result).await,
            WorkerEvent::MalformedResult { payload, error } => {
                tracing::warn!(%error, %payload, "Discarding malformed RESULT line");
                // The worker is done with the job even though its answer is
                // unusable; the caller is left to its timeout.
                if let Some(in_flight) = self.in_flight.take() {
                    if let Some(reply) = in_flight.reply {
                        self.orphaned.insert(in_flight.job_id, reply);
                    }
                    self.finish_in_flight().await;
                }
            }
            WorkerEvent::Error(message) => {
                tracing::warn!(%message, "Inference worker reported an error");
                if self.state == WorkerState::Starting && self.writer.is_some() {
                    if let Some(reply) = self.pending_reload.take() {
                        let _ = reply.send(Err(PredictError::Worker(message)));
                        self.set_state(WorkerState::Ready);
                        self.dispatch_next().await;
                    }
                }
            }
            WorkerEvent::Output(line) => {
                tracing::info!(target: "yolo_worker::stdout", "{}", line);
            }
        }
    }

    async fn on_result(&mut self, result: PredictionResult) {
        let Some(in_flight) = self.in_flight.take() else {
            tracing::warn!("Discarding RESULT with no job in flight");
            return;
        };

        if let Some(echoed) = result.job_id {
            if echoed != in_flight.job_id {
                tracing::warn!(
                    echoed,
                    expected = in_flight.job_id,
                    "Discarding RESULT for another job"
                );
                self.in_flight = Some(in_flight);
                return;
            }
        }

        self.cancel_timer(in_flight.job_id);
        match in_flight.reply {
            Some(reply) => {
                tracing::info!(
                    job_id = in_flight.job_id,
                    success = result.success,
                    detections = result.detections.len(),
                    "Job completed"
                );
                let _ = reply.send(Ok(result.with_urls()));
            }
            None => {
                tracing::debug!(job_id = in_flight.job_id, "Discarding result of expired job");
            }
        }
        self.finish_in_flight().await;
    }

    async fn finish_in_flight(&mut self) {
        // Without a writer the worker is being restarted and stays busy until it exits.
        if self.writer.is_some() && self.state == WorkerState::Busy {
            self.set_state(WorkerState::Ready);
            self.dispatch_next().await;
        }
    }

    fn on_exit(&mut self, code: Option<i32>) {
        self.writer = None;
        if let Some(in_flight) = self.in_flight.take() {
            if let Some(reply) = in_flight.reply {
                tracing::warn!(
                    job_id = in_flight.job_id,
                    "Worker exited while processing job, leaving it to time out"
                );
                self.orphaned.insert(in_flight.job_id, reply);
            }
        }
        if let Some(reply) = self.pending_reload.take() {
            let _ = reply.send(Err(PredictError::Worker(
                "worker exited during reload".to_string(),
            )));
        }
        let state = match code {
            Some(0) => WorkerState::Stopped,
            _ => WorkerState::Crashed,
        };
        self.set_state(state);
    }

    async fn dispatch_next(&mut self) {
        while self.state == WorkerState::Ready
            && self.in_flight.is_none()
            && self.writer.is_some()
        {
            let Some(queued) = self.queue.pop_front() else {
                return;
            };
            let job = &queued.job;
            let command = WorkerCommand::Predict {
                job_id: job.id,
                image_path: job.image_path.clone(),
                model_path: job.model_selector.clone(),
                output_dir: job.output_directory.clone(),
            };

            match self.send(&command).await {
                Ok(()) => {
                    tracing::debug!(
                        job_id = job.id,
                        waited_ms = (chrono::Utc::now() - job.submitted_at).num_milliseconds(),
                        "Job dispatched"
                    );
                    self.in_flight = Some(InFlight {
                        job_id: job.id,
                        reply: Some(queued.reply),
                    });
                    self.set_state(WorkerState::Busy);
                }
                Err(PredictError::Encode(e)) => {
                    self.cancel_timer(queued.job.id);
                    let _ = queued.reply.send(Err(PredictError::Encode(e)));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to write to worker stdin");
                    self.queue.push_front(queued);
                    self.writer = None;
                    self.set_state(WorkerState::Crashed);
                }
            }
        }
    }

    async fn reload(
        &mut self,
        model: ModelSelector,
        reply: oneshot::Sender<Result<(), PredictError>>,
    ) {
        match self.state {
            WorkerState::Ready if self.in_flight.is_none() => {}
            WorkerState::Busy | WorkerState::Ready => {
                let _ = reply.send(Err(PredictError::WorkerBusy));
                return;
            }
            _ => {
                let _ = reply.send(Err(PredictError::WorkerUnavailable));
                return;
            }
        }

        tracing::info!(%model, "Reloading worker model");
        match self.send(&WorkerCommand::Reload { model_path: model }).await {
            Ok(()) => {
                self.pending_reload = Some(reply);
                self.set_state(WorkerState::Starting);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn expire(&mut self, job_id: JobId) {
        self.timer_keys.remove(&job_id);
        let timeout = self.job_timeout;

        if let Some(position) = self.queue.iter().position(|q| q.job.id == job_id) {
            if let Some(queued) = self.queue.remove(position) {
                tracing::warn!(job_id, "Job timed out while queued");
                let _ = queued.reply.send(Err(PredictError::Timeout(timeout)));
            }
            return;
        }

        if let Some(reply) = self.orphaned.remove(&job_id) {
            tracing::warn!(job_id, "Job timed out after losing its worker");
            let _ = reply.send(Err(PredictError::Timeout(timeout)));
            return;
        }

        let timed_out = match self.in_flight.as_mut() {
            Some(in_flight) if in_flight.job_id == job_id => in_flight.reply.take(),
            _ => None,
        };
        if let Some(reply) = timed_out {
            tracing::warn!(job_id, "Job timed out on the worker, restarting it");
            let _ = reply.send(Err(PredictError::Timeout(timeout)));
            // Stop feeding the hung process; its late answer, if any, is discarded.
            self.writer = None;
            let _ = self.restart_tx.send(self.generation);
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!(
            queued = self.queue.len(),
            "Shutting down inference worker"
        );
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(PredictError::ShuttingDown));
        }
        if let Some(reply) = self.in_flight.take().and_then(|f| f.reply) {
            let _ = reply.send(Err(PredictError::ShuttingDown));
        }
        for (_, reply) in self.orphaned.drain() {
            let _ = reply.send(Err(PredictError::ShuttingDown));
        }
        if let Some(reply) = self.pending_reload.take() {
            let _ = reply.send(Err(PredictError::ShuttingDown));
        }
        self.timers.clear();
        self.timer_keys.clear();

        if self.writer.is_some() {
            if let Err(e) = self.send(&WorkerCommand::Shutdown).await {
                tracing::debug!(error = %e, "Could not send shutdown to worker");
            }
        }
        // Dropping stdin lets a worker that ignored the command see EOF.
        self.writer = None;
        self.cancel.cancel();
        self.set_state(WorkerState::Stopped);
    }

    async fn send(&mut self, command: &WorkerCommand) -> Result<(), PredictError> {
        let line = command.encode()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or(PredictError::WorkerUnavailable)?;
        writer
            .send(line)
            .await
            .map_err(|e| PredictError::Channel(e.to_string()))
    }

    fn cancel_timer(&mut self, job_id: JobId) {
        if let Some(key) = self.timer_keys.remove(&job_id) {
            self.timers.remove(&key);
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            tracing::debug!(from = self.state.as_str(), to = state.as_str(), "Worker state");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }
}
