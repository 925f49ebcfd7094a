use crate::{
    error::PredictError,
    fallback::OneShotInvoker,
    handle::WorkerHandle,
    types::{PredictRequest, PredictionResult},
};
use async_trait::async_trait;

/// How a prediction gets executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Persistent,
    Fallback,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Persistent => "persistent",
            Strategy::Fallback => "fallback",
        }
    }
}

#[async_trait]
pub trait Predictor: Send + Sync + 'static {
    async fn predict(&self, request: PredictRequest) -> Result<PredictionResult, PredictError>;

    /// Whether a model is loaded and requests are being served, possibly after queueing.
    fn is_available(&self) -> bool;

    /// The strategy the next call to `predict` would use.
    fn strategy(&self) -> Strategy;

    /// Runs `request` and reports the strategy that actually served it.
    async fn dispatch(
        &self,
        request: PredictRequest,
    ) -> (Strategy, Result<PredictionResult, PredictError>) {
        (self.strategy(), self.predict(request).await)
    }
}

#[async_trait]
impl Predictor for WorkerHandle {
    async fn predict(&self, request: PredictRequest) -> Result<PredictionResult, PredictError> {
        WorkerHandle::predict(self, request).await
    }

    fn is_available(&self) -> bool {
        WorkerHandle::is_available(self)
    }

    fn strategy(&self) -> Strategy {
        Strategy::Persistent
    }
}

#[async_trait]
impl Predictor for OneShotInvoker {
    async fn predict(&self, request: PredictRequest) -> Result<PredictionResult, PredictError> {
        self.invoke(&request).await
    }

    fn is_available(&self) -> bool {
        false
    }

    fn strategy(&self) -> Strategy {
        Strategy::Fallback
    }
}

/// Routes to `primary` while it has a model loaded and to `fallback` otherwise.
pub struct FailoverPredictor<P, F> {
    primary: P,
    fallback: F,
}

impl<P: Predictor, F: Predictor> FailoverPredictor<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }
}

#[async_trait]
impl<P: Predictor, F: Predictor> Predictor for FailoverPredictor<P, F> {
    async fn predict(&self, request: PredictRequest) -> Result<PredictionResult, PredictError> {
        self.dispatch(request).await.1
    }

    fn is_available(&self) -> bool {
        self.primary.is_available()
    }

    fn strategy(&self) -> Strategy {
        if self.primary.is_available() {
            self.primary.strategy()
        } else {
            self.fallback.strategy()
        }
    }

    async fn dispatch(
        &self,
        request: PredictRequest,
    ) -> (Strategy, Result<PredictionResult, PredictError>) {
        if self.primary.is_available() {
            self.primary.dispatch(request).await
        } else {
            tracing::info!(image = %request.image_path, "Persistent worker unavailable, using one-shot inference");
            self.fallback.dispatch(request).await
        }
    }
}
