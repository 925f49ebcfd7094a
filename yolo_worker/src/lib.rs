mod handle;
mod process;
mod queue;

pub mod config;
pub mod error;
pub mod fallback;
pub mod predictor;
pub mod protocol;
pub mod types;

pub use handle::{PendingResult, WorkerHandle};
pub use process::{CommandSpawner, WorkerSpawner};
