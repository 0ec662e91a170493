use thiserror::Error;

use crate::TaskId;

/// Misuse of the dispatcher contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher has been shut down")]
    ShutDown,

    #[error("dispatcher is already shut down")]
    AlreadyShutdown,

    #[error("drain must be called from the thread that created the dispatcher")]
    NotMainThread,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// A work function panicked; delivered to the integration callback instead of a result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task {task} failed: {message}")]
pub struct WorkFailure {
    pub task: TaskId,
    pub message: String,
}

/// What an integration callback receives
pub type TaskOutcome<R> = std::result::Result<R, WorkFailure>;

pub type Result<T> = std::result::Result<T, DispatchError>;
