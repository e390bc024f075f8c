use std::net::SocketAddr;

use thiserror::Error;

use crate::mr::{rpc::TaskError, task::TaskId};

/// Errors raised inside the coordinator.
///
/// `InvalidTransition` means the scheduling bookkeeping itself is broken, the
/// coordinator stops as soon as it sees one.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid transition for {task}: task is {status}")]
    InvalidTransition { task: TaskId, status: &'static str },
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("the coordinator stopped before the job was done")]
    Aborted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a single dispatch did not produce a result.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport failure talking to {worker}: {message}")]
    Transport { worker: SocketAddr, message: String },
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl DispatchError {
    pub fn transport(worker: SocketAddr, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            worker,
            message: err.to_string(),
        }
    }
}
