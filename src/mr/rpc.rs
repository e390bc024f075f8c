//! Types shared by the coordinator and the workers, plus the worker RPC service itself.

use serde::{Deserialize, Serialize};

/// One intermediate record produced by a map function
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Failures a worker reports back inside a successful RPC exchange.
/// The coordinator treats them exactly like a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TaskError {
    #[error("no function registered under the name `{0}`")]
    UnknownFunction(String),
    #[error("cannot read input split {path}: {message}")]
    Input { path: String, message: String },
}

/// RPC service exposed by every worker process, the coordinator is the only caller
#[tarpc::service]
pub trait WorkerService {
    /// Run the named map function over the input split at `file_path`
    async fn map(file_path: String, map_function: String) -> Result<Vec<KeyValue>, TaskError>;
    /// Run the named reduce function over one partition, the records arrive ordered by key
    async fn reduce(intermediate_results: Vec<KeyValue>, reduce_function: String) -> Result<String, TaskError>;
    /// Liveness probe
    async fn ping() -> String;
}
