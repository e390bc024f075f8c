use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use futures::{future, StreamExt};
use tarpc::{
    context,
    server::{incoming::Incoming, BaseChannel},
    tokio_serde::formats::Json,
};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::mr::{
    function::{FunctionRegistry, MapFunction, ReduceFunction},
    rpc::{KeyValue, TaskError, WorkerService},
};

/// The worker side of the RPC service.
///
/// A worker keeps nothing between calls. Requests are served one at a time,
/// a call that arrives while another task runs waits for its turn.
#[derive(Clone)]
pub struct Worker {
    registry: Arc<FunctionRegistry>,
    /// Held for the whole execution of a task
    slot: Arc<Mutex<()>>,
}

impl Worker {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            slot: Arc::new(Mutex::new(())),
        }
    }

    async fn read_split(file_path: &str) -> Result<String, TaskError> {
        tokio::fs::read_to_string(file_path)
            .await
            .map_err(|e| TaskError::Input {
                path: file_path.to_string(),
                message: e.to_string(),
            })
    }

    /// Execute one map task
    pub async fn run_map(&self, file_path: &str, map_function: &str) -> Result<Vec<KeyValue>, TaskError> {
        let _slot = self.slot.lock().await;
        let map_func = self.registry.resolve_map(map_function)?;
        tracing::info!("[Map] Worker is reading input split {}", file_path);
        let contents = Self::read_split(file_path).await?;
        let key_value_pairs = call_map_func(map_func.as_ref(), &contents);
        tracing::info!(
            "[Map] Worker finished mapping {}, {} intermediate records produced",
            file_path,
            key_value_pairs.len()
        );
        Ok(key_value_pairs)
    }

    /// Execute one reduce task
    pub async fn run_reduce(
        &self,
        intermediate_results: Vec<KeyValue>,
        reduce_function: &str,
    ) -> Result<String, TaskError> {
        let _slot = self.slot.lock().await;
        let reduce_func = self.registry.resolve_reduce(reduce_function)?;
        let records = intermediate_results.len();
        let output = reduce_partition(reduce_func.as_ref(), &intermediate_results);
        tracing::info!("[Reduce] Worker finished reducing {} intermediate records", records);
        Ok(output)
    }
}

/// Calls the user-defined map function
pub fn call_map_func(map_func: &dyn MapFunction, contents: &str) -> Vec<KeyValue> {
    map_func.map(contents)
}

/// Calls the user-defined reduce function once per key and renders the partition
/// as `key=value` entries joined by `,`, in key order
pub fn reduce_partition(reduce_func: &dyn ReduceFunction, records: &[KeyValue]) -> String {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for kv in records {
        grouped.entry(kv.key.as_str()).or_default().push(kv.value.as_str());
    }

    grouped
        .into_iter()
        .map(|(key, values)| format!("{}={}", key, reduce_func.reduce(key, values)))
        .collect::<Vec<_>>()
        .join(",")
}

#[tarpc::server]
impl WorkerService for Worker {
    async fn map(
        self,
        _: context::Context,
        file_path: String,
        map_function: String,
    ) -> Result<Vec<KeyValue>, TaskError> {
        let result = self.run_map(&file_path, &map_function).await;
        if let Err(e) = &result {
            tracing::warn!("[Map] Task over {} failed: {}", file_path, e);
        }
        result
    }

    async fn reduce(
        self,
        _: context::Context,
        intermediate_results: Vec<KeyValue>,
        reduce_function: String,
    ) -> Result<String, TaskError> {
        let result = self.run_reduce(intermediate_results, &reduce_function).await;
        if let Err(e) = &result {
            tracing::warn!("[Reduce] Task failed: {}", e);
        }
        result
    }

    async fn ping(self, _: context::Context) -> String {
        "OK".to_string()
    }
}

/// Bind `addr` and serve `worker` in the background.
/// Returns the bound address, useful when `addr` asks for an ephemeral port.
pub async fn serve(addr: SocketAddr, worker: Worker) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let mut listener = tarpc::serde_transport::tcp::listen(addr, Json::default).await?;
    listener.config_mut().max_frame_length(usize::MAX);
    let local_addr = listener.local_addr();

    let handle = tokio::spawn(
        listener
            // Accepts if this is a valid connection, otherwise ignores this connection
            .filter_map(|r| future::ready(r.ok()))
            .map(BaseChannel::with_defaults)
            .execute(worker.serve()),
    );

    tracing::info!("Worker RPC server listening on {}", local_addr);
    Ok((local_addr, handle))
}
