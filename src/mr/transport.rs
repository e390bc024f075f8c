//! How the coordinator reaches a worker endpoint.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tarpc::{client, context, tokio_serde::formats::Json};

use crate::mr::{
    error::DispatchError,
    rpc::{KeyValue, WorkerServiceClient},
};

/// The three calls the coordinator makes against a worker
#[async_trait]
pub trait WorkerTransport: Send + Sync + 'static {
    async fn map(
        &self,
        worker: SocketAddr,
        file_path: String,
        map_function: String,
    ) -> Result<Vec<KeyValue>, DispatchError>;

    async fn reduce(
        &self,
        worker: SocketAddr,
        intermediate_results: Vec<KeyValue>,
        reduce_function: String,
    ) -> Result<String, DispatchError>;

    async fn ping(&self, worker: SocketAddr) -> Result<String, DispatchError>;
}

/// tarpc over TCP with JSON framing, one cached client per endpoint.
///
/// A client that fails a call is dropped from the cache so the next call reconnects.
pub struct TarpcTransport {
    clients: DashMap<SocketAddr, WorkerServiceClient>,
    /// RPC deadline, callers apply their own (shorter) timeouts on top
    call_deadline: Duration,
}

impl TarpcTransport {
    pub fn new(call_deadline: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            call_deadline,
        }
    }

    async fn client(&self, worker: SocketAddr) -> Result<WorkerServiceClient, DispatchError> {
        if let Some(client) = self.clients.get(&worker) {
            return Ok(client.clone());
        }

        let mut transport = tarpc::serde_transport::tcp::connect(worker, Json::default);
        transport.config_mut().max_frame_length(usize::MAX);
        let transport = transport
            .await
            .map_err(|e| DispatchError::transport(worker, e))?;
        let client = WorkerServiceClient::new(client::Config::default(), transport).spawn();
        tracing::debug!("Connected to worker {}", worker);

        self.clients.insert(worker, client.clone());
        Ok(client)
    }

    fn context(&self) -> context::Context {
        let mut ctx = context::current();
        // `current()` carries a 10 second default, stretch it so slow tasks are bounded by the caller
        ctx.deadline += self.call_deadline;
        ctx
    }

    fn forget(&self, worker: SocketAddr) {
        self.clients.remove(&worker);
    }
}

impl Default for TarpcTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl WorkerTransport for TarpcTransport {
    async fn map(
        &self,
        worker: SocketAddr,
        file_path: String,
        map_function: String,
    ) -> Result<Vec<KeyValue>, DispatchError> {
        let client = self.client(worker).await?;
        match client.map(self.context(), file_path, map_function).await {
            Ok(reply) => Ok(reply?),
            Err(e) => {
                self.forget(worker);
                Err(DispatchError::transport(worker, e))
            }
        }
    }

    async fn reduce(
        &self,
        worker: SocketAddr,
        intermediate_results: Vec<KeyValue>,
        reduce_function: String,
    ) -> Result<String, DispatchError> {
        let client = self.client(worker).await?;
        match client
            .reduce(self.context(), intermediate_results, reduce_function)
            .await
        {
            Ok(reply) => Ok(reply?),
            Err(e) => {
                self.forget(worker);
                Err(DispatchError::transport(worker, e))
            }
        }
    }

    async fn ping(&self, worker: SocketAddr) -> Result<String, DispatchError> {
        let client = self.client(worker).await?;
        client.ping(context::current()).await.map_err(|e| {
            self.forget(worker);
            DispatchError::transport(worker, e)
        })
    }
}
