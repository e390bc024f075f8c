//! Scriptable in-memory workers for exercising the coordinator without sockets.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::mr::{
    error::DispatchError,
    function::FunctionRegistry,
    rpc::{KeyValue, TaskError},
    task::TaskKind,
    transport::WorkerTransport,
    worker::{call_map_func, reduce_partition},
};

pub fn addr(n: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10_000 + n))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answers everything right away
    Healthy,
    /// Answers everything after a delay
    Slow(Duration),
    /// Answers pings, never answers a task
    Hang,
    /// Answers nothing at all
    Silent,
    /// Refuses connections
    Unreachable,
    /// Answers pings, every task fails on the worker side
    Failing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started { worker: SocketAddr, kind: TaskKind },
    Finished { worker: SocketAddr, kind: TaskKind, input: String },
}

pub struct FakeCluster {
    behaviors: Mutex<HashMap<SocketAddr, Behavior>>,
    /// Contents served for each split name
    splits: Mutex<HashMap<String, String>>,
    events: Mutex<Vec<Event>>,
    pings: Mutex<HashMap<SocketAddr, usize>>,
    registry: FunctionRegistry,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            splits: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            pings: Mutex::new(HashMap::new()),
            registry: FunctionRegistry::with_builtins(),
        })
    }

    pub fn set(&self, worker: SocketAddr, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(worker, behavior);
    }

    pub fn add_split(&self, name: &str, contents: &str) {
        self.splits.lock().unwrap().insert(name.to_string(), contents.to_string());
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn pings(&self, worker: SocketAddr) -> usize {
        self.pings.lock().unwrap().get(&worker).copied().unwrap_or(0)
    }

    /// Workers that were handed a task of `kind`, in order
    pub fn started(&self, kind: TaskKind) -> Vec<SocketAddr> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Started { worker, kind: k } if k == kind => Some(worker),
                _ => None,
            })
            .collect()
    }

    fn behavior(&self, worker: SocketAddr) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(&worker)
            .copied()
            .unwrap_or(Behavior::Unreachable)
    }

    /// Shared prologue of map and reduce: applies the scripted behaviour
    async fn begin(&self, worker: SocketAddr, kind: TaskKind) -> Result<(), DispatchError> {
        match self.behavior(worker) {
            Behavior::Unreachable => return Err(DispatchError::transport(worker, "connection refused")),
            Behavior::Hang | Behavior::Silent => {
                self.events.lock().unwrap().push(Event::Started { worker, kind });
                std::future::pending::<()>().await;
            }
            Behavior::Slow(delay) => {
                self.events.lock().unwrap().push(Event::Started { worker, kind });
                tokio::time::sleep(delay).await;
            }
            Behavior::Healthy | Behavior::Failing => {
                self.events.lock().unwrap().push(Event::Started { worker, kind });
            }
        }
        if self.behavior(worker) == Behavior::Failing {
            return Err(TaskError::UnknownFunction("scripted failure".to_string()).into());
        }
        Ok(())
    }

    fn finish(&self, worker: SocketAddr, kind: TaskKind, input: String) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Finished { worker, kind, input });
    }
}

#[async_trait]
impl WorkerTransport for FakeCluster {
    async fn map(
        &self,
        worker: SocketAddr,
        file_path: String,
        map_function: String,
    ) -> Result<Vec<KeyValue>, DispatchError> {
        self.begin(worker, TaskKind::Map).await?;
        let map_func = self.registry.resolve_map(&map_function)?;
        let contents = self
            .splits
            .lock()
            .unwrap()
            .get(&file_path)
            .cloned()
            .ok_or_else(|| TaskError::Input {
                path: file_path.clone(),
                message: "no such split".to_string(),
            })?;
        let records = call_map_func(map_func.as_ref(), &contents);
        self.finish(worker, TaskKind::Map, file_path);
        Ok(records)
    }

    async fn reduce(
        &self,
        worker: SocketAddr,
        intermediate_results: Vec<KeyValue>,
        reduce_function: String,
    ) -> Result<String, DispatchError> {
        self.begin(worker, TaskKind::Reduce).await?;
        let reduce_func = self.registry.resolve_reduce(&reduce_function)?;
        let output = reduce_partition(reduce_func.as_ref(), &intermediate_results);
        self.finish(worker, TaskKind::Reduce, output.clone());
        Ok(output)
    }

    async fn ping(&self, worker: SocketAddr) -> Result<String, DispatchError> {
        *self.pings.lock().unwrap().entry(worker).or_insert(0) += 1;
        match self.behavior(worker) {
            Behavior::Unreachable => Err(DispatchError::transport(worker, "connection refused")),
            Behavior::Silent => std::future::pending().await,
            _ => Ok("OK".to_string()),
        }
    }
}
