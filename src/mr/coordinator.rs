use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
};

use tokio::{
    sync::{watch, Mutex, Notify},
    task::JoinError,
    time::{Instant, MissedTickBehavior},
};

use crate::mr::{
    assembler::{flatten, ResultAssembler},
    config::CoordinatorConfig,
    error::{CoordinatorError, DispatchError},
    job::Job,
    liveness::LivenessMonitor,
    rpc::KeyValue,
    task::{Task, TaskId, TaskInput, TaskKind, TaskRegistry, TaskResult},
    transport::WorkerTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Mapping,
    Reducing,
    Done,
}

impl Phase {
    /// The kind of task dispatched in this phase, `None` once the job is done
    pub fn task_kind(self) -> Option<TaskKind> {
        match self {
            Phase::Mapping => Some(TaskKind::Map),
            Phase::Reducing => Some(TaskKind::Reduce),
            Phase::Done => None,
        }
    }
}

/// One call to be made against a worker
#[derive(Debug, Clone)]
enum TaskRequest {
    Map { file_path: String, map_function: String },
    Reduce { intermediate_results: Vec<KeyValue>, reduce_function: String },
}

impl TaskRequest {
    async fn send<T: WorkerTransport>(self, transport: &T, worker: SocketAddr) -> Result<TaskOutput, DispatchError> {
        match self {
            TaskRequest::Map { file_path, map_function } => transport
                .map(worker, file_path, map_function)
                .await
                .map(TaskOutput::Map),
            TaskRequest::Reduce { intermediate_results, reduce_function } => transport
                .reduce(worker, intermediate_results, reduce_function)
                .await
                .map(TaskOutput::Reduce),
        }
    }
}

#[derive(Debug)]
enum TaskOutput {
    Map(Vec<KeyValue>),
    Reduce(String),
}

/// Everything guarded by the job lock
struct JobState {
    registry: TaskRegistry,
    assembler: ResultAssembler,
    phase: Phase,
    /// Workers with an outstanding call and the task they were given
    in_flight: HashMap<SocketAddr, TaskId>,
    /// Tasks whose last dispatch failed outright are held back until then
    retry_after: HashMap<TaskId, Instant>,
    /// First unrecoverable error seen by a background dispatch
    fatal: Option<CoordinatorError>,
}

impl JobState {
    fn release(&mut self, worker: SocketAddr, id: TaskId) {
        if self.in_flight.get(&worker) == Some(&id) {
            self.in_flight.remove(&worker);
        }
    }

    /// Move to the next phase if the current one is finished, returns the new phase
    fn advance(&mut self, reduce_n: usize) -> Result<Option<Phase>, CoordinatorError> {
        match self.phase {
            Phase::Mapping if self.registry.all_completed(TaskKind::Map) => {
                let partitions = self.assembler.partition_for_reduce(reduce_n);
                self.registry.materialize_reduce(partitions)?;
                self.phase = Phase::Reducing;
                tracing::info!("[Map] All map tasks have been finished, the reduce phase will then begin!");
                Ok(Some(Phase::Reducing))
            }
            Phase::Reducing if self.registry.all_completed(TaskKind::Reduce) => {
                self.phase = Phase::Done;
                tracing::info!("[Reduce] All reduce tasks have been finished, MapReduce has finished!");
                Ok(Some(Phase::Done))
            }
            _ => Ok(None),
        }
    }
}

/// Schedules the tasks of one job over a static set of workers.
///
/// All bookkeeping happens under a single lock, calls to workers never do.
pub struct Coordinator<T> {
    job: Job,
    config: CoordinatorConfig,
    state: Mutex<JobState>,
    liveness: Arc<LivenessMonitor<T>>,
    transport: Arc<T>,
    /// Wakes the scheduling loop after a completion or a timeout
    wake: Notify,
    phase_tx: watch::Sender<Phase>,
}

impl<T: WorkerTransport> Coordinator<T> {
    pub fn new(
        job: Job,
        workers: Vec<SocketAddr>,
        transport: Arc<T>,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>, CoordinatorError> {
        if job.reduce_n == 0 {
            return Err(CoordinatorError::InvalidJob(
                "the number of reduce tasks must be positive".to_string(),
            ));
        }

        let mut state = JobState {
            registry: TaskRegistry::new(&job.splits),
            assembler: ResultAssembler::new(),
            phase: Phase::Mapping,
            in_flight: HashMap::new(),
            retry_after: HashMap::new(),
            fatal: None,
        };
        // A job without input has nothing to map
        state.advance(job.reduce_n)?;

        tracing::info!(
            "[Coordinator Configuration] #{} Map Tasks | #{} Reduce Tasks | #{} Workers",
            job.splits.len(),
            job.reduce_n,
            workers.len()
        );

        let liveness = Arc::new(LivenessMonitor::new(
            workers,
            Arc::clone(&transport),
            config.probe_interval,
            config.probe_timeout,
        ));
        let (phase_tx, _) = watch::channel(state.phase);

        Ok(Arc::new(Self {
            job,
            config,
            state: Mutex::new(state),
            liveness,
            transport,
            wake: Notify::new(),
            phase_tx,
        }))
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor<T>> {
        &self.liveness
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Observe phase changes
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.registry.get(id).cloned()
    }

    /// Tasks dispatched more often than the retry warning threshold
    pub async fn stuck_tasks(&self) -> Vec<TaskId> {
        let state = self.state.lock().await;
        state.registry.stuck_tasks(self.config.retry_warning_threshold)
    }

    /// Partition -> reduce output, only available once the job is done
    pub async fn final_results(&self) -> Option<BTreeMap<usize, String>> {
        let state = self.state.lock().await;
        if state.phase != Phase::Done {
            return None;
        }
        state.assembler.final_results().cloned()
    }

    /// Hand the lowest pending task of `kind` to a free, alive worker.
    ///
    /// Returns `Ok(None)` without waiting when `kind` is not the current phase,
    /// when nothing is ready to go or when no alive worker is free. A task whose
    /// last dispatch failed outright waits one schedule interval before it is ready.
    pub async fn dispatch_next(self: &Arc<Self>, kind: TaskKind) -> Result<Option<TaskId>, CoordinatorError> {
        let alive = self.liveness.alive_endpoints();

        let (id, worker, lease, request) = {
            let mut state = self.state.lock().await;
            if state.phase.task_kind() != Some(kind) {
                return Ok(None);
            }
            let now = Instant::now();
            let Some(id) = state
                .registry
                .all_pending(kind)
                .into_iter()
                .find(|id| state.retry_after.get(id).map_or(true, |at| *at <= now))
            else {
                return Ok(None);
            };
            let Some(task) = state.registry.get(id) else {
                return Err(CoordinatorError::UnknownTask(id));
            };

            // Prefer someone other than the worker that just let this task down
            let free = alive
                .iter()
                .copied()
                .filter(|w| !state.in_flight.contains_key(w))
                .collect::<Vec<_>>();
            let Some(worker) = free
                .iter()
                .copied()
                .find(|w| Some(*w) != task.last_worker)
                .or_else(|| free.first().copied())
            else {
                return Ok(None);
            };

            let request = match &task.input {
                TaskInput::Split(path) => TaskRequest::Map {
                    file_path: path.clone(),
                    map_function: self.job.map_function.clone(),
                },
                TaskInput::Partition(partition) => TaskRequest::Reduce {
                    intermediate_results: flatten(partition),
                    reduce_function: self.job.reduce_function.clone(),
                },
            };
            let deadline = Instant::now() + self.config.dispatch_timeout;
            let lease = state.registry.mark_dispatched(id, worker, deadline)?;
            state.in_flight.insert(worker, id);
            state.retry_after.remove(&id);
            (id, worker, lease, request)
        };

        tracing::debug!("[{}] Assigned {} to worker {} (attempt {})", kind, id, worker, lease);
        tokio::spawn(Arc::clone(self).drive(id, worker, lease, request));
        Ok(Some(id))
    }

    /// Await one dispatch under its deadline
    async fn drive(self: Arc<Self>, id: TaskId, worker: SocketAddr, lease: u32, request: TaskRequest) {
        let transport = Arc::clone(&self.transport);
        let mut call = tokio::spawn(async move { request.send(transport.as_ref(), worker).await });

        match tokio::time::timeout(self.config.dispatch_timeout, &mut call).await {
            Ok(joined) => {
                let outcome = joined_outcome(worker, joined);
                self.settle(id, worker, lease, outcome).await;
            }
            Err(_) => {
                self.expire(id, worker, lease).await;
                // The call is not cancelled, a late answer is still offered to the registry
                if let Ok(Ok(output)) = call.await {
                    self.accept_late(id, worker, output).await;
                }
            }
        }
    }

    /// A response arrived before the deadline
    async fn settle(&self, id: TaskId, worker: SocketAddr, lease: u32, outcome: Result<TaskOutput, DispatchError>) {
        let mut state = self.state.lock().await;
        state.release(worker, id);
        match outcome {
            Ok(output) => {
                let result = self.complete(&mut state, id, worker, output);
                self.keep_fatal(&mut state, result);
                drop(state);
                self.wake.notify_one();
            }
            Err(e) => {
                tracing::warn!("[{}] {} failed on worker {}: {}", id.kind, id, worker, e);
                // Held back until the next scheduling tick
                match self.requeue(&mut state, id, lease) {
                    Ok(true) => {
                        let at = Instant::now() + self.config.schedule_interval;
                        state.retry_after.insert(id, at);
                    }
                    Ok(false) => {}
                    Err(e) => self.keep_fatal(&mut state, Err(e)),
                }
            }
        }
    }

    async fn expire(&self, id: TaskId, worker: SocketAddr, lease: u32) {
        let mut state = self.state.lock().await;
        state.release(worker, id);
        tracing::warn!(
            "[{}] {} did not come back from worker {} within {:?}",
            id.kind,
            id,
            worker,
            self.config.dispatch_timeout
        );
        let result = self.requeue(&mut state, id, lease).map(|_| ());
        self.keep_fatal(&mut state, result);
        drop(state);
        self.wake.notify_one();
    }

    async fn accept_late(&self, id: TaskId, worker: SocketAddr, output: TaskOutput) {
        let mut state = self.state.lock().await;
        let result = self.complete(&mut state, id, worker, output);
        self.keep_fatal(&mut state, result);
        drop(state);
        self.wake.notify_one();
    }

    fn keep_fatal(&self, state: &mut JobState, result: Result<(), CoordinatorError>) {
        if let Err(e) = result {
            tracing::error!("Scheduling state is inconsistent: {}", e);
            state.fatal.get_or_insert(e);
        }
    }

    fn complete(
        &self,
        state: &mut JobState,
        id: TaskId,
        worker: SocketAddr,
        output: TaskOutput,
    ) -> Result<(), CoordinatorError> {
        let result = match &output {
            TaskOutput::Map(records) => TaskResult::Map { records: records.len() },
            TaskOutput::Reduce(value) => TaskResult::Reduce(value.clone()),
        };
        if !state.registry.mark_completed(id, result)? {
            tracing::debug!("[{}] Discarding stale response for {} from worker {}", id.kind, id, worker);
            return Ok(());
        }

        tracing::info!(
            "[{}] {} has been finished by worker {} ({}/{})",
            id.kind,
            id,
            worker,
            state.registry.completed_count(id.kind),
            state.registry.count(id.kind)
        );
        match output {
            TaskOutput::Map(records) => state.assembler.on_map_completed(id.index, records),
            TaskOutput::Reduce(value) => state.assembler.on_reduce_completed(id.index, value),
        }
        if let Some(phase) = state.advance(self.job.reduce_n)? {
            self.phase_tx.send_replace(phase);
        }
        Ok(())
    }

    /// Back to Pending if `lease` is still the current dispatch, returns whether it was
    fn requeue(&self, state: &mut JobState, id: TaskId, lease: u32) -> Result<bool, CoordinatorError> {
        if !state.registry.mark_timed_out(id, lease)? {
            return Ok(false);
        }
        let attempts = state.registry.get(id).map_or(0, |task| task.attempts);
        if attempts > self.config.retry_warning_threshold {
            tracing::warn!(
                "[{}] {} has failed {} times and is still pending, the job may be stuck",
                id.kind,
                id,
                attempts
            );
        } else {
            tracing::debug!("[{}] {} is pending again", id.kind, id);
        }
        Ok(true)
    }

    /// Drive the job to completion and return the final results.
    ///
    /// Runs the liveness probes alongside. Only an inconsistency in the
    /// scheduling state ends the job early, unreachable workers merely stall it.
    pub async fn run(self: &Arc<Self>) -> Result<BTreeMap<usize, String>, CoordinatorError> {
        self.liveness.probe_all().await;
        let probes = tokio::spawn(Arc::clone(&self.liveness).run());
        let result = self.schedule().await;
        probes.abort();
        result
    }

    async fn schedule(self: &Arc<Self>) -> Result<BTreeMap<usize, String>, CoordinatorError> {
        let mut ticker = tokio::time::interval(self.config.schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let kind = {
                let mut state = self.state.lock().await;
                if let Some(e) = state.fatal.take() {
                    return Err(e);
                }
                match state.phase.task_kind() {
                    Some(kind) => kind,
                    None => break,
                }
            };

            while self.dispatch_next(kind).await?.is_some() {}

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
        }

        self.final_results().await.ok_or(CoordinatorError::Aborted)
    }
}

fn joined_outcome(
    worker: SocketAddr,
    joined: Result<Result<TaskOutput, DispatchError>, JoinError>,
) -> Result<TaskOutput, DispatchError> {
    joined.unwrap_or_else(|e| Err(DispatchError::transport(worker, e)))
}
