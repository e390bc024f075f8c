use std::{collections::BTreeMap, fmt, net::SocketAddr};

use tokio::time::Instant;

use crate::mr::{assembler::Partition, error::CoordinatorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    Map,
    Reduce,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Map => write!(f, "Map"),
            TaskKind::Reduce => write!(f, "Reduce"),
        }
    }
}

/// Map tasks are numbered by input split, reduce tasks by partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub kind: TaskKind,
    pub index: usize,
}

impl TaskId {
    pub fn map(index: usize) -> Self {
        Self { kind: TaskKind::Map, index }
    }

    pub fn reduce(index: usize) -> Self {
        Self { kind: TaskKind::Reduce, index }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task #{}", self.kind, self.index)
    }
}

#[derive(Debug, Clone)]
pub enum TaskInput {
    /// Path of the input split
    Split(String),
    /// Every record of one partition, grouped by key
    Partition(Partition),
}

/// What a completed task left behind.
/// Map records themselves live in the result assembler, the task only keeps the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Map { records: usize },
    Reduce(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Dispatched {
        worker: SocketAddr,
        deadline: Instant,
        /// Identifies this particular dispatch, a timeout only applies to the lease it was armed for
        lease: u32,
    },
    Completed(TaskResult),
}

impl TaskStatus {
    fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Dispatched { .. } => "Dispatched",
            TaskStatus::Completed(_) => "Completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub input: TaskInput,
    pub status: TaskStatus,
    /// Number of times this task has been handed to a worker
    pub attempts: u32,
    /// The worker that received the most recent dispatch
    pub last_worker: Option<SocketAddr>,
}

impl Task {
    fn new(id: TaskId, input: TaskInput) -> Self {
        Self {
            id,
            input,
            status: TaskStatus::Pending,
            attempts: 0,
            last_worker: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, TaskStatus::Completed(_))
    }
}

/// The authoritative state of every task of the job.
///
/// The registry is plain data, callers serialize access to it (the coordinator
/// keeps it behind its job lock).
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskRegistry {
    /// One pending map task per input split, in split order
    pub fn new(splits: &[String]) -> Self {
        let tasks = splits
            .iter()
            .enumerate()
            .map(|(index, split)| {
                let id = TaskId::map(index);
                (id, Task::new(id, TaskInput::Split(split.clone())))
            })
            .collect();
        Self { tasks }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut Task, CoordinatorError> {
        self.tasks.get_mut(&id).ok_or(CoordinatorError::UnknownTask(id))
    }

    fn of_kind(&self, kind: TaskKind) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |task| task.id.kind == kind)
    }

    /// Pending tasks of `kind`, lowest index first
    pub fn all_pending(&self, kind: TaskKind) -> Vec<TaskId> {
        self.of_kind(kind)
            .filter(|task| task.status == TaskStatus::Pending)
            .map(|task| task.id)
            .collect()
    }

    /// True when every task of `kind` is completed, vacuously true if there are none
    pub fn all_completed(&self, kind: TaskKind) -> bool {
        self.of_kind(kind).all(Task::is_completed)
    }

    pub fn count(&self, kind: TaskKind) -> usize {
        self.of_kind(kind).count()
    }

    pub fn completed_count(&self, kind: TaskKind) -> usize {
        self.of_kind(kind).filter(|task| task.is_completed()).count()
    }

    /// Pending -> Dispatched, returns the lease of the new dispatch
    pub fn mark_dispatched(
        &mut self,
        id: TaskId,
        worker: SocketAddr,
        deadline: Instant,
    ) -> Result<u32, CoordinatorError> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Pending {
            return Err(CoordinatorError::InvalidTransition {
                task: id,
                status: task.status.name(),
            });
        }
        task.attempts += 1;
        task.last_worker = Some(worker);
        task.status = TaskStatus::Dispatched {
            worker,
            deadline,
            lease: task.attempts,
        };
        Ok(task.attempts)
    }

    /// Record the result of `id`.
    ///
    /// Returns `false` without touching anything when the task is already
    /// completed, or when it went back to pending after a timeout and the
    /// response is therefore stale.
    pub fn mark_completed(&mut self, id: TaskId, result: TaskResult) -> Result<bool, CoordinatorError> {
        let task = self.get_mut(id)?;
        match task.status {
            TaskStatus::Dispatched { .. } => {
                task.status = TaskStatus::Completed(result);
                Ok(true)
            }
            TaskStatus::Pending | TaskStatus::Completed(_) => Ok(false),
        }
    }

    /// Dispatched -> Pending, only if the task is still held under `lease`
    pub fn mark_timed_out(&mut self, id: TaskId, lease: u32) -> Result<bool, CoordinatorError> {
        let task = self.get_mut(id)?;
        match task.status {
            TaskStatus::Dispatched { lease: current, .. } if current == lease => {
                task.status = TaskStatus::Pending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Create the reduce tasks, one per partition. Only valid once per job.
    pub fn materialize_reduce(&mut self, partitions: Vec<Partition>) -> Result<(), CoordinatorError> {
        if let Some(existing) = self.of_kind(TaskKind::Reduce).next() {
            return Err(CoordinatorError::InvalidTransition {
                task: existing.id,
                status: existing.status.name(),
            });
        }
        for (index, partition) in partitions.into_iter().enumerate() {
            let id = TaskId::reduce(index);
            self.tasks.insert(id, Task::new(id, TaskInput::Partition(partition)));
        }
        Ok(())
    }

    /// Unfinished tasks that have already been handed out more than `threshold` times
    pub fn stuck_tasks(&self, threshold: u32) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| !task.is_completed() && task.attempts > threshold)
            .map(|task| task.id)
            .collect()
    }
}
