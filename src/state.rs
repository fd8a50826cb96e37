//! Engine State
//!
//! The single shared state every loop works through:
//! - agent registry (atomic per-agent load)
//! - active-task index
//! - pending queue (priority desc, FIFO within a band)
//! - execution table
//!
//! Locks are synchronous and never held across an `.await`. When both are
//! needed the execution table is locked before the task index.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::error::{EngineError, EngineResult};
use crate::executor::{Execution, ExecutionOutcome, ExecutionStatus};
use crate::registry::AgentRegistry;
use crate::task::{Priority, Task, TaskId};

/// Entry of the pending queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: Priority,
    /// Enqueue order, strictly increasing
    pub seq: u64,
}

/// Shared engine state, owned by the coordinator and handed to each component
pub struct EngineState {
    registry: AgentRegistry,
    tasks: RwLock<HashMap<TaskId, Task>>,
    queue: Mutex<Vec<QueuedTask>>,
    queue_seq: AtomicU64,
    executions: Mutex<HashMap<String, Execution>>,
}

impl EngineState {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry,
            tasks: RwLock::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            queue_seq: AtomicU64::new(0),
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    // ---- tasks ----

    pub fn insert_task(&self, task: Task) {
        self.tasks.write().insert(task.id.clone(), task);
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Mutate a task in place
    pub fn update_task<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        f(task)
    }

    pub fn tasks_where(&self, predicate: impl Fn(&Task) -> bool) -> Vec<Task> {
        self.tasks
            .read()
            .values()
            .filter(|t| predicate(t))
            .cloned()
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Drop terminal tasks that ended more than `retention` ago and satisfy
    /// `can_purge`. Returns the purged ids.
    pub fn purge_terminal_tasks(
        &self,
        retention: Duration,
        can_purge: impl Fn(&str) -> bool,
    ) -> Vec<TaskId> {
        let now = chrono::Utc::now();
        let retention_ms = retention.as_millis() as i64;
        let mut tasks = self.tasks.write();
        let expired: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.is_terminal())
            .filter(|t| {
                t.end_time
                    .map(|end| (now - end).num_milliseconds() > retention_ms)
                    .unwrap_or(false)
            })
            .filter(|t| can_purge(&t.id))
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            tasks.remove(id);
        }
        expired
    }

    // ---- pending queue ----

    pub fn enqueue(&self, task_id: &str, priority: Priority) {
        let seq = self.queue_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(QueuedTask {
            task_id: task_id.to_string(),
            priority,
            seq,
        });
    }

    /// Queue in dispatch order: priority descending, then enqueue order
    pub fn queue_snapshot(&self) -> Vec<QueuedTask> {
        let mut entries = self.queue.lock().clone();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        entries
    }

    /// Remove a task from the queue. Returns false if it was not queued.
    pub fn dequeue(&self, task_id: &str) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|q| q.task_id != task_id);
        queue.len() != before
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    // ---- executions ----

    pub fn insert_execution(&self, execution: Execution) {
        self.executions
            .lock()
            .insert(execution.id.clone(), execution);
    }

    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions.lock().get(execution_id).cloned()
    }

    pub fn executions_for_task(&self, task_id: &str) -> Vec<Execution> {
        self.executions
            .lock()
            .values()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn running_executions(&self) -> Vec<Execution> {
        self.executions
            .lock()
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .cloned()
            .collect()
    }

    pub fn active_execution_count(&self) -> usize {
        self.executions
            .lock()
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .count()
    }

    /// Raise progress of a running execution; lower values are ignored
    pub fn update_progress(&self, execution_id: &str, progress: u8) {
        if let Some(execution) = self.executions.lock().get_mut(execution_id) {
            if execution.status == ExecutionStatus::Running {
                execution.progress = execution.progress.max(progress.min(100));
            }
        }
    }

    /// Guarded `running → terminal` transition.
    ///
    /// Only the first caller for a given execution wins: it gets the finished
    /// execution back and the task outcome is written under the same lock.
    /// Every later caller gets `None` and must not touch the agent's load.
    pub fn finish_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
    ) -> EngineResult<Option<Execution>> {
        let mut executions = self.executions.lock();
        let execution = executions.get_mut(execution_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!("unknown execution {}", execution_id))
        })?;
        if execution.status != ExecutionStatus::Running {
            return Ok(None);
        }
        execution.finish(outcome.status());
        let finished = execution.clone();

        let mut tasks = self.tasks.write();
        match tasks.get_mut(&finished.task_id) {
            Some(task) => {
                let applied = match outcome {
                    ExecutionOutcome::Completed(output) => task.complete(output.clone()),
                    ExecutionOutcome::Failed(message) => task.fail(message.clone()),
                    ExecutionOutcome::TimedOut(limit_ms) => task.time_out(*limit_ms),
                };
                if let Err(e) = applied {
                    warn!("Task {} outcome not applied: {}", task.id, e);
                    if !task.is_terminal() {
                        let message = outcome.error_message().unwrap_or_else(|| e.to_string());
                        if let Err(e) = task.fail(message) {
                            error!("Task {} could not be failed: {}", task.id, e);
                        }
                    }
                }
            }
            None => warn!(
                "Execution {} finished for unknown task {}",
                finished.id, finished.task_id
            ),
        }
        Ok(Some(finished))
    }

    /// Remove terminal executions that finished more than `retention` ago
    pub fn collect_executions(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut executions = self.executions.lock();
        let before = executions.len();
        executions.retain(|_, e| match e.finished {
            Some(finished) => now.saturating_duration_since(finished) <= retention,
            None => true,
        });
        before - executions.len()
    }
}
