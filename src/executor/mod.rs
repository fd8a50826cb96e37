//! Task Executor
//!
//! Runs one dispatched task against its committed agent:
//! - creates the `Execution` record and moves the task to `executing`
//! - runs the capability handler on its own task under the class timeout
//! - estimates quality for free-form output (best effort, default 0.7)
//! - finalizes through the guarded `running → terminal` transition, so the
//!   agent's load is released exactly once whichever path gets there first
//!
//! A periodic `sweep` reaps executions that outlived their budget and
//! garbage-collects terminal executions after the retention window.

pub mod handlers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analyzer::{Analyzer, QualityRequest};
use crate::config::ExecutorConfig;
use crate::error::{EngineError, EngineResult, HandlerError};
use crate::events::{EventCategory, EventLevel, EventRecord, EventSink};
use crate::registry::CapabilityClass;
use crate::state::EngineState;
use crate::task::{Task, TaskId, TaskOutput, TaskStatus};

pub use handlers::{CapabilityHandler, HandlerContext, HandlerRegistry};

/// Execution lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

/// One timed attempt to run a task on an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: TaskId,
    pub agent_name: String,
    pub capability_class: CapabilityClass,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Percent complete, never decreasing
    pub progress: u8,
    pub status: ExecutionStatus,
    /// Handler time budget for this capability class
    pub budget_ms: u64,
    #[serde(skip, default = "Instant::now")]
    pub(crate) started: Instant,
    #[serde(skip)]
    pub(crate) finished: Option<Instant>,
    /// Age after which the sweep reaps the execution
    #[serde(skip)]
    pub(crate) reap_after: Duration,
}

impl Execution {
    pub fn start(
        task_id: &str,
        agent_name: &str,
        capability_class: CapabilityClass,
        budget: Duration,
        reap_after: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            agent_name: agent_name.to_string(),
            capability_class,
            start_time: Utc::now(),
            end_time: None,
            progress: 0,
            status: ExecutionStatus::Running,
            budget_ms: budget.as_millis() as u64,
            started: Instant::now(),
            finished: None,
            reap_after,
        }
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.finished = Some(Instant::now());
        if status == ExecutionStatus::Completed {
            self.progress = 100;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Running
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Running past its reap deadline
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.status == ExecutionStatus::Running
            && now.saturating_duration_since(self.started) > self.reap_after
    }
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(TaskOutput),
    Failed(String),
    /// Carries the exceeded budget in milliseconds
    TimedOut(u64),
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Completed(_) => ExecutionStatus::Completed,
            Self::Failed(_) => ExecutionStatus::Failed,
            Self::TimedOut(_) => ExecutionStatus::Timeout,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(message) => Some(message.clone()),
            Self::TimedOut(limit_ms) => Some(format!(
                "{} execution exceeded its {} ms budget",
                crate::task::TIMEOUT_ERROR_MARKER,
                limit_ms
            )),
        }
    }
}

/// Monotonic progress reporting handed to handlers
#[derive(Clone)]
pub struct ProgressReporter {
    value: Arc<AtomicU8>,
    target: Option<(Arc<EngineState>, String)>,
}

impl ProgressReporter {
    /// Reporter bound to an execution record
    pub fn for_execution(state: Arc<EngineState>, execution_id: &str) -> Self {
        Self {
            value: Arc::new(AtomicU8::new(0)),
            target: Some((state, execution_id.to_string())),
        }
    }

    /// Reporter that only tracks the value (standalone handler runs)
    pub fn detached() -> Self {
        Self {
            value: Arc::new(AtomicU8::new(0)),
            target: None,
        }
    }

    /// Report a checkpoint; values below the current one are ignored
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.value.fetch_max(percent, Ordering::AcqRel);
        if percent > previous {
            if let Some((state, execution_id)) = &self.target {
                state.update_progress(execution_id, percent);
            }
        }
    }

    pub fn current(&self) -> u8 {
        self.value.load(Ordering::Acquire)
    }
}

/// Final view of one `run()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution: Execution,
    pub task: Task,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.task.succeeded()
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Tasks whose execution was reaped as timed out
    pub reaped: Vec<TaskId>,
    /// Terminal executions removed after retention
    pub collected: usize,
}

/// Runs dispatched tasks against capability handlers
pub struct Executor {
    state: Arc<EngineState>,
    handlers: Arc<HandlerRegistry>,
    analyzer: Arc<dyn Analyzer>,
    sink: Arc<dyn EventSink>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        state: Arc<EngineState>,
        handlers: Arc<HandlerRegistry>,
        analyzer: Arc<dyn Analyzer>,
        sink: Arc<dyn EventSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            state,
            handlers,
            analyzer,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a dispatched task on the agent whose load the dispatcher took.
    ///
    /// After this returns the task is terminal and the agent's load has been
    /// released, unless the sweep already finalized the execution.
    pub async fn run(&self, task_id: &str, agent_name: &str) -> EngineResult<ExecutionReport> {
        let agent = self.state.registry().get(agent_name)?;

        let Some(task) = self.state.task(task_id) else {
            self.release(agent_name);
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        };

        let class = agent.capability_class;
        let budget = self.config.timeouts.for_class(class);
        let handler = self.handlers.get(class);
        let reap_after = budget
            + self.config.sweep_grace
            + handler
                .as_ref()
                .filter(|h| h.produces_free_form())
                .map(|_| self.config.quality_timeout)
                .unwrap_or_default();

        let execution = Execution::start(task_id, agent_name, class, budget, reap_after);
        let execution_id = execution.id.clone();
        self.state.insert_execution(execution);

        let started = self.state.update_task(task_id, |t| {
            t.advance(TaskStatus::Executing)?;
            t.executing_agent = Some(agent_name.to_string());
            t.start_time = Some(Utc::now());
            Ok(t.clone())
        });
        let task = match started {
            Ok(task) => task,
            Err(e) => {
                error!("Task {} cannot start on {}: {}", task.id, agent_name, e);
                let outcome = ExecutionOutcome::Failed(e.to_string());
                return self.finalize(&execution_id, outcome).await;
            }
        };

        info!(
            "Executing task {} on {} ({}, budget {:?})",
            task.id,
            agent_name,
            class.as_str(),
            budget
        );
        self.sink.emit(
            EventRecord::new(EventCategory::Start, "execution started")
                .for_task(&task.id)
                .with_data(serde_json::json!({
                    "execution_id": execution_id,
                    "agent": agent_name,
                    "class": class.as_str(),
                    "budget_ms": budget.as_millis() as u64,
                })),
        );

        let Some(handler) = handler else {
            let outcome =
                ExecutionOutcome::Failed(format!("no handler registered for {}", class.as_str()));
            return self.finalize(&execution_id, outcome).await;
        };

        let progress = ProgressReporter::for_execution(Arc::clone(&self.state), &execution_id);
        let ctx = HandlerContext {
            task: task.clone(),
            progress: progress.clone(),
        };
        progress.report(5);

        let worker = Arc::clone(&handler);
        let mut join = tokio::spawn(async move { worker.handle(ctx).await });

        let outcome = match tokio::time::timeout(budget, &mut join).await {
            Err(_) => {
                join.abort();
                warn!("Task {} timed out on {} after {:?}", task.id, agent_name, budget);
                ExecutionOutcome::TimedOut(budget.as_millis() as u64)
            }
            Ok(Err(join_error)) => {
                let err = if join_error.is_panic() {
                    HandlerError::Panicked(panic_message(join_error.into_panic()))
                } else {
                    HandlerError::Failed("handler task was cancelled".to_string())
                };
                warn!("Task {} handler crashed: {}", task.id, err);
                ExecutionOutcome::Failed(err.to_string())
            }
            Ok(Ok(Err(err))) => {
                warn!("Task {} failed on {}: {}", task.id, agent_name, err);
                ExecutionOutcome::Failed(err.to_string())
            }
            Ok(Ok(Ok(output))) if !output.success => {
                warn!("Task {} reported failure: {}", task.id, output.message);
                ExecutionOutcome::Failed(output.message)
            }
            Ok(Ok(Ok(mut output))) => {
                progress.report(90);
                output.quality_score = if handler.produces_free_form() {
                    self.estimate_quality(&task, &output).await
                } else if output.quality_score > 0.0 {
                    output.quality_score.clamp(0.0, 1.0)
                } else {
                    self.config.default_quality
                };
                ExecutionOutcome::Completed(output)
            }
        };

        self.finalize(&execution_id, outcome).await
    }

    /// Quality step: bounded analyzer call, degrading to the configured default
    async fn estimate_quality(&self, task: &Task, output: &TaskOutput) -> f64 {
        let raw_result = if output.data.is_null() {
            output.message.clone()
        } else {
            format!("{}\n{}", output.message, output.data)
        };
        let request = QualityRequest {
            raw_result,
            original_task: task.content.clone(),
        };
        match tokio::time::timeout(
            self.config.quality_timeout,
            self.analyzer.assess_quality(&request),
        )
        .await
        {
            Ok(Ok(score)) if (0.0..=1.0).contains(&score) => score,
            Ok(Ok(score)) => {
                debug!("Quality {} out of range for {}, using default", score, task.id);
                self.config.default_quality
            }
            Ok(Err(e)) => {
                debug!("Quality estimate unavailable for {}: {}", task.id, e);
                self.config.default_quality
            }
            Err(_) => {
                debug!("Quality estimate timed out for {}", task.id);
                self.config.default_quality
            }
        }
    }

    /// Apply a terminal outcome; only the winner of the transition releases load
    async fn finalize(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
    ) -> EngineResult<ExecutionReport> {
        if let Some(execution) = self.state.finish_execution(execution_id, &outcome)? {
            self.release(&execution.agent_name);

            let level = match outcome {
                ExecutionOutcome::Completed(_) => EventLevel::Info,
                _ => EventLevel::Warn,
            };
            info!(
                "Task {} {} on {} in {}ms",
                execution.task_id,
                execution.status.as_str(),
                execution.agent_name,
                execution.age().as_millis()
            );
            self.sink.emit(
                EventRecord::new(EventCategory::Terminal, execution.status.as_str())
                    .for_task(&execution.task_id)
                    .with_level(level)
                    .with_data(serde_json::json!({
                        "execution_id": execution.id,
                        "agent": execution.agent_name,
                        "error": outcome.error_message(),
                    })),
            );
        } else {
            debug!("Execution {} was already finalized", execution_id);
        }

        let execution = self.state.execution(execution_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!("execution {} vanished", execution_id))
        })?;
        let task = self
            .state
            .task(&execution.task_id)
            .ok_or_else(|| EngineError::TaskNotFound(execution.task_id.clone()))?;
        Ok(ExecutionReport { execution, task })
    }

    fn release(&self, agent_name: &str) {
        if let Err(e) = self.state.registry().decrement_load(agent_name) {
            error!("Load release failed for {}: {}", agent_name, e);
        }
    }

    /// Reap overdue executions and collect old terminal ones
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        for execution in self.state.running_executions() {
            if !execution.is_overdue(now) {
                continue;
            }
            warn!(
                "Sweep reaping execution {} of task {} ({}ms old)",
                execution.id,
                execution.task_id,
                execution.age().as_millis()
            );
            let outcome = ExecutionOutcome::TimedOut(execution.budget_ms);
            match self.finalize(&execution.id, outcome).await {
                Ok(done) if done.execution.status == ExecutionStatus::Timeout => {
                    report.reaped.push(execution.task_id.clone())
                }
                Ok(_) => {}
                Err(e) => error!("Sweep failed to finalize {}: {}", execution.id, e),
            }
        }

        report.collected = self.state.collect_executions(self.config.retention);
        if !report.reaped.is_empty() || report.collected > 0 {
            debug!(
                "Sweep: reaped {}, collected {}",
                report.reaped.len(),
                report.collected
            );
        }
        report
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::KeywordAnalyzer;
    use crate::config::ClassTimeouts;
    use crate::events::MemoryEventSink;
    use crate::registry::{AgentRegistry, AgentSpec};
    use crate::task::{TaskAnalysis, TaskKind};
    use async_trait::async_trait;

    struct Sleepy;

    #[async_trait]
    impl CapabilityHandler for Sleepy {
        fn class(&self) -> CapabilityClass {
            CapabilityClass::Analysis
        }

        async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
            ctx.progress.report(20);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(TaskOutput::success("late", serde_json::Value::Null))
        }
    }

    struct Exploding;

    #[async_trait]
    impl CapabilityHandler for Exploding {
        fn class(&self) -> CapabilityClass {
            CapabilityClass::Analysis
        }

        async fn handle(&self, _ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
            panic!("boom");
        }
    }

    fn setup(
        handler: Arc<dyn CapabilityHandler>,
        timeout: Duration,
    ) -> (Arc<EngineState>, Executor, Arc<MemoryEventSink>) {
        let registry = AgentRegistry::new(vec![AgentSpec::new(
            "solo",
            CapabilityClass::Analysis,
            &["general-analysis"],
        )]);
        let state = Arc::new(EngineState::new(registry));
        let mut handlers = HandlerRegistry::new();
        handlers.register(handler);
        let sink = Arc::new(MemoryEventSink::new());
        let config = ExecutorConfig {
            timeouts: ClassTimeouts::uniform(timeout),
            sweep_grace: Duration::ZERO,
            quality_timeout: Duration::from_millis(200),
            ..ExecutorConfig::default()
        };
        let executor = Executor::new(
            Arc::clone(&state),
            Arc::new(handlers),
            Arc::new(KeywordAnalyzer::new()),
            sink.clone(),
            config,
        );
        (state, executor, sink)
    }

    fn dispatched(state: &EngineState) -> String {
        let mut task = Task::new(TaskKind::Text, "count these words").with_analysis(TaskAnalysis::fallback());
        task.advance(TaskStatus::Analyzed).unwrap();
        task.advance(TaskStatus::Queued).unwrap();
        task.advance(TaskStatus::Dispatched).unwrap();
        task.assigned_agent = Some("solo".to_string());
        let id = task.id.clone();
        state.insert_task(task);
        state.registry().increment_load("solo").unwrap();
        id
    }

    #[tokio::test]
    async fn test_timeout_releases_load_once() {
        let (state, executor, sink) = setup(Arc::new(Sleepy), Duration::from_millis(50));
        let id = dispatched(&state);

        let report = executor.run(&id, "solo").await.unwrap();
        assert_eq!(report.execution.status, ExecutionStatus::Timeout);
        assert_eq!(report.task.status, TaskStatus::Timeout);
        assert!(report.task.is_timeout());
        assert!(report.task.outcome_consistent());
        assert!(report.execution.end_time.is_some());
        assert_eq!(state.registry().get("solo").unwrap().load, 0);

        // A late sweep must not release again
        let sweep = executor.sweep().await;
        assert!(sweep.reaped.is_empty());
        assert_eq!(state.registry().get("solo").unwrap().load, 0);
        assert_eq!(sink.count(EventCategory::Terminal), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (state, executor, _sink) = setup(Arc::new(Exploding), Duration::from_secs(5));
        let id = dispatched(&state);

        let report = executor.run(&id, "solo").await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Failed);
        assert!(report.task.error.as_deref().unwrap().contains("boom"));
        assert_eq!(state.registry().get("solo").unwrap().load, 0);
    }

    #[tokio::test]
    async fn test_sweep_reaps_overdue_execution() {
        let (state, executor, _sink) = setup(Arc::new(Sleepy), Duration::from_millis(10));
        let id = dispatched(&state);

        // Simulate a run whose completion path never came back
        let execution = Execution::start(
            &id,
            "solo",
            CapabilityClass::Analysis,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        state.insert_execution(execution);
        state
            .update_task(&id, |t| t.advance(TaskStatus::Executing))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = executor.sweep().await;
        assert_eq!(report.reaped, vec![id.clone()]);
        assert_eq!(state.task(&id).unwrap().status, TaskStatus::Timeout);
        assert_eq!(state.registry().get("solo").unwrap().load, 0);
        assert_eq!(state.active_execution_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_task_releases_load() {
        let (state, executor, _sink) = setup(Arc::new(Sleepy), Duration::from_secs(1));
        state.registry().increment_load("solo").unwrap();
        let err = executor.run("task_missing", "solo").await.unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));
        assert_eq!(state.registry().get("solo").unwrap().load, 0);
    }

    #[test]
    fn test_progress_reporter_monotonic() {
        let progress = ProgressReporter::detached();
        progress.report(30);
        progress.report(10);
        assert_eq!(progress.current(), 30);
        progress.report(200);
        assert_eq!(progress.current(), 100);
    }
}
