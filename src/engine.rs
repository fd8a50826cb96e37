//! Engine coordinator
//!
//! Owns the shared `EngineState` and the four components, and drives them:
//! - explicit tick functions (`dispatch_tick`, `sweep_tick`, ...) for tests
//!   and embedding
//! - `start()` spawns one loop per concern, each an interval inside a
//!   `tokio::select!` with a shared shutdown signal
//!
//! No loop ever stops on an error; failures are logged and the next tick runs.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::analyzer::{Analyzer, KeywordAnalyzer, OllamaAnalyzer};
use crate::channel::{IngestEvent, MessageKind, Notifier, OutgoingMessage};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{EventSink, JsonlEventSink, NullEventSink};
use crate::executor::{ExecutionReport, Executor, HandlerRegistry, SweepReport};
use crate::feedback::{FeedbackLoop, FeedbackReport, PerformanceSummary};
use crate::format::{format_agents, format_status};
use crate::intake::TaskIntake;
use crate::registry::{AgentRegistry, AgentStatus, CapabilityClass};
use crate::scheduler::{Dispatch, Dispatcher, RebalanceReport};
use crate::state::EngineState;
use crate::task::{Task, TaskId, TaskKind};

/// Capacity of the intake channel handed out by `start()`
const INTAKE_BUFFER: usize = 256;

/// One row of the per-agent status table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusRow {
    pub name: String,
    pub capability_class: CapabilityClass,
    pub status: AgentStatus,
    pub load: usize,
    pub max_concurrency: usize,
    pub efficiency: f64,
    pub effective_efficiency: f64,
    pub average_response_time_ms: u64,
    pub total_tasks: u64,
    pub success_rate: f64,
}

/// Read-only view for status commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub queue_depth: usize,
    pub active_executions: usize,
    pub agents: Vec<AgentStatusRow>,
    pub performance: PerformanceSummary,
    pub taken_at: DateTime<Utc>,
}

/// Operator commands answered without creating a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Agents,
}

impl Command {
    fn parse(payload: &str) -> Option<Self> {
        let head = payload.split_whitespace().next()?;
        // "/status@botname" style suffixes
        let name = head.split('@').next().unwrap_or(head);
        match name.to_lowercase().as_str() {
            "/status" => Some(Command::Status),
            "/agents" => Some(Command::Agents),
            _ => None,
        }
    }
}

/// The orchestration engine
pub struct Engine {
    config: EngineConfig,
    state: Arc<EngineState>,
    intake: TaskIntake,
    dispatcher: Dispatcher,
    executor: Arc<Executor>,
    feedback: FeedbackLoop,
    notifier: Arc<dyn Notifier>,
}

impl Engine {
    /// Build an engine with the built-in capability handlers
    pub fn new(
        config: EngineConfig,
        analyzer: Arc<dyn Analyzer>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
    ) -> EngineResult<Self> {
        let handlers = HandlerRegistry::with_defaults(&config.executor);
        Self::with_handlers(config, analyzer, notifier, sink, handlers)
    }

    /// Build an engine with a custom handler table
    pub fn with_handlers(
        config: EngineConfig,
        analyzer: Arc<dyn Analyzer>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
        handlers: HandlerRegistry,
    ) -> EngineResult<Self> {
        config.validate()?;

        let state = Arc::new(EngineState::new(AgentRegistry::new(config.agents.clone())));
        let intake = TaskIntake::new(
            Arc::clone(&state),
            Arc::clone(&analyzer),
            Arc::clone(&notifier),
            Arc::clone(&sink),
            config.intake.clone(),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&state), Arc::clone(&sink), config.scheduler.clone());
        let executor = Arc::new(Executor::new(
            Arc::clone(&state),
            Arc::new(handlers),
            analyzer,
            Arc::clone(&sink),
            config.executor.clone(),
        ));
        let feedback = FeedbackLoop::new(
            Arc::clone(&state),
            Arc::clone(&notifier),
            sink,
            config.feedback.clone(),
        );

        info!("Engine ready with {} agents", state.registry().len());
        Ok(Self {
            config,
            state,
            intake,
            dispatcher,
            executor,
            feedback,
            notifier,
        })
    }

    /// Build from configuration: Ollama analyzer when configured, keyword
    /// analyzer otherwise; JSONL sink when an event log path is set.
    pub fn from_config(config: EngineConfig, notifier: Arc<dyn Notifier>) -> anyhow::Result<Self> {
        let analyzer: Arc<dyn Analyzer> = match config.analyzer.ollama_url.as_deref() {
            Some(url) => {
                info!("Using Ollama analyzer at {} ({})", url, config.analyzer.model);
                Arc::new(OllamaAnalyzer::new(url, &config.analyzer)?)
            }
            None => {
                info!("Using keyword analyzer");
                Arc::new(KeywordAnalyzer::new())
            }
        };

        let sink: Arc<dyn EventSink> = match &config.event_log_path {
            Some(path) => {
                let sink = JsonlEventSink::open(path)
                    .with_context(|| format!("Failed to open event log {}", path.display()))?;
                info!("Analytics events -> {}", path.display());
                Arc::new(sink)
            }
            None => Arc::new(NullEventSink),
        };

        Ok(Self::new(config, analyzer, notifier, sink)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn registry(&self) -> &AgentRegistry {
        self.state.registry()
    }

    pub fn feedback(&self) -> &FeedbackLoop {
        &self.feedback
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.state.task(task_id)
    }

    /// Validate, classify and enqueue; only validation errors are returned
    pub async fn submit(&self, event: IngestEvent) -> EngineResult<TaskId> {
        self.intake.submit(event).await
    }

    /// Entry point for the ingestion channel. Operator commands are answered
    /// directly and yield `None`; everything else becomes a task.
    pub async fn handle_event(&self, event: IngestEvent) -> EngineResult<Option<TaskId>> {
        if event.kind == TaskKind::Command {
            if let Some(command) = Command::parse(&event.payload) {
                self.answer(command, &event.chat_id).await;
                return Ok(None);
            }
        }
        self.submit(event).await.map(Some)
    }

    async fn answer(&self, command: Command, chat_id: &str) {
        let snapshot = self.snapshot();
        let content = match command {
            Command::Status => format_status(&snapshot),
            Command::Agents => format_agents(&snapshot),
        };
        debug!("Answering {:?} for chat {}", command, chat_id);
        let reply = OutgoingMessage::html(chat_id, MessageKind::Status, content);
        if let Err(e) = self.notifier.send(reply).await {
            warn!("{:?} reply not sent: {}", command, e);
        }
    }

    /// Dispatch queued tasks and run each on its own task
    pub fn dispatch_tick(&self) -> Vec<Dispatch> {
        let dispatches = self.dispatcher.tick();
        for dispatch in &dispatches {
            let executor = Arc::clone(&self.executor);
            let task_id = dispatch.task_id.clone();
            let agent = dispatch.agent.clone();
            tokio::spawn(async move {
                if let Err(e) = executor.run(&task_id, &agent).await {
                    error!("Execution of {} on {} failed: {}", task_id, agent, e);
                }
            });
        }
        dispatches
    }

    /// Dispatch once and wait for every execution started by this pass
    pub async fn tick_once(&self) -> Vec<ExecutionReport> {
        let dispatches = self.dispatcher.tick();
        let runs = dispatches
            .iter()
            .map(|d| self.executor.run(&d.task_id, &d.agent));
        futures_util::future::join_all(runs)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(report) => Some(report),
                Err(e) => {
                    error!("Execution failed: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Reap overdue executions, then purge old tasks the feedback loop has seen
    pub async fn sweep_tick(&self) -> SweepReport {
        let report = self.executor.sweep().await;
        let purged = self
            .state
            .purge_terminal_tasks(self.config.executor.retention, |id| {
                self.feedback.is_processed(id)
            });
        if !purged.is_empty() {
            debug!("Purged {} terminal tasks", purged.len());
            self.feedback.forget(&purged);
        }
        report
    }

    pub fn rebalance_tick(&self) -> RebalanceReport {
        self.dispatcher.rebalance()
    }

    pub async fn feedback_tick(&self) -> FeedbackReport {
        self.feedback.tick().await
    }

    pub async fn report_tick(&self) -> PerformanceSummary {
        self.feedback.report_tick().await
    }

    /// Queue depth, active executions, per-agent table and rolling summary
    pub fn snapshot(&self) -> EngineSnapshot {
        let agents = self
            .state
            .registry()
            .list()
            .into_iter()
            .map(|agent| {
                let record = self.feedback.agent_record(&agent.name).unwrap_or_default();
                AgentStatusRow {
                    total_tasks: record.total_tasks,
                    success_rate: record.success_rate(),
                    name: agent.name,
                    capability_class: agent.capability_class,
                    status: agent.status,
                    load: agent.load,
                    max_concurrency: agent.max_concurrency,
                    efficiency: agent.efficiency,
                    effective_efficiency: agent.effective_efficiency,
                    average_response_time_ms: agent.average_response_time_ms,
                }
            })
            .collect();

        EngineSnapshot {
            queue_depth: self.state.queue_depth(),
            active_executions: self.state.active_execution_count(),
            agents,
            performance: self.feedback.summary(),
            taken_at: Utc::now(),
        }
    }

    /// Spawn the intake, scheduling, rebalance, sweep, feedback and report loops
    pub fn start(self: &Arc<Self>) -> EngineHandle {
        let (events_tx, mut events_rx) = mpsc::channel::<IngestEvent>(INTAKE_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();

        let engine = Arc::clone(self);
        let mut shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move {
            info!("Intake loop started");
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        let Some(event) = event else {
                            info!("Intake channel closed");
                            break;
                        };
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            if let Err(e) = engine.handle_event(event).await {
                                warn!("Event rejected: {}", e);
                            }
                        });
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Intake loop shutting down");
                            break;
                        }
                    }
                }
            }
        }));

        let cfg = &self.config;
        let engine = Arc::clone(self);
        loops.push(spawn_periodic("scheduler", cfg.scheduler.tick_interval, shutdown_rx.clone(), move || {
            engine.dispatch_tick();
            async {}
        }));

        let engine = Arc::clone(self);
        loops.push(spawn_periodic("rebalance", cfg.scheduler.rebalance_interval, shutdown_rx.clone(), move || {
            engine.rebalance_tick();
            async {}
        }));

        let engine = Arc::clone(self);
        loops.push(spawn_periodic("sweep", cfg.executor.sweep_interval, shutdown_rx.clone(), move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.sweep_tick().await;
            }
        }));

        let engine = Arc::clone(self);
        loops.push(spawn_periodic("feedback", cfg.feedback.monitor_interval, shutdown_rx.clone(), move || {
            let engine = Arc::clone(&engine);
            async move {
                let report = engine.feedback_tick().await;
                if report.processed > 0 {
                    debug!("Feedback processed {} tasks", report.processed);
                }
            }
        }));

        let engine = Arc::clone(self);
        loops.push(spawn_periodic("report", cfg.feedback.report_interval, shutdown_rx, move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.report_tick().await;
            }
        }));

        info!("Engine started");
        EngineHandle {
            events: events_tx,
            shutdown: shutdown_tx,
            loops,
        }
    }
}

/// Run `body` every `period` until the shutdown flag flips
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut body: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("{} loop every {:?}", name, period);
        loop {
            tokio::select! {
                _ = interval.tick() => body().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("{} loop shutting down", name);
                        break;
                    }
                }
            }
        }
    })
}

/// Handle to a started engine
pub struct EngineHandle {
    events: mpsc::Sender<IngestEvent>,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Sender for the ingestion channel
    pub fn sender(&self) -> mpsc::Sender<IngestEvent> {
        self.events.clone()
    }

    /// Stop every loop and wait for them. In-flight executions finish on
    /// their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!("Engine loop ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingNotifier;
    use crate::events::MemoryEventSink;
    use crate::task::TaskStatus;

    fn engine() -> (Engine, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(KeywordAnalyzer::new()),
            notifier.clone(),
            Arc::new(MemoryEventSink::new()),
        )
        .unwrap();
        (engine, notifier)
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("/STATUS@autopilot_bot now"), Some(Command::Status));
        assert_eq!(Command::parse(" /agents "), Some(Command::Agents));
        assert_eq!(Command::parse("/deploy prod"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[tokio::test]
    async fn test_status_command_replies_without_task() {
        let (engine, notifier) = engine();
        let out = engine
            .handle_event(IngestEvent::command("u1", "chat-1", "/status"))
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(engine.state().task_count(), 0);

        let replies = notifier.messages_of(MessageKind::Status);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].content.contains("Queue depth: 0"));
    }

    #[tokio::test]
    async fn test_unknown_command_becomes_task() {
        let (engine, _) = engine();
        let id = engine
            .handle_event(IngestEvent::command("u1", "chat-1", "/organize my files later"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.task(&id).unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_tick_once_runs_to_completion() {
        let (engine, _) = engine();
        let id = engine
            .submit(IngestEvent::text("u1", "chat-1", "analyze sales data: 10, 20, 30"))
            .await
            .unwrap();

        let reports = engine.tick_once().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].succeeded());
        assert_eq!(engine.registry().total_load(), 0);

        let processed = engine.feedback_tick().await.processed;
        assert_eq!(processed, 1);
        assert!(engine.task(&id).unwrap().satisfaction.is_some());

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.queue_depth, 0);
        assert_eq!(snapshot.active_executions, 0);
        assert_eq!(snapshot.performance.total_tasks, 1);
        let analyst = snapshot.agents.iter().find(|a| a.name == "data-analyst").unwrap();
        assert_eq!(analyst.total_tasks, 1);
    }

    #[tokio::test]
    async fn test_started_engine_processes_events() {
        let mut config = EngineConfig::default();
        config.scheduler.tick_interval = Duration::from_millis(10);
        config.feedback.monitor_interval = Duration::from_millis(10);
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Arc::new(
            Engine::new(
                config,
                Arc::new(KeywordAnalyzer::new()),
                notifier.clone(),
                Arc::new(MemoryEventSink::new()),
            )
            .unwrap(),
        );

        let handle = engine.start();
        handle
            .sender()
            .send(IngestEvent::text("u1", "chat-1", "analyze these numbers 1 2 3"))
            .await
            .unwrap();

        let mut outcomes = 0;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            outcomes = notifier.messages_of(MessageKind::Outcome).len();
            if outcomes > 0 {
                break;
            }
        }
        handle.shutdown().await;
        assert_eq!(outcomes, 1);
        assert_eq!(engine.registry().total_load(), 0);
    }
}
