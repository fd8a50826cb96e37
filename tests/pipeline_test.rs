//! End-to-end pipeline tests: intake -> dispatch -> execution -> feedback

use async_trait::async_trait;
use autopilot_engine::analyzer::capabilities_for;
use autopilot_engine::config::ClassTimeouts;
use autopilot_engine::task::TIMEOUT_ERROR_MARKER;
use autopilot_engine::{
    AgentRegistry, AgentSpec, Analyzer, AnalyzerError, CapabilityClass, CapabilityHandler,
    ClassificationRequest, Complexity, Engine, EngineConfig, HandlerContext, HandlerError,
    HandlerRegistry, IngestEvent, KeywordAnalyzer, MemoryEventSink, MessageKind, Priority,
    QualityRequest, RecordingNotifier, TaskAnalysis, TaskCategory, TaskOutput, TaskStatus,
};
use std::sync::Arc;
use std::time::Duration;

/// Routes by the first word of the content
struct ScriptedAnalyzer;

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<TaskAnalysis, AnalyzerError> {
        let category = match request.content.split_whitespace().next().unwrap_or("") {
            "ok" => TaskCategory::DataAnalysis,
            "fail" => TaskCategory::DataTransform,
            "hang" => TaskCategory::Automation,
            "file" => TaskCategory::FileManagement,
            _ => TaskCategory::General,
        };
        Ok(TaskAnalysis {
            intent: request.content.clone(),
            category,
            complexity: Complexity::Low,
            required_capabilities: capabilities_for(category),
            estimated_duration_secs: 5,
            confidence: 0.9,
            degraded: false,
        })
    }

    async fn assess_quality(&self, _request: &QualityRequest) -> Result<f64, AnalyzerError> {
        Ok(0.8)
    }
}

/// Never answers in time
struct StalledAnalyzer;

#[async_trait]
impl Analyzer for StalledAnalyzer {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn classify(&self, _request: &ClassificationRequest) -> Result<TaskAnalysis, AnalyzerError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Err(AnalyzerError::Unavailable("never reached".into()))
    }

    async fn assess_quality(&self, _request: &QualityRequest) -> Result<f64, AnalyzerError> {
        Err(AnalyzerError::Unavailable("offline".into()))
    }
}

/// Replies with prose instead of a classification object
struct ChattyAnalyzer;

#[async_trait]
impl Analyzer for ChattyAnalyzer {
    fn name(&self) -> &str {
        "chatty"
    }

    async fn classify(&self, _request: &ClassificationRequest) -> Result<TaskAnalysis, AnalyzerError> {
        autopilot_engine::analyzer::parse_classification("Sure! This looks like a data task.")
    }

    async fn assess_quality(&self, _request: &QualityRequest) -> Result<f64, AnalyzerError> {
        autopilot_engine::analyzer::parse_quality("great")
    }
}

struct SlowAnalysis(Duration);

#[async_trait]
impl CapabilityHandler for SlowAnalysis {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Analysis
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        ctx.progress.report(50);
        tokio::time::sleep(self.0).await;
        let mut output = TaskOutput::success("analysis done", serde_json::json!({"ok": true}));
        output.quality_score = 0.85;
        Ok(output)
    }
}

struct FailingTransform;

#[async_trait]
impl CapabilityHandler for FailingTransform {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::DataTransform
    }

    async fn handle(&self, ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        Err(HandlerError::Failed(format!(
            "upstream rejected '{}' after {} ms",
            ctx.task.id,
            100 + ctx.task.content.len()
        )))
    }
}

struct HangingAutomation;

#[async_trait]
impl CapabilityHandler for HangingAutomation {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Automation
    }

    async fn handle(&self, _ctx: HandlerContext) -> Result<TaskOutput, HandlerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(TaskOutput::success("too late", serde_json::Value::Null))
    }
}

fn scripted_handlers(config: &EngineConfig, analysis_delay: Duration) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::with_defaults(&config.executor);
    handlers.register(Arc::new(SlowAnalysis(analysis_delay)));
    handlers.register(Arc::new(FailingTransform));
    handlers.register(Arc::new(HangingAutomation));
    handlers
}

fn scripted_engine(
    mut config: EngineConfig,
    analysis_delay: Duration,
) -> (Engine, Arc<RecordingNotifier>, Arc<MemoryEventSink>) {
    config.executor.timeouts = ClassTimeouts::uniform(Duration::from_millis(200));
    config.feedback.operator_chat_id = Some("ops".into());
    let handlers = scripted_handlers(&config, analysis_delay);
    let notifier = Arc::new(RecordingNotifier::new());
    let sink = Arc::new(MemoryEventSink::new());
    let engine = Engine::with_handlers(
        config,
        Arc::new(ScriptedAnalyzer),
        notifier.clone(),
        sink.clone(),
        handlers,
    )
    .unwrap();
    (engine, notifier, sink)
}

fn keyword_engine(config: EngineConfig) -> (Engine, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = Engine::new(
        config,
        Arc::new(KeywordAnalyzer::new()),
        notifier.clone(),
        Arc::new(MemoryEventSink::new()),
    )
    .unwrap();
    (engine, notifier)
}

#[tokio::test]
async fn test_urgent_sales_analysis_end_to_end() {
    let (engine, notifier) = keyword_engine(EngineConfig::default());
    let before = engine.registry().get("data-analyst").unwrap().load;

    let id = engine
        .submit(IngestEvent::text("u1", "chat-1", "urgent: analyze sales data for Q3"))
        .await
        .unwrap();
    let queued = engine.task(&id).unwrap();
    assert_eq!(queued.priority, Priority::Urgent);
    assert_eq!(queued.status, TaskStatus::Queued);
    assert_eq!(queued.analysis.as_ref().unwrap().category, TaskCategory::DataAnalysis);

    let reports = engine.tick_once().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].execution.agent_name, "data-analyst");

    let done = engine.task(&id).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.result.is_some());
    assert!(done.error.is_none());
    assert!(done.end_time.is_some());
    assert_eq!(done.executing_agent.as_deref(), Some("data-analyst"));
    assert_eq!(engine.registry().get("data-analyst").unwrap().load, before);

    engine.feedback_tick().await;
    let satisfaction = engine.task(&id).unwrap().satisfaction.unwrap();
    assert!((1.0..=10.0).contains(&satisfaction));
    assert_eq!(notifier.messages_of(MessageKind::Acknowledgment).len(), 1);
    assert_eq!(notifier.messages_of(MessageKind::Outcome).len(), 1);
}

#[tokio::test]
async fn test_load_released_once_on_every_exit_path() {
    let (engine, _, _) = scripted_engine(EngineConfig::default(), Duration::from_millis(5));
    let ok = engine.submit(IngestEvent::text("u1", "c", "ok compute")).await.unwrap();
    let failed = engine.submit(IngestEvent::text("u1", "c", "fail convert")).await.unwrap();
    let hung = engine.submit(IngestEvent::text("u1", "c", "hang forever")).await.unwrap();

    let reports = engine.tick_once().await;
    assert_eq!(reports.len(), 3);
    assert_eq!(engine.registry().total_load(), 0);

    assert_eq!(engine.task(&ok).unwrap().status, TaskStatus::Completed);
    assert_eq!(engine.task(&failed).unwrap().status, TaskStatus::Failed);
    let timed_out = engine.task(&hung).unwrap();
    assert_eq!(timed_out.status, TaskStatus::Timeout);
    assert!(timed_out.error.unwrap().starts_with(TIMEOUT_ERROR_MARKER));

    for id in [&ok, &failed, &hung] {
        let task = engine.task(id).unwrap();
        assert!(task.outcome_consistent(), "task {} is inconsistent", id);
        assert!(task.result.is_some() != task.error.is_some());
    }

    let sweep = engine.sweep_tick().await;
    assert!(sweep.reaped.is_empty());
    assert_eq!(engine.registry().total_load(), 0);
}

#[tokio::test]
async fn test_capacity_never_exceeded_under_backlog() {
    let (engine, _, _) = scripted_engine(EngineConfig::default(), Duration::from_millis(30));
    let mut ids = Vec::new();
    for i in 0..12 {
        let content = format!("ok batch item {}", i);
        ids.push(engine.submit(IngestEvent::text("u1", "c", &content)).await.unwrap());
    }

    let mut peak = 0;
    for _ in 0..400 {
        engine.dispatch_tick();
        for agent in engine.registry().list() {
            assert!(
                agent.load <= agent.max_concurrency,
                "{} at {}/{}",
                agent.name,
                agent.load,
                agent.max_concurrency
            );
        }
        peak = peak.max(engine.registry().get("data-analyst").unwrap().load);
        if ids.iter().all(|id| engine.task(id).unwrap().is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(peak, 3);
    assert!(ids
        .iter()
        .all(|id| engine.task(id).unwrap().status == TaskStatus::Completed));
    assert_eq!(engine.registry().total_load(), 0);
}

#[test]
fn test_concurrent_increments_respect_capacity() {
    let registry = AgentRegistry::new(vec![AgentSpec::new(
        "solo",
        CapabilityClass::Analysis,
        &["general-analysis"],
    )
    .with_max_concurrency(3)]);

    let granted: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..32)
            .map(|_| scope.spawn(|| registry.increment_load("solo").is_ok()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum()
    });

    assert_eq!(granted, 3);
    assert_eq!(registry.get("solo").unwrap().load, 3);
}

#[tokio::test]
async fn test_priority_bands_dispatch_in_order() {
    let config = EngineConfig {
        agents: vec![AgentSpec::new(
            "solo",
            CapabilityClass::Analysis,
            &["general-analysis", "data-analysis"],
        )
        .with_max_concurrency(1)],
        ..EngineConfig::default()
    };
    let (engine, _) = keyword_engine(config);

    let contents = [
        "summarize the report later",
        "urgent: summarize revenue",
        "summarize the revenue trend",
        "urgent summarize sales",
    ];
    let mut ids = Vec::new();
    for content in contents {
        ids.push(engine.submit(IngestEvent::text("u1", "c", content)).await.unwrap());
    }

    let mut order = Vec::new();
    for _ in 0..contents.len() {
        let reports = engine.tick_once().await;
        assert_eq!(reports.len(), 1);
        order.push(reports[0].task.id.clone());
    }
    assert_eq!(order, vec![ids[1].clone(), ids[3].clone(), ids[2].clone(), ids[0].clone()]);
}

#[tokio::test]
async fn test_classification_timeout_falls_back() {
    let mut config = EngineConfig::default();
    config.intake.classify_timeout = Duration::from_millis(50);
    let engine = Engine::new(
        config,
        Arc::new(StalledAnalyzer),
        Arc::new(RecordingNotifier::new()),
        Arc::new(MemoryEventSink::new()),
    )
    .unwrap();

    let id = engine
        .submit(IngestEvent::text("u1", "c", "what can you do"))
        .await
        .unwrap();
    let task = engine.task(&id).unwrap();
    let analysis = task.analysis.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(analysis.category, TaskCategory::General);
    assert_eq!(analysis.complexity, Complexity::Medium);
    assert_eq!(analysis.confidence, 0.5);
    assert!(analysis.degraded);

    let reports = engine.tick_once().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].succeeded());
}

#[tokio::test]
async fn test_invalid_analyzer_json_falls_back_and_defaults_quality() {
    let engine = Engine::new(
        EngineConfig::default(),
        Arc::new(ChattyAnalyzer),
        Arc::new(RecordingNotifier::new()),
        Arc::new(MemoryEventSink::new()),
    )
    .unwrap();

    let id = engine
        .submit(IngestEvent::text("u1", "c", "look at these numbers 4 8 15 16 23 42"))
        .await
        .unwrap();
    let analysis = engine.task(&id).unwrap().analysis.unwrap();
    assert_eq!(analysis.category, TaskCategory::General);
    assert_eq!(analysis.confidence, 0.5);

    engine.tick_once().await;
    let task = engine.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.unwrap().quality_score, 0.7);
}

#[tokio::test]
async fn test_recurring_failures_suggested_by_count() {
    let (engine, notifier, sink) = scripted_engine(EngineConfig::default(), Duration::from_millis(5));
    for i in 0..5 {
        let content = format!("fail job {}", "x".repeat(i));
        engine.submit(IngestEvent::text("u1", "chat-1", &content)).await.unwrap();
    }

    // data-transformer takes three at a time
    assert_eq!(engine.tick_once().await.len(), 3);
    assert_eq!(engine.tick_once().await.len(), 2);

    let report = engine.feedback_tick().await;
    assert_eq!(report.processed, 5);

    let recurring = notifier.messages_of(MessageKind::RecurringError);
    assert_eq!(recurring.len(), 2);
    assert!(recurring.iter().all(|m| m.chat_id == "ops"));
    assert_eq!(sink.count(autopilot_engine::EventCategory::ErrorPattern), 2);

    let patterns = engine.feedback().error_patterns();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].count, 5);
    assert_eq!(patterns[0].affected_task_ids.len(), 5);

    let transformer = engine.registry().get("data-transformer").unwrap();
    assert!(transformer.efficiency < 0.5);
}

#[tokio::test]
async fn test_status_and_agents_commands() {
    let (engine, notifier) = keyword_engine(EngineConfig::default());
    engine
        .submit(IngestEvent::text("u1", "chat-1", "analyze revenue 100 200"))
        .await
        .unwrap();

    assert!(engine
        .handle_event(IngestEvent::command("op", "ops", "/status"))
        .await
        .unwrap()
        .is_none());
    assert!(engine
        .handle_event(IngestEvent::command("op", "ops", "/agents"))
        .await
        .unwrap()
        .is_none());

    let replies = notifier.messages_of(MessageKind::Status);
    assert_eq!(replies.len(), 2);
    assert!(replies[0].content.contains("Queue depth: 1"));
    assert!(replies[1].content.contains("data-analyst"));
    assert!(replies.iter().all(|m| m.chat_id == "ops"));
}

#[tokio::test]
async fn test_jsonl_log_records_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let engine = Engine::new(
        EngineConfig::default(),
        Arc::new(KeywordAnalyzer::new()),
        Arc::new(RecordingNotifier::new()),
        Arc::new(autopilot_engine::JsonlEventSink::open(&path).unwrap()),
    )
    .unwrap();

    let id = engine
        .submit(IngestEvent::text("u1", "c", "analyze sales data 5 10 15"))
        .await
        .unwrap();
    engine.tick_once().await;

    let raw = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    for category in ["intake", "classification", "dispatch", "start", "terminal"] {
        assert!(
            records
                .iter()
                .any(|r| r["category"] == category && r["task_id"] == id.as_str()),
            "missing {} record",
            category
        );
    }
}

#[tokio::test]
async fn test_file_ops_stay_inside_workspace() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "quarterly numbers").unwrap();

    let mut config = EngineConfig::default();
    config.executor.workspace_root = dir.path().to_path_buf();
    let engine = Engine::new(
        config,
        Arc::new(ScriptedAnalyzer),
        Arc::new(RecordingNotifier::new()),
        Arc::new(MemoryEventSink::new()),
    )
    .unwrap();

    let read = engine
        .submit(IngestEvent::text("u1", "c", "file read notes.txt"))
        .await
        .unwrap();
    let escape = engine
        .submit(IngestEvent::text("u1", "c", "file read ../../etc/passwd"))
        .await
        .unwrap();
    engine.tick_once().await;

    let read = engine.task(&read).unwrap();
    assert_eq!(read.status, TaskStatus::Completed);
    assert_eq!(read.executing_agent.as_deref(), Some("file-manager"));
    assert!(read.result.unwrap().data.to_string().contains("quarterly numbers"));

    let escape = engine.task(&escape).unwrap();
    assert_eq!(escape.status, TaskStatus::Failed);
    assert!(escape.error.unwrap().contains("outside the workspace"));
    assert_eq!(engine.registry().total_load(), 0);
}
