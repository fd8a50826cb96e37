//! Task Intake
//!
//! Turns one `IngestEvent` into a queued `Task`:
//! 1. validate (text, or an attachment kind with a media reference)
//! 2. priority from keyword sets, language from script
//! 3. classify through the analyzer under a timeout, falling back to the
//!    default analysis on any failure
//! 4. enqueue and acknowledge
//!
//! Only validation errors reach the caller; a degraded classification is
//! recorded on the task (`analysis.degraded`) and in the analytics sink.

use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, ClassificationRequest};
use crate::channel::{IngestEvent, MessageKind, Notifier, OutgoingMessage};
use crate::config::IntakeConfig;
use crate::error::{AnalyzerError, EngineError, EngineResult};
use crate::events::{EventCategory, EventLevel, EventRecord, EventSink};
use crate::format::format_ack;
use crate::state::EngineState;
use crate::task::{Priority, Task, TaskAnalysis, TaskId, TaskStatus};

static URGENT_KEYWORDS: &[&str] = &[
    "urgent", "asap", "immediately", "emergency", "critical", "right now",
    "긴급", "급함", "급해", "즉시", "당장",
];

static HIGH_KEYWORDS: &[&str] = &[
    "important", "high priority", "soon", "중요", "빨리",
];

static LOW_KEYWORDS: &[&str] = &[
    "later", "whenever", "no rush", "low priority", "someday", "when you can",
    "나중에", "천천히", "여유",
];

/// Priority from keyword sets: urgent > high > low > medium (default)
pub fn detect_priority(content: &str) -> Priority {
    let text = content.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|kw| text.contains(kw));

    if hit(URGENT_KEYWORDS) {
        Priority::Urgent
    } else if hit(HIGH_KEYWORDS) {
        Priority::High
    } else if hit(LOW_KEYWORDS) {
        Priority::Low
    } else {
        Priority::Medium
    }
}

static HANGUL_RANGES: Lazy<Vec<std::ops::RangeInclusive<char>>> = Lazy::new(|| {
    vec![
        '\u{AC00}'..='\u{D7A3}', // syllables
        '\u{1100}'..='\u{11FF}', // jamo
        '\u{3130}'..='\u{318F}', // compatibility jamo
    ]
});

/// `ko` when any Hangul is present, `default` otherwise
pub fn detect_language(content: &str, default: &str) -> String {
    let korean = content
        .chars()
        .any(|c| HANGUL_RANGES.iter().any(|range| range.contains(&c)));
    if korean {
        "ko".to_string()
    } else {
        default.to_string()
    }
}

/// Reject events that cannot become a task
pub fn validate_event(event: &IngestEvent) -> EngineResult<()> {
    let has_text = !event.payload.trim().is_empty();
    let has_attachment = event.kind.is_attachment()
        && event
            .media_url
            .as_deref()
            .map(|m| !m.trim().is_empty())
            .unwrap_or(false);
    if !has_text && !has_attachment {
        return Err(EngineError::Validation(format!(
            "{} event from '{}' has no content",
            event.kind.as_str(),
            event.sender_id
        )));
    }
    Ok(())
}

/// Converts external events into queued tasks
pub struct TaskIntake {
    state: Arc<EngineState>,
    analyzer: Arc<dyn Analyzer>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn EventSink>,
    config: IntakeConfig,
}

impl TaskIntake {
    pub fn new(
        state: Arc<EngineState>,
        analyzer: Arc<dyn Analyzer>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            state,
            analyzer,
            notifier,
            sink,
            config,
        }
    }

    /// Validate, classify and enqueue one event
    pub async fn submit(&self, event: IngestEvent) -> EngineResult<TaskId> {
        validate_event(&event)?;

        let priority = detect_priority(&event.payload);
        let language = detect_language(&event.payload, &self.config.default_language);
        let mut task = Task::new(event.kind, event.payload.trim())
            .with_origin(&event.sender_id, &event.chat_id)
            .with_priority(priority)
            .with_language(&language);
        task.media_url = event.media_url.clone().filter(|m| !m.trim().is_empty());
        task.required_agents = event.required_agents.clone();
        let task_id = task.id.clone();

        self.state.insert_task(task.clone());
        self.sink.emit(
            EventRecord::new(EventCategory::Intake, "task accepted")
                .for_task(&task_id)
                .with_data(serde_json::json!({
                    "kind": task.kind.as_str(),
                    "priority": priority.as_str(),
                    "language": language,
                    "sender": event.sender_id,
                })),
        );

        let request = ClassificationRequest {
            content: task.content.clone(),
            kind: task.kind,
            language: language.clone(),
            user_hint: event.user_hint.clone(),
        };
        let analysis = self.classify(&task_id, &request).await;

        let queued = self.state.update_task(&task_id, |t| {
            t.analysis = Some(analysis.clone());
            t.advance(TaskStatus::Analyzed)?;
            t.advance(TaskStatus::Queued)?;
            Ok(t.clone())
        })?;
        self.state.enqueue(&task_id, priority);

        info!(
            "Queued task {} ({}, {}, {})",
            task_id,
            priority.as_str(),
            analysis.category.as_str(),
            language
        );

        if self.config.acknowledge && !queued.chat_id.is_empty() {
            let ack = OutgoingMessage::html(
                &queued.chat_id,
                MessageKind::Acknowledgment,
                format_ack(&queued),
            )
            .for_task(&task_id);
            if let Err(e) = self.notifier.send(ack).await {
                warn!("Acknowledgment for {} not sent: {}", task_id, e);
            }
        }

        Ok(task_id)
    }

    /// Bounded analyzer call; never fails
    async fn classify(&self, task_id: &str, request: &ClassificationRequest) -> TaskAnalysis {
        let timeout = self.config.classify_timeout;
        let result = match tokio::time::timeout(timeout, self.analyzer.classify(request)).await {
            Ok(Ok(analysis)) => analysis
                .validate()
                .map(|_| analysis)
                .map_err(AnalyzerError::Malformed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AnalyzerError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(analysis) => {
                debug!(
                    "Task {} classified by {} as {} ({:.2})",
                    task_id,
                    self.analyzer.name(),
                    analysis.category.as_str(),
                    analysis.confidence
                );
                self.sink.emit(
                    EventRecord::new(EventCategory::Classification, "classified")
                        .for_task(task_id)
                        .with_data(serde_json::to_value(&analysis).unwrap_or_default()),
                );
                analysis
            }
            Err(e) => {
                warn!("Classification degraded for {}: {}", task_id, e);
                self.sink.emit(
                    EventRecord::new(EventCategory::Classification, "classification degraded")
                        .for_task(task_id)
                        .with_level(EventLevel::Warn)
                        .with_data(serde_json::json!({"error": e.to_string()})),
                );
                TaskAnalysis::fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{KeywordAnalyzer, QualityRequest};
    use crate::channel::RecordingNotifier;
    use crate::events::MemoryEventSink;
    use crate::registry::AgentRegistry;
    use crate::task::{Complexity, TaskCategory, TaskKind};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Garbled;

    #[async_trait]
    impl Analyzer for Garbled {
        fn name(&self) -> &str {
            "garbled"
        }

        async fn classify(&self, _r: &ClassificationRequest) -> Result<TaskAnalysis, AnalyzerError> {
            crate::analyzer::parse_classification("{not json")
        }

        async fn assess_quality(&self, _r: &QualityRequest) -> Result<f64, AnalyzerError> {
            Err(AnalyzerError::Unavailable("offline".into()))
        }
    }

    fn intake(analyzer: Arc<dyn Analyzer>) -> (Arc<EngineState>, TaskIntake, Arc<RecordingNotifier>) {
        let state = Arc::new(EngineState::new(AgentRegistry::with_defaults()));
        let notifier = Arc::new(RecordingNotifier::new());
        let intake = TaskIntake::new(
            Arc::clone(&state),
            analyzer,
            notifier.clone(),
            Arc::new(MemoryEventSink::new()),
            IntakeConfig {
                classify_timeout: Duration::from_millis(100),
                ..IntakeConfig::default()
            },
        );
        (state, intake, notifier)
    }

    #[test]
    fn test_priority_keywords() {
        assert_eq!(detect_priority("urgent: analyze sales data for Q3"), Priority::Urgent);
        assert_eq!(detect_priority("important report please"), Priority::High);
        assert_eq!(detect_priority("do this later, no rush"), Priority::Low);
        assert_eq!(detect_priority("low priority cleanup"), Priority::Low);
        assert_eq!(detect_priority("high priority cleanup"), Priority::High);
        assert_eq!(detect_priority("urgent but whenever"), Priority::Urgent);
        assert_eq!(detect_priority("summarize this"), Priority::Medium);
        assert_eq!(detect_priority("긴급 매출 분석"), Priority::Urgent);
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(detect_language("매출 분석해줘", "en"), "ko");
        assert_eq!(detect_language("analyze sales", "en"), "en");
        assert_eq!(detect_language("analyze sales", "de"), "de");
    }

    #[test]
    fn test_validation() {
        assert!(validate_event(&IngestEvent::text("u", "c", "   ")).is_err());
        assert!(validate_event(&IngestEvent::attachment("u", "c", TaskKind::Voice, "f.ogg")).is_ok());
        assert!(validate_event(&IngestEvent::attachment("u", "c", TaskKind::Text, "f.ogg")).is_err());
    }

    #[tokio::test]
    async fn test_submit_queues_and_acknowledges() {
        let (state, intake, notifier) = intake(Arc::new(KeywordAnalyzer::new()));
        let id = intake
            .submit(IngestEvent::text("u1", "chat-1", "urgent: analyze sales data for Q3"))
            .await
            .unwrap();

        let task = state.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, Priority::Urgent);
        assert_eq!(task.analysis.unwrap().category, TaskCategory::DataAnalysis);
        assert_eq!(state.queue_depth(), 1);
        assert_eq!(notifier.messages_of(MessageKind::Acknowledgment).len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_analysis_falls_back() {
        let (state, intake, _) = intake(Arc::new(Garbled));
        let id = intake
            .submit(IngestEvent::text("u1", "chat-1", "analyze this"))
            .await
            .unwrap();
        let task = state.task(&id).unwrap();
        let analysis = task.analysis.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(analysis.category, TaskCategory::General);
        assert_eq!(analysis.complexity, Complexity::Medium);
        assert_eq!(analysis.confidence, 0.5);
        assert!(analysis.degraded);
    }

    #[tokio::test]
    async fn test_rejected_event_is_not_enqueued() {
        let (state, intake, notifier) = intake(Arc::new(KeywordAnalyzer::new()));
        let err = intake.submit(IngestEvent::text("u1", "c", "")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(state.queue_depth(), 0);
        assert_eq!(state.task_count(), 0);
        assert!(notifier.messages().is_empty());
    }
}
