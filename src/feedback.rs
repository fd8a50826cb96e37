//! Feedback Loop
//!
//! Closes the loop from task outcomes back into routing and operator visibility:
//! - satisfaction score per terminal task (heuristic, clamped to [1, 10])
//! - per-agent streaming statistics (`AgentEfficiencyRecord`, O(1) per update)
//! - agent efficiency and response time blended into the registry (the
//!   dispatcher only reads them)
//! - recurring error detection keyed by a normalized signature
//! - outcome / suggestion / summary notifications
//!
//! Everything here is advisory: errors are logged and never stop a tick.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{MessageKind, Notifier, OutgoingMessage};
use crate::config::{FeedbackConfig, SatisfactionWeights};
use crate::error::EngineResult;
use crate::events::{EventCategory, EventLevel, EventRecord, EventSink};
use crate::format::{
    format_complex_analysis, format_improvement_suggestion, format_outcome,
    format_recurring_error, format_summary,
};
use crate::state::EngineState;
use crate::task::{Complexity, Task, TaskId, TaskStatus};

/// Satisfaction heuristic for a terminal task
pub fn satisfaction(task: &Task, weights: &SatisfactionWeights) -> f64 {
    let mut score = if task.succeeded() {
        weights.success_base
    } else {
        weights.failure_base
    };

    let long_ms = weights.long_task_threshold.as_millis() as u64;
    if task.duration_ms.map(|d| d > long_ms).unwrap_or(false) {
        score -= weights.long_task_penalty;
    }
    if let Some(result) = &task.result {
        if task.complexity() == Complexity::High && !result.is_substantive() {
            score -= weights.shallow_result_penalty;
        }
        if result.quality_score > weights.high_quality_threshold {
            score += weights.high_quality_bonus;
        }
    }
    if task.status == TaskStatus::Completed && task.error.is_some() {
        score -= weights.explicit_error_penalty;
    }

    score.clamp(weights.min, weights.max)
}

static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"'[^']*'|"[^"]*"|`[^`]*`"#).expect("valid regex"));

static URLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("valid regex"));

static HEX_IDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-f]{8}(?:-[0-9a-f]{4}){3}-[0-9a-f]{12}\b").expect("valid regex"));

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

const SIGNATURE_MAX_CHARS: usize = 160;

/// Normalize an error message so variants of the same failure share a key
pub fn error_signature(error: &str) -> String {
    let lower = error.trim().to_lowercase();
    let s = QUOTED.replace_all(&lower, "*");
    let s = URLS.replace_all(&s, "<url>");
    let s = HEX_IDS.replace_all(&s, "<id>");
    let s = DIGITS.replace_all(&s, "#");
    let s = WHITESPACE.replace_all(&s, " ");
    s.chars().take(SIGNATURE_MAX_CHARS).collect()
}

/// Whether an error pattern at `count` crosses a suggestion threshold
pub fn crosses_threshold(count: u64, threshold: u64, step: u64) -> bool {
    count == threshold || (count > threshold && step > 0 && (count - threshold) % step == 0)
}

/// Per-agent running statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEfficiencyRecord {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub total_duration_ms: u64,
    /// Mean over all processed tasks
    pub average_satisfaction: f64,
    /// Mean over successful tasks only
    pub average_quality: f64,
}

impl AgentEfficiencyRecord {
    /// Streaming-mean update with one terminal task
    pub fn observe(&mut self, success: bool, duration_ms: u64, satisfaction: f64, quality: Option<f64>) {
        self.total_tasks += 1;
        self.total_duration_ms += duration_ms;
        self.average_satisfaction +=
            (satisfaction - self.average_satisfaction) / self.total_tasks as f64;
        if success {
            self.successful_tasks += 1;
            if let Some(quality) = quality {
                self.average_quality +=
                    (quality - self.average_quality) / self.successful_tasks as f64;
            }
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.successful_tasks as f64 / self.total_tasks as f64
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.total_tasks as f64
    }
}

/// Aggregation of failures sharing a normalized signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub signature: String,
    pub count: u64,
    pub affected_task_ids: Vec<TaskId>,
    pub affected_agents: BTreeSet<String>,
    pub last_occurrence: DateTime<Utc>,
}

impl ErrorPattern {
    const MAX_TRACKED_TASKS: usize = 50;

    fn new(signature: String) -> Self {
        Self {
            signature,
            count: 0,
            affected_task_ids: Vec::new(),
            affected_agents: BTreeSet::new(),
            last_occurrence: Utc::now(),
        }
    }

    fn record(&mut self, task_id: &str, agent: Option<&str>) {
        self.count += 1;
        self.affected_task_ids.push(task_id.to_string());
        if self.affected_task_ids.len() > Self::MAX_TRACKED_TASKS {
            self.affected_task_ids.remove(0);
        }
        if let Some(agent) = agent {
            self.affected_agents.insert(agent.to_string());
        }
        self.last_occurrence = Utc::now();
    }
}

/// Rolling performance aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub timed_out_tasks: u64,
    /// In [0, 1]
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub average_satisfaction: f64,
    pub top_agent: Option<String>,
}

/// Result of one monitoring tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub processed: usize,
    pub suggestions: usize,
}

#[derive(Default)]
struct Totals {
    tasks: u64,
    successful: u64,
    failed: u64,
    timed_out: u64,
    duration_sum_ms: u64,
    timed_tasks: u64,
    satisfaction_sum: f64,
}

#[derive(Default)]
struct FeedbackInner {
    processed: HashSet<TaskId>,
    records: HashMap<String, AgentEfficiencyRecord>,
    patterns: HashMap<String, ErrorPattern>,
    totals: Totals,
}

/// What processing one task produced
struct Processed {
    satisfaction: f64,
    crossed: Option<ErrorPattern>,
}

/// Observes terminal tasks and feeds results back
pub struct FeedbackLoop {
    state: Arc<EngineState>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn EventSink>,
    config: FeedbackConfig,
    inner: Mutex<FeedbackInner>,
}

impl FeedbackLoop {
    pub fn new(
        state: Arc<EngineState>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
        config: FeedbackConfig,
    ) -> Self {
        Self {
            state,
            notifier,
            sink,
            config,
            inner: Mutex::new(FeedbackInner::default()),
        }
    }

    /// Process every terminal task not seen before
    pub async fn tick(&self) -> FeedbackReport {
        // Lock order: task map before `inner` (see `Engine::sweep_tick`)
        let mut pending = self.state.tasks_where(|t| t.is_terminal());
        {
            let inner = self.inner.lock();
            pending.retain(|t| !inner.processed.contains(&t.id));
        }
        pending.sort_by(|a, b| a.end_time.cmp(&b.end_time).then_with(|| a.id.cmp(&b.id)));

        let mut report = FeedbackReport::default();
        for task in pending {
            if !self.inner.lock().processed.insert(task.id.clone()) {
                continue;
            }
            match self.process(&task) {
                Ok(processed) => {
                    report.processed += 1;
                    report.suggestions += self.notify(&task, processed).await;
                }
                Err(e) => warn!("Feedback for task {} failed: {}", task.id, e),
            }
        }
        report
    }

    /// Update statistics for one terminal task (no I/O)
    fn process(&self, task: &Task) -> EngineResult<Processed> {
        let score = satisfaction(task, &self.config.satisfaction);
        self.state.update_task(&task.id, |t| {
            t.satisfaction = Some(score);
            Ok(())
        })?;

        let agent = task
            .executing_agent
            .as_deref()
            .or(task.assigned_agent.as_deref());
        let duration_ms = task.duration_ms.unwrap_or(0);
        let quality = task.result.as_ref().map(|r| r.quality_score);
        let success = task.succeeded();

        let crossed = {
            let mut inner = self.inner.lock();
            let totals = &mut inner.totals;
            totals.tasks += 1;
            totals.satisfaction_sum += score;
            match task.status {
                TaskStatus::Completed => totals.successful += 1,
                TaskStatus::Timeout => totals.timed_out += 1,
                _ => totals.failed += 1,
            }
            if task.duration_ms.is_some() {
                totals.duration_sum_ms += duration_ms;
                totals.timed_tasks += 1;
            }

            if let Some(agent) = agent {
                inner
                    .records
                    .entry(agent.to_string())
                    .or_default()
                    .observe(success, duration_ms, score, quality);
            }

            match task.error.as_deref().filter(|_| !success) {
                Some(error) => {
                    let signature = error_signature(error);
                    let pattern = inner
                        .patterns
                        .entry(signature.clone())
                        .or_insert_with(|| ErrorPattern::new(signature));
                    pattern.record(&task.id, agent);
                    crosses_threshold(
                        pattern.count,
                        self.config.recurring_threshold,
                        self.config.recurring_step,
                    )
                    .then(|| pattern.clone())
                }
                None => None,
            }
        };

        if let Some(agent) = agent {
            let signal = if success {
                0.5 * quality.unwrap_or(0.0) + 0.5 * (score / 10.0)
            } else {
                0.0
            };
            let alpha = self.config.efficiency_alpha;
            let registry = self.state.registry();
            match registry.blend_efficiency(agent, signal, alpha) {
                Ok(efficiency) => debug!("Agent {} efficiency now {:.3}", agent, efficiency),
                Err(e) => warn!("Efficiency update skipped for {}: {}", agent, e),
            }
            if task.duration_ms.is_some() {
                if let Err(e) = registry.record_response_time(agent, duration_ms, alpha) {
                    warn!("Response time update skipped for {}: {}", agent, e);
                }
            }
        }

        if let Some(pattern) = &crossed {
            warn!(
                "Recurring error ({}x across {:?}): {}",
                pattern.count, pattern.affected_agents, pattern.signature
            );
            self.sink.emit(
                EventRecord::new(EventCategory::ErrorPattern, "recurring error threshold crossed")
                    .for_task(&task.id)
                    .with_level(EventLevel::Warn)
                    .with_data(serde_json::to_value(pattern).unwrap_or_default()),
            );
        }

        Ok(Processed {
            satisfaction: score,
            crossed,
        })
    }

    /// Send the messages one processed task calls for. Returns suggestions sent.
    async fn notify(&self, task: &Task, processed: Processed) -> usize {
        let mut messages = Vec::new();
        let mut suggestions = 0;
        let task_chat = (!task.chat_id.is_empty()).then_some(task.chat_id.as_str());

        if let Some(chat) = task_chat {
            let mut latest = task.clone();
            latest.satisfaction = Some(processed.satisfaction);
            if self.config.notify_outcomes {
                messages.push(OutgoingMessage::html(chat, MessageKind::Outcome, format_outcome(&latest)));
            }
            if processed.satisfaction < self.config.low_satisfaction_threshold {
                suggestions += 1;
                messages.push(OutgoingMessage::html(
                    chat,
                    MessageKind::ImprovementSuggestion,
                    format_improvement_suggestion(&latest, processed.satisfaction),
                ));
            }
            if task.complexity() == Complexity::High {
                messages.push(OutgoingMessage::html(
                    chat,
                    MessageKind::ComplexTaskAnalysis,
                    format_complex_analysis(&latest, processed.satisfaction),
                ));
            }
        }

        if let Some(pattern) = &processed.crossed {
            suggestions += 1;
            let operator = self.config.operator_chat_id.as_deref().or(task_chat);
            if let Some(chat) = operator {
                messages.push(OutgoingMessage::html(
                    chat,
                    MessageKind::RecurringError,
                    format_recurring_error(pattern),
                ));
            }
        }

        for message in messages {
            let kind = message.kind;
            if let Err(e) = self.notifier.send(message.for_task(&task.id)).await {
                warn!("{:?} notification for {} not sent: {}", kind, task.id, e);
            }
        }
        suggestions
    }

    /// Rolling aggregates
    pub fn summary(&self) -> PerformanceSummary {
        let inner = self.inner.lock();
        let totals = &inner.totals;
        let ratio = |num: f64, den: u64| if den == 0 { 0.0 } else { num / den as f64 };

        let top_agent = inner
            .records
            .iter()
            .filter(|(_, r)| r.total_tasks > 0)
            .max_by(|(a_name, a), (b_name, b)| {
                a.success_rate()
                    .partial_cmp(&b.success_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        a.average_satisfaction
                            .partial_cmp(&b.average_satisfaction)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.total_tasks.cmp(&b.total_tasks))
                    .then_with(|| b_name.cmp(a_name))
            })
            .map(|(name, _)| name.clone());

        PerformanceSummary {
            total_tasks: totals.tasks,
            successful_tasks: totals.successful,
            failed_tasks: totals.failed,
            timed_out_tasks: totals.timed_out,
            success_rate: ratio(totals.successful as f64, totals.tasks),
            average_response_time_ms: ratio(totals.duration_sum_ms as f64, totals.timed_tasks),
            average_satisfaction: ratio(totals.satisfaction_sum, totals.tasks),
            top_agent,
        }
    }

    /// Periodic summary: analytics record plus operator message
    pub async fn report_tick(&self) -> PerformanceSummary {
        let summary = self.summary();
        if summary.total_tasks == 0 {
            return summary;
        }

        info!(
            "Performance: {} tasks, {:.1}% success, avg satisfaction {:.1}",
            summary.total_tasks,
            summary.success_rate * 100.0,
            summary.average_satisfaction
        );
        self.sink.emit(
            EventRecord::new(EventCategory::Summary, "performance summary")
                .with_data(serde_json::to_value(&summary).unwrap_or_default()),
        );
        if let Some(chat) = self.config.operator_chat_id.as_deref() {
            let message = OutgoingMessage::html(chat, MessageKind::Summary, format_summary(&summary));
            if let Err(e) = self.notifier.send(message).await {
                warn!("Summary not sent: {}", e);
            }
        }
        summary
    }

    pub fn agent_record(&self, agent: &str) -> Option<AgentEfficiencyRecord> {
        self.inner.lock().records.get(agent).cloned()
    }

    pub fn error_patterns(&self) -> Vec<ErrorPattern> {
        let mut patterns: Vec<ErrorPattern> =
            self.inner.lock().patterns.values().cloned().collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.signature.cmp(&b.signature)));
        patterns
    }

    pub fn is_processed(&self, task_id: &str) -> bool {
        self.inner.lock().processed.contains(task_id)
    }

    /// Drop dedupe entries of purged tasks
    pub fn forget(&self, task_ids: &[TaskId]) {
        let mut inner = self.inner.lock();
        for id in task_ids {
            inner.processed.remove(id);
        }
    }
}
