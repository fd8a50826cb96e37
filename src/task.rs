//! Task Data Model
//!
//! A `Task` is one unit of user work moving through the pipeline:
//! `pending → analyzed → queued → dispatched → executing → {completed | failed | timeout}`.
//!
//! Terminal tasks always carry exactly one of `result` / `error`; a timeout
//! carries an error prefixed with [`TIMEOUT_ERROR_MARKER`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{EngineError, EngineResult};

/// Task identifier (`task_<millis>_<seq>`)
pub type TaskId = String;

/// Prefix placed on `Task.error` when an execution exceeds its time budget
pub const TIMEOUT_ERROR_MARKER: &str = "[timeout]";

static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a unique, roughly monotonic task id
pub fn next_task_id() -> TaskId {
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("task_{}_{}", Utc::now().timestamp_millis(), seq)
}

/// Kind of payload carried by the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Text,
    Voice,
    Document,
    Image,
    Command,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Document => "document",
            Self::Image => "image",
            Self::Command => "command",
        }
    }

    /// Kinds that may arrive as an attachment without any text
    pub fn is_attachment(&self) -> bool {
        matches!(self, Self::Voice | Self::Document | Self::Image)
    }
}

/// Scheduling priority (ordered: `Low < Medium < High < Urgent`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Analyzed,
    Queued,
    Dispatched,
    Executing,
    Completed,
    Failed,
    /// Reported to callers as a failure subtype
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzed => "analyzed",
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Whether `self → next` is a legal forward transition.
    ///
    /// Any non-terminal state may fail; timeouts only happen while executing.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Analyzed)
            | (Analyzed, Queued)
            | (Queued, Dispatched)
            | (Dispatched, Executing)
            | (Executing, Completed)
            | (Executing, Timeout) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Complexity estimate from the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" | "simple" => Some(Self::Low),
            "medium" | "moderate" => Some(Self::Medium),
            "high" | "complex" => Some(Self::High),
            _ => None,
        }
    }
}

/// Classified task category, used for agent matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskCategory {
    DataAnalysis,
    WebSearch,
    DataTransform,
    Automation,
    FileManagement,
    Voice,
    Image,
    General,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataAnalysis => "data-analysis",
            Self::WebSearch => "web-search",
            Self::DataTransform => "data-transform",
            Self::Automation => "automation",
            Self::FileManagement => "file-management",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::General => "general",
        }
    }

    /// Lenient parse accepting the spellings analyzers commonly return
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "data-analysis" | "analysis" | "analytics" => Some(Self::DataAnalysis),
            "web-search" | "web" | "search" | "web-fetch" => Some(Self::WebSearch),
            "data-transform" | "transform" | "conversion" => Some(Self::DataTransform),
            "automation" | "workflow" => Some(Self::Automation),
            "file-management" | "file" | "files" | "file-ops" => Some(Self::FileManagement),
            "voice" | "audio" | "speech" => Some(Self::Voice),
            "image" | "vision" => Some(Self::Image),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

/// Structured classification of a task, set once at intake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub intent: String,
    pub category: TaskCategory,
    pub complexity: Complexity,
    pub required_capabilities: BTreeSet<String>,
    pub estimated_duration_secs: u64,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    /// True when the analyzer failed and this is the deterministic default
    #[serde(default)]
    pub degraded: bool,
}

impl TaskAnalysis {
    /// Capability tag required by the default analysis
    pub const DEFAULT_CAPABILITY: &'static str = "general-analysis";

    /// Deterministic fallback used whenever the analyzer is unavailable or malformed
    pub fn fallback() -> Self {
        Self {
            intent: "general request".to_string(),
            category: TaskCategory::General,
            complexity: Complexity::Medium,
            required_capabilities: BTreeSet::from([Self::DEFAULT_CAPABILITY.to_string()]),
            estimated_duration_secs: 30,
            confidence: 0.5,
            degraded: true,
        }
    }

    /// Check the classification contract
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.required_capabilities.is_empty() {
            return Err("no required capabilities".to_string());
        }
        if self.required_capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err("empty capability tag".to_string());
        }
        Ok(())
    }
}

/// Output of a capability handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub success: bool,
    pub message: String,
    pub data: serde_json::Value,
    /// Quality estimate in [0, 1]
    pub quality_score: f64,
}

impl TaskOutput {
    pub fn success(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            quality_score: 0.0,
        }
    }

    /// Whether the output carries a substantive payload
    pub fn is_substantive(&self) -> bool {
        let data_empty = match &self.data {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.trim().is_empty(),
            serde_json::Value::Array(a) => a.is_empty(),
            serde_json::Value::Object(o) => o.is_empty(),
            _ => false,
        };
        !data_empty || self.message.trim().len() >= 40
    }
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    /// Attachment reference (file id or URL) for voice/document/image kinds
    pub media_url: Option<String>,
    pub kind: TaskKind,
    pub language: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub analysis: Option<TaskAnalysis>,
    /// Optional restriction of candidate agents
    #[serde(default)]
    pub required_agents: Vec<String>,
    pub assigned_agent: Option<String>,
    pub executing_agent: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<TaskOutput>,
    pub error: Option<String>,
    /// Satisfaction score in [1, 10], set by the feedback loop
    pub satisfaction: Option<f64>,
}

impl Task {
    /// Create a pending task
    pub fn new(kind: TaskKind, content: &str) -> Self {
        Self {
            id: next_task_id(),
            sender_id: String::new(),
            chat_id: String::new(),
            content: content.to_string(),
            media_url: None,
            kind,
            language: "en".to_string(),
            priority: Priority::Medium,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            analysis: None,
            required_agents: Vec::new(),
            assigned_agent: None,
            executing_agent: None,
            start_time: None,
            end_time: None,
            duration_ms: None,
            result: None,
            error: None,
            satisfaction: None,
        }
    }

    /// Set origin of the task
    pub fn with_origin(mut self, sender_id: &str, chat_id: &str) -> Self {
        self.sender_id = sender_id.to_string();
        self.chat_id = chat_id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn with_analysis(mut self, analysis: TaskAnalysis) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// Move to a non-terminal state, enforcing the state machine
    pub fn advance(&mut self, next: TaskStatus) -> EngineResult<()> {
        if next.is_terminal() {
            return Err(EngineError::InvariantViolation(format!(
                "terminal state {} must be set through complete/fail/time_out",
                next.as_str()
            )));
        }
        self.transition(next)
    }

    fn transition(&mut self, next: TaskStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvariantViolation(format!(
                "task {}: illegal transition {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    fn stamp_end(&mut self) {
        let end = Utc::now();
        self.end_time = Some(end);
        if let Some(start) = self.start_time {
            self.duration_ms = Some((end - start).num_milliseconds().max(0) as u64);
        }
    }

    /// Terminal success
    pub fn complete(&mut self, output: TaskOutput) -> EngineResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(output);
        self.error = None;
        self.stamp_end();
        Ok(())
    }

    /// Terminal failure
    pub fn fail(&mut self, error: impl Into<String>) -> EngineResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.result = None;
        self.error = Some(error.into());
        self.stamp_end();
        Ok(())
    }

    /// Terminal timeout: carries an error with [`TIMEOUT_ERROR_MARKER`]
    pub fn time_out(&mut self, limit_ms: u64) -> EngineResult<()> {
        self.transition(TaskStatus::Timeout)?;
        self.result = None;
        self.error = Some(format!(
            "{} execution exceeded its {} ms budget",
            TIMEOUT_ERROR_MARKER, limit_ms
        ));
        self.stamp_end();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_timeout(&self) -> bool {
        self.status == TaskStatus::Timeout
            || self
                .error
                .as_deref()
                .map(|e| e.starts_with(TIMEOUT_ERROR_MARKER))
                .unwrap_or(false)
    }

    /// Terminal exclusivity: exactly one of result / error, matching the status
    pub fn outcome_consistent(&self) -> bool {
        match self.status {
            TaskStatus::Completed => self.result.is_some() && self.error.is_none(),
            TaskStatus::Failed => self.result.is_none() && self.error.is_some(),
            TaskStatus::Timeout => self.result.is_none() && self.is_timeout(),
            _ => self.result.is_none() && self.error.is_none(),
        }
    }

    pub fn complexity(&self) -> Complexity {
        self.analysis
            .as_ref()
            .map(|a| a.complexity)
            .unwrap_or(Complexity::Medium)
    }
}
