//! Channel Definitions
//!
//! Interface to the external chat channel:
//! - `IngestEvent`: one raw user message delivered to the engine
//! - `Notifier`: sends acknowledgments, results and operator messages back
//!
//! The chat platform itself lives outside the engine; `ConsoleNotifier` and
//! `RecordingNotifier` are the in-tree implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::task::TaskKind;

/// Error types for channel operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Channel not ready")]
    NotReady,
}

/// Raw event delivered by the ingestion channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub sender_id: String,
    /// Chat/conversation the reply goes to
    pub chat_id: String,
    pub kind: TaskKind,
    /// Text content or caption
    pub payload: String,
    /// Attachment reference (file id or URL)
    pub media_url: Option<String>,
    /// Free-form hint passed through to the analyzer
    pub user_hint: Option<String>,
    /// Restrict scheduling to these agents
    #[serde(default)]
    pub required_agents: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl IngestEvent {
    /// Create a simple text event
    pub fn text(sender_id: &str, chat_id: &str, payload: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            kind: TaskKind::Text,
            payload: payload.to_string(),
            media_url: None,
            user_hint: None,
            required_agents: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create an attachment event (voice, document, image)
    pub fn attachment(sender_id: &str, chat_id: &str, kind: TaskKind, media_url: &str) -> Self {
        Self {
            kind,
            media_url: Some(media_url.to_string()),
            ..Self::text(sender_id, chat_id, "")
        }
    }

    /// Create a command event (`/status`, ...)
    pub fn command(sender_id: &str, chat_id: &str, command: &str) -> Self {
        Self {
            kind: TaskKind::Command,
            ..Self::text(sender_id, chat_id, command)
        }
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.user_hint = Some(hint.to_string());
        self
    }

    pub fn with_required_agents(mut self, agents: &[&str]) -> Self {
        self.required_agents = agents.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_caption(mut self, caption: &str) -> Self {
        self.payload = caption.to_string();
        self
    }
}

/// Parse mode for message formatting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    #[default]
    Html,
    Markdown,
    Plain,
}

/// What the outgoing message is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Acknowledgment,
    Outcome,
    ImprovementSuggestion,
    ComplexTaskAnalysis,
    RecurringError,
    Summary,
    Status,
}

/// Message sent back through the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub content: String,
    pub parse_mode: ParseMode,
    pub kind: MessageKind,
    pub task_id: Option<String>,
}

impl OutgoingMessage {
    pub fn html(chat_id: &str, kind: MessageKind, content: String) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            content,
            parse_mode: ParseMode::Html,
            kind,
            task_id: None,
        }
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}

/// Notification collaborator
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name identifier
    fn name(&self) -> &str;

    async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError>;
}

/// Prints messages to stdout (local runs)
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
        if message.chat_id.is_empty() {
            return Err(ChannelError::InvalidRecipient("empty chat id".into()));
        }
        println!("[{}] {}", message.chat_id, message.content);
        Ok(())
    }
}

/// Keeps every sent message in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().clone()
    }

    pub fn messages_of(&self, kind: MessageKind) -> Vec<OutgoingMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
        self.sent.lock().push(message);
        Ok(())
    }
}
