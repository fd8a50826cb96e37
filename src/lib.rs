//! Autopilot Orchestration Engine
//!
//! Takes chat-style requests, classifies them, routes each one to the best
//! capability agent, runs it under a per-class time budget and feeds the
//! outcome back into routing.
//!
//! # Features
//!
//! - **Task Intake**: keyword priority, script-based language detection,
//!   bounded classification with a deterministic fallback
//! - **Agent Registry**: atomic check-and-increment load accounting
//! - **Dispatcher**: additive dispatch score, strict priority + FIFO ordering,
//!   periodic rebalance penalties
//! - **Executor**: one handler per capability class, timeouts, panic capture,
//!   overdue-execution sweep
//! - **Feedback Loop**: satisfaction scores, streaming agent statistics,
//!   recurring error detection, summaries
//!
//! # Architecture
//!
//! ```text
//! IngestEvent ──► Intake ──► queue ──► Dispatcher ──► Executor ──► handler
//!                   │                      │              │
//!                   └── Analyzer           └── Registry ◄─┘ (load)
//!                                              ▲
//!                         Feedback Loop ───────┘ (efficiency, latency)
//!                              │
//!                              └── Notifier / EventSink
//! ```

pub mod analyzer;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod feedback;
pub mod format;
pub mod intake;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod task;

pub use analyzer::{Analyzer, ClassificationRequest, KeywordAnalyzer, OllamaAnalyzer, QualityRequest};
pub use channel::{ConsoleNotifier, IngestEvent, MessageKind, Notifier, OutgoingMessage, RecordingNotifier};
pub use config::EngineConfig;
pub use engine::{AgentStatusRow, Engine, EngineHandle, EngineSnapshot};
pub use error::{AnalyzerError, EngineError, EngineResult, HandlerError};
pub use events::{EventCategory, EventRecord, EventSink, JsonlEventSink, MemoryEventSink, NullEventSink};
pub use executor::{CapabilityHandler, Execution, ExecutionReport, ExecutionStatus, Executor, HandlerContext, HandlerRegistry};
pub use feedback::{AgentEfficiencyRecord, ErrorPattern, FeedbackLoop, PerformanceSummary};
pub use registry::{Agent, AgentRegistry, AgentSpec, AgentStatus, CapabilityClass};
pub use scheduler::{Dispatch, Dispatcher};
pub use state::EngineState;
pub use task::{Complexity, Priority, Task, TaskAnalysis, TaskCategory, TaskId, TaskKind, TaskOutput, TaskStatus};
