//! Engine error taxonomy
//!
//! Errors are split by the seam they cross:
//! - `EngineError`: synchronous failures of intake, registry and scheduler calls
//! - `AnalyzerError`: classifier / quality-estimator failures (always degraded, never propagated)
//! - `HandlerError`: capability handler failures (turned into failed tasks)

use thiserror::Error;

/// Errors raised by engine components
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Malformed intake event, rejected before enqueue
    #[error("validation failed: {0}")]
    Validation(String),

    /// Registry safety net: load increment past `max_concurrency`
    #[error("agent '{agent}' is at capacity ({max_concurrency})")]
    CapacityExceeded { agent: String, max_concurrency: usize },

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Programming error, e.g. dispatching a task without analysis
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Load decrement on an agent that has nothing in flight
    #[error("load underflow on agent '{0}'")]
    LoadUnderflow(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias for engine results
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures of the external analyzer collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalyzerError {
    #[error("analyzer timed out after {0} ms")]
    Timeout(u64),

    #[error("analyzer unavailable: {0}")]
    Unavailable(String),

    /// Response did not match the classification or quality contract
    #[error("malformed analyzer response: {0}")]
    Malformed(String),
}

/// Failures raised by a capability handler
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for HandlerError {
    fn from(e: reqwest::Error) -> Self {
        HandlerError::Failed(format!("HTTP request failed: {}", e))
    }
}
