//! Configuration management
//!
//! Defaults are tuned for a single-operator deployment. Values can be
//! overridden from a TOML file (`AUTOPILOT_CONFIG`) and environment variables.
//! Durations are written in milliseconds in TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EngineError;
use crate::registry::{default_agents, AgentSpec, CapabilityClass};

/// Serde adapter: `Duration` <-> integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Coefficients of the additive dispatch score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub base: f64,
    /// Multiplied by `load / max_concurrency` and subtracted
    pub load_penalty: f64,
    /// Added when the agent's class matches the task category
    pub class_match: f64,
    /// Multiplied by the agent's effective efficiency
    pub efficiency: f64,
    pub fast_response: f64,
    pub fast_response_threshold_ms: u64,
    pub language_match: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base: 100.0,
            load_penalty: 40.0,
            class_match: 30.0,
            efficiency: 20.0,
            fast_response: 10.0,
            fast_response_threshold_ms: 3000,
            language_match: 15.0,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    #[serde(with = "duration_ms")]
    pub rebalance_interval: Duration,
    /// `load / max` above which an agent is considered overloaded
    pub overload_ratio: f64,
    /// `load / max` below which an agent is considered underloaded
    pub underload_ratio: f64,
    /// Efficiency penalty applied to overloaded agents
    pub overload_penalty: f64,
    /// Window over which the penalty decays to zero
    #[serde(with = "duration_ms")]
    pub penalty_window: Duration,
    /// Global soft ceiling on in-flight executions
    pub max_in_flight: usize,
    pub weights: ScoringWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            rebalance_interval: Duration::from_secs(30),
            overload_ratio: 0.8,
            underload_ratio: 0.3,
            overload_penalty: 0.25,
            penalty_window: Duration::from_secs(60),
            max_in_flight: 32,
            weights: ScoringWeights::default(),
        }
    }
}

/// Per-capability-class execution budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassTimeouts {
    #[serde(with = "duration_ms")]
    pub analysis: Duration,
    #[serde(with = "duration_ms")]
    pub web_fetch: Duration,
    #[serde(with = "duration_ms")]
    pub data_transform: Duration,
    #[serde(with = "duration_ms")]
    pub automation: Duration,
    #[serde(with = "duration_ms")]
    pub file_ops: Duration,
    #[serde(with = "duration_ms")]
    pub voice: Duration,
    #[serde(with = "duration_ms")]
    pub image: Duration,
}

impl ClassTimeouts {
    pub fn for_class(&self, class: CapabilityClass) -> Duration {
        match class {
            CapabilityClass::Analysis => self.analysis,
            CapabilityClass::WebFetch => self.web_fetch,
            CapabilityClass::DataTransform => self.data_transform,
            CapabilityClass::Automation => self.automation,
            CapabilityClass::FileOps => self.file_ops,
            CapabilityClass::Voice => self.voice,
            CapabilityClass::Image => self.image,
        }
    }

    /// Same budget for every class (handy in tests)
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            analysis: timeout,
            web_fetch: timeout,
            data_transform: timeout,
            automation: timeout,
            file_ops: timeout,
            voice: timeout,
            image: timeout,
        }
    }
}

impl Default for ClassTimeouts {
    fn default() -> Self {
        Self {
            analysis: Duration::from_secs(60),
            web_fetch: Duration::from_secs(30),
            data_transform: Duration::from_secs(45),
            automation: Duration::from_secs(120),
            file_ops: Duration::from_secs(30),
            voice: Duration::from_secs(90),
            image: Duration::from_secs(90),
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeouts: ClassTimeouts,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Extra slack before the sweep reaps an execution
    #[serde(with = "duration_ms")]
    pub sweep_grace: Duration,
    /// How long terminal executions are kept before garbage collection
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    #[serde(with = "duration_ms")]
    pub quality_timeout: Duration,
    /// Quality used when the estimate is unavailable
    pub default_quality: f64,
    /// Root directory the file-ops handler is confined to
    pub workspace_root: PathBuf,
    /// Maximum bytes read per fetched page
    pub max_fetch_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeouts: ClassTimeouts::default(),
            sweep_interval: Duration::from_secs(5),
            sweep_grace: Duration::from_secs(1),
            retention: Duration::from_secs(600),
            quality_timeout: Duration::from_secs(10),
            default_quality: 0.7,
            workspace_root: PathBuf::from("."),
            max_fetch_bytes: 512 * 1024,
        }
    }
}

/// Intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    #[serde(with = "duration_ms")]
    pub classify_timeout: Duration,
    pub default_language: String,
    /// Send an acknowledgment message for each accepted task
    pub acknowledge: bool,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            classify_timeout: Duration::from_secs(15),
            default_language: "en".to_string(),
            acknowledge: true,
        }
    }
}

/// Coefficients of the satisfaction heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SatisfactionWeights {
    pub success_base: f64,
    pub failure_base: f64,
    #[serde(with = "duration_ms")]
    pub long_task_threshold: Duration,
    pub long_task_penalty: f64,
    /// Applied to high-complexity tasks whose result has no substantive payload
    pub shallow_result_penalty: f64,
    pub high_quality_threshold: f64,
    pub high_quality_bonus: f64,
    /// Applied when a nominally completed task still carries an error
    pub explicit_error_penalty: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for SatisfactionWeights {
    fn default() -> Self {
        Self {
            success_base: 8.0,
            failure_base: 2.0,
            long_task_threshold: Duration::from_secs(30),
            long_task_penalty: 2.0,
            shallow_result_penalty: 1.0,
            high_quality_threshold: 0.9,
            high_quality_bonus: 1.0,
            explicit_error_penalty: 3.0,
            min: 1.0,
            max: 10.0,
        }
    }
}

/// Feedback loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    #[serde(with = "duration_ms")]
    pub monitor_interval: Duration,
    #[serde(with = "duration_ms")]
    pub report_interval: Duration,
    pub satisfaction: SatisfactionWeights,
    /// Satisfaction below this triggers an improvement suggestion
    pub low_satisfaction_threshold: f64,
    /// First error-pattern count that emits a recurring-error suggestion
    pub recurring_threshold: u64,
    /// Further suggestions every `recurring_step` occurrences after the threshold
    pub recurring_step: u64,
    /// Exponential factor for efficiency / response-time updates
    pub efficiency_alpha: f64,
    /// Chat receiving operator-facing suggestions and summaries
    pub operator_chat_id: Option<String>,
    pub notify_outcomes: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            report_interval: Duration::from_secs(300),
            satisfaction: SatisfactionWeights::default(),
            low_satisfaction_threshold: 5.0,
            recurring_threshold: 3,
            recurring_step: 2,
            efficiency_alpha: 0.2,
            operator_chat_id: None,
            notify_outcomes: true,
        }
    }
}

/// Analyzer selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Ollama-compatible endpoint; keyword analyzer is used when absent
    pub ollama_url: Option<String>,
    pub model: String,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            ollama_url: None,
            model: "llama3.2:3b".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub intake: IntakeConfig,
    pub feedback: FeedbackConfig,
    pub analyzer: AnalyzerConfig,
    /// Append-only JSONL analytics log
    pub event_log_path: Option<PathBuf>,
    pub agents: Vec<AgentSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            intake: IntakeConfig::default(),
            feedback: FeedbackConfig::default(),
            analyzer: AnalyzerConfig::default(),
            event_log_path: None,
            agents: default_agents(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("Failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `AUTOPILOT_CONFIG` (optional) and environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("AUTOPILOT_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                Self::from_toml_str(&raw)?
            }
            Err(_) => Self::default(),
        };

        if let Ok(url) = std::env::var("OLLAMA_URL") {
            config.analyzer.ollama_url = Some(url);
        }
        if let Ok(model) = std::env::var("AUTOPILOT_ANALYZER_MODEL") {
            config.analyzer.model = model;
        }
        if let Ok(path) = std::env::var("AUTOPILOT_EVENT_LOG") {
            config.event_log_path = Some(PathBuf::from(path));
        }
        if let Ok(chat) = std::env::var("AUTOPILOT_OPERATOR_CHAT") {
            config.feedback.operator_chat_id = Some(chat);
        }
        if let Ok(root) = std::env::var("AUTOPILOT_WORKSPACE") {
            config.executor.workspace_root = PathBuf::from(root);
        }
        if let Ok(lang) = std::env::var("AUTOPILOT_DEFAULT_LANGUAGE") {
            config.intake.default_language = lang;
        }
        config.scheduler.max_in_flight = std::env::var("AUTOPILOT_MAX_IN_FLIGHT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.scheduler.max_in_flight);

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break engine invariants
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.agents.is_empty() {
            return Err(EngineError::Config("at least one agent is required".into()));
        }
        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.max_concurrency == 0 {
                return Err(EngineError::Config(format!(
                    "agent '{}' has max_concurrency 0",
                    agent.name
                )));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(EngineError::Config(format!("duplicate agent '{}'", agent.name)));
            }
        }
        let s = &self.scheduler;
        if !(0.0..=1.0).contains(&s.underload_ratio)
            || !(0.0..=1.0).contains(&s.overload_ratio)
            || s.underload_ratio >= s.overload_ratio
        {
            return Err(EngineError::Config(
                "expected 0 <= underload_ratio < overload_ratio <= 1".into(),
            ));
        }
        if s.max_in_flight == 0 {
            return Err(EngineError::Config("max_in_flight must be positive".into()));
        }
        let f = &self.feedback;
        if f.recurring_threshold == 0 || f.recurring_step == 0 {
            return Err(EngineError::Config(
                "recurring_threshold and recurring_step must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&f.efficiency_alpha) {
            return Err(EngineError::Config("efficiency_alpha must be in [0, 1]".into()));
        }
        if f.satisfaction.min > f.satisfaction.max {
            return Err(EngineError::Config("satisfaction min exceeds max".into()));
        }
        Ok(())
    }
}
