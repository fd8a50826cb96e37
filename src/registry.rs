//! Agent Registry
//!
//! Catalog of capability providers plus their live load.
//!
//! - Static part (`AgentSpec`): name, class, capability tags, capacity, languages
//! - Live part: online flag, in-flight load, efficiency, response time, transient penalty
//!
//! `load` is the only resource contended across concurrent executions. It is
//! changed with atomic check-and-increment / check-and-decrement so the
//! `0 <= load <= max_concurrency` invariant holds under concurrent dispatch.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// Category of work an agent performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityClass {
    Analysis,
    WebFetch,
    DataTransform,
    Automation,
    FileOps,
    Voice,
    Image,
}

impl CapabilityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::WebFetch => "web-fetch",
            Self::DataTransform => "data-transform",
            Self::Automation => "automation",
            Self::FileOps => "file-ops",
            Self::Voice => "voice",
            Self::Image => "image",
        }
    }

    pub fn all() -> &'static [CapabilityClass] {
        &[
            Self::Analysis,
            Self::WebFetch,
            Self::DataTransform,
            Self::Automation,
            Self::FileOps,
            Self::Voice,
            Self::Image,
        ]
    }
}

/// Agent availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_efficiency() -> f64 {
    0.8
}

fn default_response_time() -> u64 {
    2000
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_status() -> AgentStatus {
    AgentStatus::Online
}

/// Static description of an agent (configurable from TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub capability_class: CapabilityClass,
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Initial efficiency in [0, 1]
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    #[serde(default = "default_response_time")]
    pub average_response_time_ms: u64,
    #[serde(default = "default_languages")]
    pub supported_languages: Vec<String>,
    #[serde(default = "default_status")]
    pub status: AgentStatus,
}

impl AgentSpec {
    pub fn new(name: &str, class: CapabilityClass, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            capability_class: class,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_concurrency: default_max_concurrency(),
            efficiency: default_efficiency(),
            average_response_time_ms: default_response_time(),
            supported_languages: default_languages(),
            status: AgentStatus::Online,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.average_response_time_ms = ms;
        self
    }

    pub fn with_languages(mut self, languages: &[&str]) -> Self {
        self.supported_languages = languages.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_efficiency(mut self, efficiency: f64) -> Self {
        self.efficiency = efficiency.clamp(0.0, 1.0);
        self
    }
}

/// The built-in agent table, one agent per capability class
pub fn default_agents() -> Vec<AgentSpec> {
    vec![
        AgentSpec::new(
            "data-analyst",
            CapabilityClass::Analysis,
            &["general-analysis", "data-analysis", "statistics", "reporting", "summarization"],
        )
        .with_max_concurrency(3)
        .with_response_time(2500)
        .with_languages(&["en", "ko"]),
        AgentSpec::new(
            "web-fetcher",
            CapabilityClass::WebFetch,
            &["web-fetch", "web-search", "scraping"],
        )
        .with_max_concurrency(4)
        .with_response_time(4000)
        .with_languages(&["en", "ko"]),
        AgentSpec::new(
            "data-transformer",
            CapabilityClass::DataTransform,
            &["data-transform", "format-conversion", "csv", "json"],
        )
        .with_max_concurrency(3)
        .with_response_time(1500),
        AgentSpec::new(
            "automator",
            CapabilityClass::Automation,
            &["automation", "workflow", "scheduling", "general-analysis"],
        )
        .with_max_concurrency(2)
        .with_response_time(5000)
        .with_languages(&["en", "ko"]),
        AgentSpec::new(
            "file-manager",
            CapabilityClass::FileOps,
            &["file-ops", "file-management", "document"],
        )
        .with_max_concurrency(3)
        .with_response_time(1000),
        AgentSpec::new(
            "voice-processor",
            CapabilityClass::Voice,
            &["voice", "transcription", "speech"],
        )
        .with_max_concurrency(2)
        .with_response_time(6000)
        .with_languages(&["en", "ko"]),
        AgentSpec::new(
            "image-processor",
            CapabilityClass::Image,
            &["image", "vision", "ocr"],
        )
        .with_max_concurrency(2)
        .with_response_time(6000),
    ]
}

/// Transient efficiency penalty that decays linearly to zero
#[derive(Debug, Clone, Copy)]
struct Penalty {
    amount: f64,
    applied_at: Instant,
    window: Duration,
}

impl Penalty {
    fn current(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.applied_at);
        if elapsed >= self.window || self.window.is_zero() {
            return 0.0;
        }
        let remaining = 1.0 - elapsed.as_secs_f64() / self.window.as_secs_f64();
        self.amount * remaining
    }
}

#[derive(Debug)]
struct LiveStats {
    efficiency: f64,
    average_response_time_ms: f64,
    penalty: Option<Penalty>,
}

struct AgentSlot {
    spec: AgentSpec,
    online: AtomicBool,
    load: AtomicUsize,
    stats: Mutex<LiveStats>,
}

impl AgentSlot {
    fn new(spec: AgentSpec) -> Self {
        let online = spec.status == AgentStatus::Online;
        let stats = LiveStats {
            efficiency: spec.efficiency.clamp(0.0, 1.0),
            average_response_time_ms: spec.average_response_time_ms as f64,
            penalty: None,
        };
        Self {
            spec,
            online: AtomicBool::new(online),
            load: AtomicUsize::new(0),
            stats: Mutex::new(stats),
        }
    }

    fn snapshot(&self, now: Instant) -> Agent {
        let stats = self.stats.lock();
        let penalty = stats.penalty.map(|p| p.current(now)).unwrap_or(0.0);
        Agent {
            name: self.spec.name.clone(),
            capability_class: self.spec.capability_class,
            capabilities: self.spec.capabilities.clone(),
            status: if self.online.load(Ordering::Acquire) {
                AgentStatus::Online
            } else {
                AgentStatus::Offline
            },
            load: self.load.load(Ordering::Acquire),
            max_concurrency: self.spec.max_concurrency,
            efficiency: stats.efficiency,
            effective_efficiency: (stats.efficiency - penalty).clamp(0.0, 1.0),
            average_response_time_ms: stats.average_response_time_ms.round() as u64,
            supported_languages: self.spec.supported_languages.clone(),
        }
    }
}

/// Point-in-time view of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub capability_class: CapabilityClass,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub load: usize,
    pub max_concurrency: usize,
    /// Learned efficiency in [0, 1]
    pub efficiency: f64,
    /// Efficiency minus any active rebalancing penalty
    pub effective_efficiency: f64,
    pub average_response_time_ms: u64,
    pub supported_languages: Vec<String>,
}

impl Agent {
    /// Online and below capacity
    pub fn is_eligible(&self) -> bool {
        self.status == AgentStatus::Online && self.load < self.max_concurrency
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 1.0;
        }
        self.load as f64 / self.max_concurrency as f64
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.supported_languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }
}

/// Registry of agents and their live load
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<AgentSlot>>>,
}

impl AgentRegistry {
    pub fn new(specs: Vec<AgentSpec>) -> Self {
        let agents = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), Arc::new(AgentSlot::new(spec))))
            .collect();
        Self {
            agents: RwLock::new(agents),
        }
    }

    /// Registry with the built-in agent table
    pub fn with_defaults() -> Self {
        Self::new(default_agents())
    }

    fn slot(&self, name: &str) -> EngineResult<Arc<AgentSlot>> {
        self.agents
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::AgentNotFound(name.to_string()))
    }

    /// Add or replace an agent at runtime. A replaced agent keeps no load.
    pub fn register(&self, spec: AgentSpec) -> EngineResult<()> {
        if spec.max_concurrency == 0 {
            return Err(EngineError::Config(format!(
                "agent '{}' has max_concurrency 0",
                spec.name
            )));
        }
        let mut agents = self.agents.write();
        if let Some(existing) = agents.get(&spec.name) {
            if existing.load.load(Ordering::Acquire) > 0 {
                return Err(EngineError::InvariantViolation(format!(
                    "cannot replace agent '{}' while it has work in flight",
                    spec.name
                )));
            }
        }
        info!("Registered agent {} ({})", spec.name, spec.capability_class.as_str());
        agents.insert(spec.name.clone(), Arc::new(AgentSlot::new(spec)));
        Ok(())
    }

    /// All agents, alphabetically by name
    pub fn list(&self) -> Vec<Agent> {
        let now = Instant::now();
        self.agents.read().values().map(|s| s.snapshot(now)).collect()
    }

    pub fn get(&self, name: &str) -> EngineResult<Agent> {
        Ok(self.slot(name)?.snapshot(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Atomically check capacity and take one slot. Returns the new load.
    pub fn increment_load(&self, name: &str) -> EngineResult<usize> {
        let slot = self.slot(name)?;
        let max = slot.spec.max_concurrency;
        slot.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| EngineError::CapacityExceeded {
                agent: name.to_string(),
                max_concurrency: max,
            })
    }

    /// Release one slot. Returns the new load.
    pub fn decrement_load(&self, name: &str) -> EngineResult<usize> {
        let slot = self.slot(name)?;
        slot.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .map(|previous| previous - 1)
            .map_err(|_| EngineError::LoadUnderflow(name.to_string()))
    }

    pub fn set_status(&self, name: &str, status: AgentStatus) -> EngineResult<()> {
        let slot = self.slot(name)?;
        let online = status == AgentStatus::Online;
        if slot.online.swap(online, Ordering::AcqRel) != online {
            info!("Agent {} is now {:?}", name, status);
        }
        Ok(())
    }

    /// Sum of in-flight work across agents
    pub fn total_load(&self) -> usize {
        self.agents
            .read()
            .values()
            .map(|s| s.load.load(Ordering::Acquire))
            .sum()
    }

    pub fn set_efficiency(&self, name: &str, efficiency: f64) -> EngineResult<()> {
        let slot = self.slot(name)?;
        slot.stats.lock().efficiency = efficiency.clamp(0.0, 1.0);
        Ok(())
    }

    /// Exponential update `e = (1 - alpha) * e + alpha * signal`. Returns the new value.
    pub fn blend_efficiency(&self, name: &str, signal: f64, alpha: f64) -> EngineResult<f64> {
        let slot = self.slot(name)?;
        let mut stats = slot.stats.lock();
        let signal = signal.clamp(0.0, 1.0);
        stats.efficiency = ((1.0 - alpha) * stats.efficiency + alpha * signal).clamp(0.0, 1.0);
        Ok(stats.efficiency)
    }

    /// Exponential update of the observed response time
    pub fn record_response_time(&self, name: &str, millis: u64, alpha: f64) -> EngineResult<u64> {
        let slot = self.slot(name)?;
        let mut stats = slot.stats.lock();
        stats.average_response_time_ms =
            (1.0 - alpha) * stats.average_response_time_ms + alpha * millis as f64;
        Ok(stats.average_response_time_ms.round() as u64)
    }

    /// Depress the agent's effective efficiency for `window`, decaying linearly
    pub fn apply_penalty(&self, name: &str, amount: f64, window: Duration) -> EngineResult<()> {
        let slot = self.slot(name)?;
        slot.stats.lock().penalty = Some(Penalty {
            amount: amount.max(0.0),
            applied_at: Instant::now(),
            window,
        });
        debug!("Applied {:.2} efficiency penalty to {} for {:?}", amount, name, window);
        Ok(())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_registry() -> AgentRegistry {
        AgentRegistry::new(vec![
            AgentSpec::new("alpha", CapabilityClass::Analysis, &["general-analysis"])
                .with_max_concurrency(2),
        ])
    }

    #[test]
    fn test_default_table_covers_every_class() {
        let registry = AgentRegistry::with_defaults();
        for class in CapabilityClass::all() {
            assert!(registry.list().iter().any(|a| a.capability_class == *class));
        }
    }

    #[test]
    fn test_list_is_alphabetical() {
        let names: Vec<String> = AgentRegistry::with_defaults()
            .list()
            .into_iter()
            .map(|a| a.name)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_increment_respects_capacity() {
        let registry = small_registry();
        assert_eq!(registry.increment_load("alpha").unwrap(), 1);
        assert_eq!(registry.increment_load("alpha").unwrap(), 2);
        let err = registry.increment_load("alpha").unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { max_concurrency: 2, .. }));
        assert_eq!(registry.get("alpha").unwrap().load, 2);
    }

    #[test]
    fn test_decrement_never_underflows() {
        let registry = small_registry();
        assert!(matches!(
            registry.decrement_load("alpha"),
            Err(EngineError::LoadUnderflow(_))
        ));
        registry.increment_load("alpha").unwrap();
        assert_eq!(registry.decrement_load("alpha").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_increments_hold_invariant() {
        let registry = Arc::new(
            AgentRegistry::new(vec![AgentSpec::new("busy", CapabilityClass::Analysis, &["x"])
                .with_max_concurrency(5)]),
        );
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.increment_load("busy").is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 5);
        assert_eq!(registry.get("busy").unwrap().load, 5);
    }

    #[test]
    fn test_offline_agent_not_eligible() {
        let registry = small_registry();
        registry.set_status("alpha", AgentStatus::Offline).unwrap();
        assert!(!registry.get("alpha").unwrap().is_eligible());
        registry.set_status("alpha", AgentStatus::Online).unwrap();
        assert!(registry.get("alpha").unwrap().is_eligible());
    }

    #[test]
    fn test_unknown_agent() {
        let registry = small_registry();
        assert!(matches!(registry.get("nope"), Err(EngineError::AgentNotFound(_))));
    }

    #[test]
    fn test_penalty_lowers_effective_efficiency() {
        let registry = small_registry();
        registry
            .apply_penalty("alpha", 0.3, Duration::from_secs(60))
            .unwrap();
        let agent = registry.get("alpha").unwrap();
        assert!(agent.effective_efficiency < agent.efficiency);
        assert!(agent.efficiency - agent.effective_efficiency <= 0.3 + 1e-9);
    }

    #[test]
    fn test_penalty_decays() {
        let penalty = Penalty {
            amount: 0.4,
            applied_at: Instant::now() - Duration::from_secs(30),
            window: Duration::from_secs(60),
        };
        let value = penalty.current(Instant::now());
        assert!(value > 0.0 && value < 0.21);

        let expired = Penalty {
            amount: 0.4,
            applied_at: Instant::now() - Duration::from_secs(61),
            window: Duration::from_secs(60),
        };
        assert_eq!(expired.current(Instant::now()), 0.0);
    }

    #[test]
    fn test_blend_efficiency() {
        let registry = small_registry();
        registry.set_efficiency("alpha", 0.5).unwrap();
        let e = registry.blend_efficiency("alpha", 1.0, 0.5).unwrap();
        assert!((e - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_register_rejects_busy_replacement() {
        let registry = small_registry();
        registry.increment_load("alpha").unwrap();
        let spec = AgentSpec::new("alpha", CapabilityClass::Image, &["image"]);
        assert!(registry.register(spec).is_err());
    }
}
