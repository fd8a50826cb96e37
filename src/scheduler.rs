//! Task Scheduler (Dispatcher)
//!
//! Picks the best eligible agent for each queued task:
//! - queue order: priority descending, FIFO within a band
//! - candidates: capability superset of the task's requirements, narrowed by
//!   the `required_agents` hint, online and below capacity
//! - additive dispatch score, floored at 0 (see [`dispatch_score`])
//! - tie-break: score, then lowest load, then name
//!
//! A task nobody can take stays queued for the next tick. Rebalancing runs on
//! a slower tick and only applies a decaying efficiency penalty to overloaded
//! agents; it never preempts running executions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{SchedulerConfig, ScoringWeights};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventCategory, EventLevel, EventRecord, EventSink};
use crate::registry::{Agent, AgentStatus, CapabilityClass};
use crate::state::EngineState;
use crate::task::{Task, TaskCategory, TaskId, TaskStatus};

/// Capability class that natively serves a task category
pub fn class_for_category(category: TaskCategory) -> CapabilityClass {
    match category {
        TaskCategory::DataAnalysis => CapabilityClass::Analysis,
        TaskCategory::WebSearch => CapabilityClass::WebFetch,
        TaskCategory::DataTransform => CapabilityClass::DataTransform,
        TaskCategory::Automation => CapabilityClass::Automation,
        TaskCategory::FileManagement => CapabilityClass::FileOps,
        TaskCategory::Voice => CapabilityClass::Voice,
        TaskCategory::Image => CapabilityClass::Image,
        TaskCategory::General => CapabilityClass::Analysis,
    }
}

/// Additive fitness of `agent` for a task of `category` in `language`
pub fn dispatch_score(
    agent: &Agent,
    category: TaskCategory,
    language: &str,
    weights: &ScoringWeights,
) -> f64 {
    let mut score = weights.base;
    score -= weights.load_penalty * agent.load_ratio();
    if agent.capability_class == class_for_category(category) {
        score += weights.class_match;
    }
    score += weights.efficiency * agent.effective_efficiency;
    if agent.average_response_time_ms < weights.fast_response_threshold_ms {
        score += weights.fast_response;
    }
    if agent.supports_language(language) {
        score += weights.language_match;
    }
    score.max(0.0)
}

/// A candidate agent with its score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAgent {
    pub name: String,
    pub score: f64,
    pub load: usize,
}

/// A committed task → agent assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub agent: String,
    pub score: f64,
}

/// Outcome of one rebalance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub overloaded: Vec<String>,
    pub underloaded: Vec<String>,
}

fn rank(a: &ScoredAgent, b: &ScoredAgent) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.load.cmp(&b.load))
        .then_with(|| a.name.cmp(&b.name))
}

/// Scores agents and commits queued tasks to them
pub struct Dispatcher {
    state: Arc<EngineState>,
    sink: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl Dispatcher {
    pub fn new(state: Arc<EngineState>, sink: Arc<dyn EventSink>, config: SchedulerConfig) -> Self {
        Self {
            state,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Eligible candidates for `task`, best first.
    ///
    /// Fails only when the task has no analysis.
    pub fn rank_candidates(&self, task: &Task, agents: &[Agent]) -> EngineResult<Vec<ScoredAgent>> {
        let analysis = task.analysis.as_ref().ok_or_else(|| {
            EngineError::InvariantViolation(format!("task {} has no analysis", task.id))
        })?;

        let mut candidates: Vec<ScoredAgent> = agents
            .iter()
            .filter(|a| a.has_capabilities(&analysis.required_capabilities))
            .filter(|a| task.required_agents.is_empty() || task.required_agents.contains(&a.name))
            .filter(|a| a.is_eligible())
            .map(|a| ScoredAgent {
                name: a.name.clone(),
                score: dispatch_score(a, analysis.category, &task.language, &self.config.weights),
                load: a.load,
            })
            .collect();
        candidates.sort_by(rank);
        Ok(candidates)
    }

    /// Try to commit one queued task.
    ///
    /// `Ok(None)` means no agent can take it right now; it stays queued.
    pub fn dispatch_task(&self, task_id: &str) -> EngineResult<Option<Dispatch>> {
        let task = self
            .state
            .task(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Queued {
            warn!("Stale queue entry for task {} ({})", task.id, task.status.as_str());
            self.state.dequeue(&task.id);
            return Ok(None);
        }

        let registry = self.state.registry();
        let candidates = self.rank_candidates(&task, &registry.list())?;

        for candidate in candidates {
            match registry.increment_load(&candidate.name) {
                Ok(load) => {
                    let committed = self.state.update_task(&task.id, |t| {
                        t.advance(TaskStatus::Dispatched)?;
                        t.assigned_agent = Some(candidate.name.clone());
                        Ok(())
                    });
                    if let Err(e) = committed {
                        if let Err(release) = registry.decrement_load(&candidate.name) {
                            error!("Load rollback failed for {}: {}", candidate.name, release);
                        }
                        return Err(e);
                    }
                    self.state.dequeue(&task.id);

                    info!(
                        "Dispatched task {} ({}) to {} (score {:.1}, load {})",
                        task.id,
                        task.priority.as_str(),
                        candidate.name,
                        candidate.score,
                        load
                    );
                    self.sink.emit(
                        EventRecord::new(EventCategory::Dispatch, "task dispatched")
                            .for_task(&task.id)
                            .with_data(serde_json::json!({
                                "agent": candidate.name,
                                "score": candidate.score,
                                "priority": task.priority.as_str(),
                                "load": load,
                            })),
                    );
                    return Ok(Some(Dispatch {
                        task_id: task.id.clone(),
                        agent: candidate.name,
                        score: candidate.score,
                    }));
                }
                Err(EngineError::CapacityExceeded { agent, max_concurrency }) => {
                    error!(
                        "Capacity exceeded on {} (max {}) while dispatching {}",
                        agent, max_concurrency, task.id
                    );
                }
                Err(e) => warn!("Skipping {} for task {}: {}", candidate.name, task.id, e),
            }
        }

        debug!("Task {} has no eligible agent this tick", task.id);
        Ok(None)
    }

    /// One scheduling pass over the pending queue
    pub fn tick(&self) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();

        for entry in self.state.queue_snapshot() {
            if self.state.registry().total_load() >= self.config.max_in_flight {
                debug!("In-flight ceiling {} reached", self.config.max_in_flight);
                break;
            }

            match self.dispatch_task(&entry.task_id) {
                Ok(Some(dispatch)) => dispatches.push(dispatch),
                Ok(None) => {}
                Err(EngineError::TaskNotFound(id)) => {
                    warn!("Dropping unknown task {} from the queue", id);
                    self.state.dequeue(&id);
                }
                Err(e) => {
                    error!("Cannot dispatch task {}: {}", entry.task_id, e);
                    self.state.dequeue(&entry.task_id);
                    let failed = self
                        .state
                        .update_task(&entry.task_id, |t| t.fail(e.to_string()));
                    if let Err(fail_err) = failed {
                        error!("Could not fail task {}: {}", entry.task_id, fail_err);
                    }
                    self.sink.emit(
                        EventRecord::new(EventCategory::Internal, e.to_string())
                            .for_task(&entry.task_id)
                            .with_level(EventLevel::Error),
                    );
                }
            }
        }

        dispatches
    }

    /// Flag overloaded / underloaded agents and penalize the overloaded ones
    pub fn rebalance(&self) -> RebalanceReport {
        let registry = self.state.registry();
        let mut report = RebalanceReport::default();

        for agent in registry.list() {
            if agent.status != AgentStatus::Online {
                continue;
            }
            let ratio = agent.load_ratio();
            if ratio > self.config.overload_ratio {
                match registry.apply_penalty(
                    &agent.name,
                    self.config.overload_penalty,
                    self.config.penalty_window,
                ) {
                    Ok(()) => report.overloaded.push(agent.name),
                    Err(e) => warn!("Penalty not applied to {}: {}", agent.name, e),
                }
            } else if ratio < self.config.underload_ratio {
                report.underloaded.push(agent.name);
            }
        }

        if !report.overloaded.is_empty() {
            info!(
                "Rebalance: overloaded {:?}, underloaded {:?}",
                report.overloaded, report.underloaded
            );
            self.sink.emit(
                EventRecord::new(EventCategory::Rebalance, "overloaded agents penalized")
                    .with_data(serde_json::json!({
                        "overloaded": report.overloaded,
                        "underloaded": report.underloaded,
                    })),
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::registry::{AgentRegistry, AgentSpec};
    use crate::task::{Priority, TaskAnalysis, TaskKind};
    use std::collections::BTreeSet;

    fn queued(state: &EngineState, priority: Priority, caps: &[&str]) -> TaskId {
        let mut analysis = TaskAnalysis::fallback();
        analysis.required_capabilities = caps.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>();
        let mut task = Task::new(TaskKind::Text, "x")
            .with_priority(priority)
            .with_analysis(analysis);
        task.advance(TaskStatus::Analyzed).unwrap();
        task.advance(TaskStatus::Queued).unwrap();
        let id = task.id.clone();
        state.insert_task(task);
        state.enqueue(&id, priority);
        id
    }

    fn dispatcher(agents: Vec<AgentSpec>) -> (Arc<EngineState>, Dispatcher) {
        let state = Arc::new(EngineState::new(AgentRegistry::new(agents)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&state),
            Arc::new(NullEventSink),
            SchedulerConfig::default(),
        );
        (state, dispatcher)
    }

    fn agent(name: &str, class: CapabilityClass, max: usize) -> AgentSpec {
        AgentSpec::new(name, class, &["general-analysis"]).with_max_concurrency(max)
    }

    #[test]
    fn test_score_components() {
        let weights = ScoringWeights::default();
        let agent = Agent {
            name: "a".into(),
            capability_class: CapabilityClass::Analysis,
            capabilities: BTreeSet::new(),
            status: AgentStatus::Online,
            load: 1,
            max_concurrency: 2,
            efficiency: 0.5,
            effective_efficiency: 0.5,
            average_response_time_ms: 1000,
            supported_languages: vec!["en".into()],
        };
        // 100 - 20 + 30 + 10 + 10 + 15
        let score = dispatch_score(&agent, TaskCategory::DataAnalysis, "en", &weights);
        assert!((score - 145.0).abs() < 1e-9);
        // no class match, no language match
        let score = dispatch_score(&agent, TaskCategory::Image, "ko", &weights);
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_floor() {
        let weights = ScoringWeights {
            base: 0.0,
            ..ScoringWeights::default()
        };
        let agent = Agent {
            name: "a".into(),
            capability_class: CapabilityClass::Image,
            capabilities: BTreeSet::new(),
            status: AgentStatus::Online,
            load: 2,
            max_concurrency: 2,
            efficiency: 0.0,
            effective_efficiency: 0.0,
            average_response_time_ms: 9000,
            supported_languages: vec![],
        };
        assert_eq!(dispatch_score(&agent, TaskCategory::General, "en", &weights), 0.0);
    }

    #[test]
    fn test_tie_breaks_on_load_then_name() {
        let (state, dispatcher) = dispatcher(vec![
            agent("bravo", CapabilityClass::Analysis, 100),
            agent("alpha", CapabilityClass::Analysis, 100),
            agent("charlie", CapabilityClass::Analysis, 100),
        ]);
        let task = Task::new(TaskKind::Text, "x").with_analysis(TaskAnalysis::fallback());
        let ranked = dispatcher
            .rank_candidates(&task, &state.registry().list())
            .unwrap();
        let names: Vec<&str> = ranked.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);
    }

    #[test]
    fn test_priority_order_across_ticks() {
        let (state, dispatcher) = dispatcher(vec![agent("solo", CapabilityClass::Analysis, 1)]);
        let caps = ["general-analysis"];
        let low = queued(&state, Priority::Low, &caps);
        let urgent_1 = queued(&state, Priority::Urgent, &caps);
        let medium = queued(&state, Priority::Medium, &caps);
        let urgent_2 = queued(&state, Priority::Urgent, &caps);

        let mut order = Vec::new();
        for _ in 0..4 {
            let dispatched = dispatcher.tick();
            assert_eq!(dispatched.len(), 1);
            order.push(dispatched[0].task_id.clone());
            state.registry().decrement_load("solo").unwrap();
        }
        assert_eq!(order, vec![urgent_1, urgent_2, medium, low]);
    }

    #[test]
    fn test_unschedulable_task_stays_queued() {
        let (state, dispatcher) = dispatcher(vec![agent("solo", CapabilityClass::Analysis, 1)]);
        let id = queued(&state, Priority::High, &["image"]);
        assert!(dispatcher.tick().is_empty());
        assert_eq!(state.queue_depth(), 1);
        assert_eq!(state.task(&id).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let (state, dispatcher) = dispatcher(vec![
            agent("a", CapabilityClass::Analysis, 2),
            agent("b", CapabilityClass::Automation, 3),
        ]);
        for _ in 0..10 {
            queued(&state, Priority::Medium, &["general-analysis"]);
        }
        let dispatched = dispatcher.tick();
        assert_eq!(dispatched.len(), 5);
        for agent in state.registry().list() {
            assert!(agent.load <= agent.max_concurrency);
        }
        assert_eq!(state.queue_depth(), 5);
        assert!(dispatcher.tick().is_empty());
    }

    #[test]
    fn test_required_agents_hint() {
        let (state, dispatcher) = dispatcher(vec![
            agent("a", CapabilityClass::Analysis, 2),
            agent("b", CapabilityClass::Automation, 2),
        ]);
        let id = queued(&state, Priority::Medium, &["general-analysis"]);
        state
            .update_task(&id, |t| {
                t.required_agents = vec!["b".to_string()];
                Ok(())
            })
            .unwrap();
        let dispatched = dispatcher.tick();
        assert_eq!(dispatched[0].agent, "b");
    }

    #[test]
    fn test_unanalyzed_task_is_invariant_violation() {
        let (state, dispatcher) = dispatcher(vec![agent("a", CapabilityClass::Analysis, 2)]);
        let mut task = Task::new(TaskKind::Text, "x");
        task.status = TaskStatus::Queued;
        let id = task.id.clone();
        state.insert_task(task);
        state.enqueue(&id, Priority::Medium);

        assert!(matches!(
            dispatcher.dispatch_task(&id),
            Err(EngineError::InvariantViolation(_))
        ));
        dispatcher.tick();
        assert_eq!(state.queue_depth(), 0);
        assert_eq!(state.task(&id).unwrap().status, TaskStatus::Failed);
        assert_eq!(state.registry().get("a").unwrap().load, 0);
    }

    #[test]
    fn test_max_in_flight_ceiling() {
        let (state, _) = dispatcher(vec![agent("a", CapabilityClass::Analysis, 10)]);
        let dispatcher = Dispatcher::new(
            Arc::clone(&state),
            Arc::new(NullEventSink),
            SchedulerConfig {
                max_in_flight: 2,
                ..SchedulerConfig::default()
            },
        );
        for _ in 0..4 {
            queued(&state, Priority::Medium, &["general-analysis"]);
        }
        assert_eq!(dispatcher.tick().len(), 2);
    }

    #[test]
    fn test_rebalance_penalizes_overloaded() {
        let (state, dispatcher) = dispatcher(vec![
            agent("busy", CapabilityClass::Analysis, 2),
            agent("idle", CapabilityClass::Analysis, 4),
        ]);
        state.registry().increment_load("busy").unwrap();
        state.registry().increment_load("busy").unwrap();

        let before = state.registry().get("busy").unwrap().effective_efficiency;
        let report = dispatcher.rebalance();
        assert_eq!(report.overloaded, vec!["busy"]);
        assert_eq!(report.underloaded, vec!["idle"]);
        let after = state.registry().get("busy").unwrap();
        assert!(after.effective_efficiency < before);
        // Running work is untouched
        assert_eq!(after.load, 2);
    }
}
