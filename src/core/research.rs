//! Research fan-out with per-agent caching and failure isolation.
//!
//! Sequential agent calls are isolated: a failing backend is recorded in
//! the event's error list and the pipeline moves on. Concurrent groups are
//! the opposite: the first failure aborts the in-flight siblings, the
//! group's partial results are discarded, and one aggregated error is
//! raised to the caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapters::ResearchRegistry;
use crate::core::gate::ConcurrencyGate;
use crate::domain::{CalendarEvent, ResearchResult, ResearchTrigger};

/// One agent's failure inside a fail-fast group.
#[derive(Debug, Clone)]
pub struct GroupFailure {
    pub agent: String,
    pub error: String,
}

/// Aggregated failure of a concurrent research group. The triggering
/// failure is first; sibling failures observed while draining follow.
#[derive(Debug, Error)]
#[error("research group failed: {}", .failures.iter().map(|gf| format!("{}: {}", gf.agent, gf.error)).collect::<Vec<_>>().join("; "))]
pub struct ResearchGroupError {
    pub failures: Vec<GroupFailure>,
}

#[derive(Default)]
struct ResearchState {
    /// event id → agent name → cached result
    cache: HashMap<String, HashMap<String, ResearchResult>>,

    /// event id → accumulated per-agent failures
    errors: HashMap<String, Vec<String>>,
}

/// Coordinates calls to pluggable research backends.
pub struct ResearchCoordinator {
    registry: ResearchRegistry,
    gate: ConcurrencyGate,
    state: Mutex<ResearchState>,
}

impl ResearchCoordinator {
    pub fn new(registry: ResearchRegistry, gate: ConcurrencyGate) -> Self {
        Self {
            registry,
            gate,
            state: Mutex::new(ResearchState::default()),
        }
    }

    /// Run one agent for an event, isolated from siblings.
    ///
    /// Returns the cached result unless `force` is set. A failing or
    /// unknown agent is recorded in the event's error list and yields
    /// `None` rather than aborting the pipeline.
    pub async fn run_agent(
        &self,
        agent: &str,
        event: &CalendarEvent,
        info: &BTreeMap<String, String>,
        force: bool,
    ) -> Result<Option<ResearchResult>> {
        if !force {
            if let Some(cached) = self.cached(&event.id, agent) {
                debug!(agent, event_id = %event.id, "Returning cached research result");
                return Ok(Some(cached));
            }
        }

        let Some(backend) = self.registry.get(agent).cloned() else {
            self.record_error(&event.id, agent, "no backend registered under this name");
            return Ok(None);
        };

        let trigger = ResearchTrigger {
            event: event.clone(),
            info: info.clone(),
            force,
        };

        let _permit = self.gate.acquire().await?;

        match backend.run(&trigger).await {
            Ok(result) => {
                self.cache_result(&event.id, agent, result.clone());
                Ok(Some(result))
            }
            Err(e) => {
                warn!(agent, event_id = %event.id, error = %e, "Research agent failed");
                self.record_error(&event.id, agent, &format!("{e:#}"));
                Ok(None)
            }
        }
    }

    /// Fan the named agents out concurrently as a fail-fast group.
    ///
    /// All agents run under the shared gate. On the first failure the
    /// remaining in-flight siblings are aborted, already-computed group
    /// results are discarded, and the aggregated error is returned. On
    /// success every result is cached and returned keyed by agent name.
    pub async fn run_group(
        &self,
        agents: &[String],
        event: &CalendarEvent,
        info: &BTreeMap<String, String>,
        force: bool,
    ) -> Result<HashMap<String, ResearchResult>, ResearchGroupError> {
        let mut set: JoinSet<(String, Result<ResearchResult>)> = JoinSet::new();

        for agent in agents {
            let Some(backend) = self.registry.get(agent).cloned() else {
                // An unregistered agent fails the whole group before launch.
                return Err(ResearchGroupError {
                    failures: vec![GroupFailure {
                        agent: agent.clone(),
                        error: "no backend registered under this name".to_string(),
                    }],
                });
            };

            let gate = self.gate.clone();
            let agent = agent.clone();
            let trigger = ResearchTrigger {
                event: event.clone(),
                info: info.clone(),
                force,
            };

            set.spawn(async move {
                let permit = gate.acquire().await;
                let result = match permit {
                    Ok(_permit) => backend.run(&trigger).await,
                    Err(e) => Err(e),
                };
                (agent, result)
            });
        }

        let mut results = HashMap::new();
        let mut failures: Vec<GroupFailure> = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((agent, Ok(result))) => {
                    results.insert(agent, result);
                }
                Ok((agent, Err(e))) => {
                    failures.push(GroupFailure {
                        agent,
                        error: format!("{e:#}"),
                    });
                    // First failure: cancel the in-flight siblings, then
                    // keep draining so their outcomes are observed.
                    set.abort_all();
                }
                Err(join_err) if join_err.is_cancelled() => {
                    debug!("Research group sibling canceled");
                }
                Err(join_err) => {
                    failures.push(GroupFailure {
                        agent: "<task>".to_string(),
                        error: join_err.to_string(),
                    });
                    set.abort_all();
                }
            }
        }

        if !failures.is_empty() {
            warn!(
                event_id = %event.id,
                failed = failures.len(),
                discarded = results.len(),
                "Research group failed, discarding partial results"
            );
            return Err(ResearchGroupError { failures });
        }

        for (agent, result) in &results {
            self.cache_result(&event.id, agent, result.clone());
        }

        info!(event_id = %event.id, agents = results.len(), "Research group completed");
        Ok(results)
    }

    fn cached(&self, event_id: &str, agent: &str) -> Option<ResearchResult> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .cache
            .get(event_id)
            .and_then(|agents| agents.get(agent))
            .cloned()
    }

    fn cache_result(&self, event_id: &str, agent: &str, result: ResearchResult) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .cache
            .entry(event_id.to_string())
            .or_default()
            .insert(agent.to_string(), result);
    }

    fn record_error(&self, event_id: &str, agent: &str, error: &str) {
        warn!(agent, event_id, error, "Recording research error");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .errors
            .entry(event_id.to_string())
            .or_default()
            .push(format!("{agent}: {error}"));
    }

    /// Drain the accumulated error list for an event.
    pub fn take_errors(&self, event_id: &str) -> Vec<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.errors.remove(event_id).unwrap_or_default()
    }

    /// Drop cached results and errors for an event (after dispatch).
    pub fn clear_event(&self, event_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cache.remove(event_id);
        state.errors.remove(event_id);
    }
}
