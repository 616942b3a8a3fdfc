//! In-memory write-once guards for per-run progress records.
//!
//! The ledger prevents duplicate progress logging when a step is
//! legitimately re-entered (a retried research call, a resumed pipeline)
//! and guarantees the run manifest is written at most once per run.
//! State lives for the orchestrator's lifetime only.

use std::collections::HashSet;

/// Write-once log guard keyed by (run, event, step).
#[derive(Debug, Default)]
pub struct StepLedger {
    steps: HashSet<(String, String, String)>,
    manifests: HashSet<String>,
}

impl StepLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step transition. Returns true the first time this exact
    /// (run, event, step) key is seen, false for every repeat.
    pub fn record_step(
        &mut self,
        run_id: &str,
        event_id: &str,
        step: &str,
        extra: Option<&str>,
    ) -> bool {
        let newly_recorded = self.steps.insert((
            run_id.to_string(),
            event_id.to_string(),
            step.to_string(),
        ));

        if newly_recorded {
            tracing::info!(
                run_id,
                event_id,
                step,
                extra = extra.unwrap_or(""),
                "workflow step"
            );
        }

        newly_recorded
    }

    /// True exactly once per run id.
    pub fn should_write_manifest(&mut self, run_id: &str) -> bool {
        self.manifests.insert(run_id.to_string())
    }

    /// Drop all state for a run.
    pub fn clear_run(&mut self, run_id: &str) {
        self.steps.retain(|(run, _, _)| run != run_id);
        self.manifests.remove(run_id);
    }
}
