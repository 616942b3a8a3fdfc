//! Research backend inputs and outputs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::CalendarEvent;

/// Terminal status of a research backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    /// Backend produced a usable result
    Completed,

    /// Required fields are missing; the event must suspend until the
    /// requestor supplies them
    AwaitRequestorDetails,

    /// An existing report was found; the event must suspend until the
    /// requestor chooses whether to regenerate
    AwaitRequestorDecision,

    /// Backend call failed
    Failed,
}

/// Output of one research backend call, cached per event per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    /// Agent name that produced this result
    pub source: String,

    pub status: ResearchStatus,

    /// Backend-specific payload
    pub payload: Value,

    /// Rendered artifact on disk, if the backend wrote one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
}

impl ResearchResult {
    /// Whether the pipeline must suspend and wait for a human.
    pub fn needs_requestor(&self) -> bool {
        matches!(
            self.status,
            ResearchStatus::AwaitRequestorDetails | ResearchStatus::AwaitRequestorDecision
        )
    }
}

/// Input handed to a research backend.
#[derive(Debug, Clone)]
pub struct ResearchTrigger {
    pub event: CalendarEvent,

    /// Normalized extraction fields
    pub info: BTreeMap<String, String>,

    /// Set when a human follow-up changed the info and caches must be bypassed
    pub force: bool,
}
