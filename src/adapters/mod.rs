//! Collaborator interfaces for external systems.
//!
//! The orchestration engine only ever talks to calendars, extractors,
//! mail transports, research services, and the CRM through these traits.
//! Concrete implementations are constructed once at process start and
//! injected; there is no global registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    CalendarEvent, ExtractionResult, ResearchResult, ResearchTrigger, TriggerResult,
};

/// Read-only source of calendar events.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn poll(&self) -> Result<Vec<CalendarEvent>>;
}

/// Decides whether an event should enter the pipeline.
#[async_trait]
pub trait TriggerClassifier: Send + Sync {
    async fn check(&self, event: &CalendarEvent) -> Result<TriggerResult>;

    /// The active trigger-word set, hashed into the fingerprint cache's
    /// rule hash so cached negative decisions invalidate on rule changes.
    fn trigger_words(&self) -> Vec<String>;
}

/// Pulls structured company info out of an event.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, event: &CalendarEvent) -> Result<ExtractionResult>;
}

/// Outbound channel to a human (email, chat, ...).
#[async_trait]
pub trait CommunicationBackend: Send + Sync {
    /// Backend name, used as the responder in audit records.
    fn name(&self) -> &str;

    /// Ask a human for confirmation or missing data. The returned value is
    /// backend-shaped; `HitlDecision::from_response` normalizes it.
    async fn request_confirmation(
        &self,
        contact: &str,
        subject: &str,
        body: &str,
        event: &CalendarEvent,
        info: &BTreeMap<String, String>,
        context: Option<&Value>,
    ) -> Result<Value>;

    /// Fire-and-forget notification send. Returns whether the message left.
    async fn send_email(&self, recipient: &str, subject: &str, body: &str) -> Result<bool>;
}

/// One research agent (dossier, similar companies, internal reports, ...).
#[async_trait]
pub trait ResearchBackend: Send + Sync {
    async fn run(&self, trigger: &ResearchTrigger) -> Result<ResearchResult>;
}

/// Terminal sink for qualified records.
#[async_trait]
pub trait CrmSink: Send + Sync {
    async fn send(&self, event: &CalendarEvent, info: &BTreeMap<String, String>) -> Result<()>;
}

/// A reply pulled from the inbox, with any correlation token the transport
/// detected in headers or subject.
#[derive(Debug, Clone)]
pub struct InboxReply {
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub audit_id: Option<Uuid>,
}

/// Alert severity reported to the external alerting collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Error,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Source of asynchronous human replies.
#[async_trait]
pub trait InboxSource: Send + Sync {
    async fn poll_replies(&self) -> Result<Vec<InboxReply>>;
}

/// External alerting collaborator.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, severity: AlertSeverity, message: &str);
}

/// Explicit name → backend map, resolved from configuration at startup.
#[derive(Default, Clone)]
pub struct ResearchRegistry {
    backends: HashMap<String, Arc<dyn ResearchBackend>>,
}

impl ResearchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under an agent name. Last registration wins.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn ResearchBackend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ResearchBackend>> {
        self.backends.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResearchStatus;

    struct StaticAgent;

    #[async_trait]
    impl ResearchBackend for StaticAgent {
        async fn run(&self, trigger: &ResearchTrigger) -> Result<ResearchResult> {
            Ok(ResearchResult {
                source: "static".to_string(),
                status: ResearchStatus::Completed,
                payload: serde_json::json!({"event": trigger.event.id}),
                artifact_path: None,
            })
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ResearchRegistry::new();
        assert!(registry.is_empty());

        registry.register("dossier", Arc::new(StaticAgent));

        assert!(registry.get("dossier").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.names(), vec!["dossier"]);
    }
}
