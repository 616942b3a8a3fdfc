//! Core orchestration logic.
//!
//! This module contains:
//! - FingerprintCache: Negative-decision suppression
//! - StepLedger: Write-once progress guards
//! - AuditLog: Append-only HITL audit trail
//! - ReminderScheduler: Cancelable reminder/escalation timers
//! - ConcurrencyGate: Bounded parallelism for outbound calls
//! - ResearchCoordinator: Agent fan-out with failure isolation
//! - HitlCoordinator: Human confirmation requests
//! - EventPipeline: Per-event state machine
//! - Orchestrator: Top-level run loop and inbox correlation

pub mod audit_log;
pub mod fingerprint;
pub mod gate;
pub mod hitl;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod research;
pub mod scheduler;

// Re-export commonly used types
pub use audit_log::AuditLog;
pub use fingerprint::{event_fingerprint, rule_hash, FingerprintCache, NegativeDecision};
pub use gate::ConcurrencyGate;
pub use hitl::{DossierOutcome, HitlConfig, HitlCoordinator, HitlError, HitlStatus, InfoRequestOutcome};
pub use ledger::StepLedger;
pub use orchestrator::{Orchestrator, OrchestratorSettings, PendingAudits};
pub use pipeline::{EventContext, EventPipeline, PipelineConfig, PipelineOutcome};
pub use research::{ResearchCoordinator, ResearchGroupError};
pub use scheduler::{ReminderKind, ReminderScheduler};
