//! dealflow - event-to-CRM workflow orchestrator
//!
//! Turns externally-sourced calendar events into qualified CRM records
//! through a multi-stage pipeline with human-in-the-loop gating.
//!
//! # Architecture
//!
//! Each polled event runs through a per-event state machine:
//! trigger → extraction → conditional human confirmation → multi-agent
//! research → CRM dispatch. Events waiting on a human suspend and are
//! resumed when the matching inbox reply is correlated by audit id.
//!
//! - A fingerprint cache suppresses reprocessing of unchanged,
//!   non-triggering events
//! - An append-only JSONL audit log records every request/response pair
//!   and makes reply correlation durable across restarts
//! - Reminder and escalation timers run as cancelable background tasks
//!   keyed by audit id
//! - Research backends fan out under bounded-concurrency gates, with
//!   fail-fast semantics for concurrent groups
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits (event source, extractor, CRM, ...)
//! - `core`: Orchestration logic (pipeline, coordinators, caches, timers)
//! - `domain`: Data structures (events, audit records, research results)
//! - `cli`: Command-line interface

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    AuditLog, EventPipeline, FingerprintCache, HitlCoordinator, Orchestrator, PendingAudits,
    PipelineOutcome, ReminderScheduler, ResearchCoordinator, StepLedger,
};
pub use crate::domain::{AuditRecord, CalendarEvent, HitlDecision, ResearchResult, TriggerResult};
