//! Audit records for human-in-the-loop requests and responses.
//!
//! Every outbound confirmation request and every inbound reply is recorded
//! as one immutable line in the audit log. The `audit_id` links a request
//! to exactly one eventual response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What a HITL request is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Missing extraction fields need filling in
    MissingInfo,

    /// A human must approve or decline a dossier
    DossierConfirmation,
}

/// Whether a record is the outbound request or the inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Request,
    Response,
}

/// A single line in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Correlation token linking request and response
    pub audit_id: Uuid,

    /// When this record was written
    pub timestamp: DateTime<Utc>,

    /// Event this decision concerns (absent for admin-level records)
    pub event_id: Option<String>,

    /// What was asked
    pub request_type: RequestType,

    /// Request or response
    pub stage: AuditStage,

    /// Who produced this record (backend name, reply sender, "system")
    pub responder: String,

    /// Outcome keyword: pending/approved/declined/completed/incomplete
    pub outcome: String,

    /// Raw backend payload or reply body, when worth keeping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl AuditRecord {
    pub fn new(
        audit_id: Uuid,
        event_id: Option<String>,
        request_type: RequestType,
        stage: AuditStage,
        responder: String,
        outcome: String,
    ) -> Self {
        Self {
            audit_id,
            timestamp: Utc::now(),
            event_id,
            request_type,
            stage,
            responder,
            outcome,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Normalized tri-state decision from a heterogeneous backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlDecision {
    Approved,
    Declined,
    Pending,
}

impl HitlDecision {
    /// Normalize a raw backend response.
    ///
    /// Precedence: an explicit `dossier_required` boolean wins; otherwise a
    /// `status` string of approved/declined/pending resolves it; anything
    /// else is `Pending`.
    pub fn from_response(raw: &Value) -> Self {
        if let Some(required) = raw.get("dossier_required").and_then(Value::as_bool) {
            return if required {
                Self::Approved
            } else {
                Self::Declined
            };
        }

        match raw.get("status").and_then(Value::as_str) {
            Some("approved") => Self::Approved,
            Some("declined") => Self::Declined,
            _ => Self::Pending,
        }
    }

    /// Interpret a free-text inbox reply body.
    pub fn from_reply_text(body: &str) -> Self {
        let first = body
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_ascii_lowercase();

        match first.as_str() {
            "yes" | "y" | "approve" | "approved" | "ok" => Self::Approved,
            "no" | "n" | "decline" | "declined" => Self::Declined,
            _ => Self::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Outcome keyword for audit records.
    pub fn as_outcome(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Pending => "pending",
        }
    }
}

/// What kind of decision a pending audit is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    MissingInfo,
    DossierDecision,
}

/// Transient record of an unanswered HITL request, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct PendingAudit {
    pub audit_id: Uuid,
    pub kind: PendingKind,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}
