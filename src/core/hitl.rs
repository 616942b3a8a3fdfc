//! Human-in-the-loop confirmation requests.
//!
//! Builds outbound confirmation/missing-info requests, normalizes the
//! heterogeneous backend responses into a tri-state decision, records
//! both sides in the audit log, and wires pending decisions into the
//! reminder scheduler and the orchestrator's pending-audit registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::CommunicationBackend;
use crate::core::audit_log::AuditLog;
use crate::core::orchestrator::PendingAudits;
use crate::core::scheduler::ReminderScheduler;
use crate::domain::{
    normalize_info, AuditStage, CalendarEvent, ExtractionResult, HitlDecision, PendingAudit,
    PendingKind, RequestType,
};

/// HITL-specific failures.
#[derive(Debug, Error)]
pub enum HitlError {
    /// Dossier confirmation has no fallback: silent auto-approval is
    /// unacceptable, so a missing backend is a hard error.
    #[error("no communication backend configured for dossier confirmation")]
    BackendUnavailable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Where a HITL exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlStatus {
    Pending,
    Approved,
    Declined,
    Completed,
    Incomplete,
}

impl HitlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
        }
    }
}

/// Result of a missing-info request.
#[derive(Debug, Clone)]
pub struct InfoRequestOutcome {
    pub info: BTreeMap<String, String>,
    pub is_complete: bool,
    pub status: HitlStatus,
    pub audit_id: Uuid,
}

/// Result of a dossier confirmation request.
#[derive(Debug, Clone)]
pub struct DossierOutcome {
    pub decision: HitlDecision,
    pub details: Option<Value>,
    pub status: HitlStatus,
    pub audit_id: Uuid,
}

/// Reminder cadence and recipients for pending decisions.
#[derive(Debug, Clone)]
pub struct HitlConfig {
    pub reminder_delay: Duration,
    pub escalation_delay: Duration,
    pub admin_reminder_interval: Duration,
    pub escalation_recipient: Option<String>,
    pub admin_recipient: Option<String>,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            reminder_delay: Duration::from_secs(4 * 3600),
            escalation_delay: Duration::from_secs(24 * 3600),
            admin_reminder_interval: Duration::from_secs(24 * 3600),
            escalation_recipient: None,
            admin_recipient: None,
        }
    }
}

/// Builds and interprets human confirmation requests.
pub struct HitlCoordinator {
    backend: Option<Arc<dyn CommunicationBackend>>,
    scheduler: Option<Arc<ReminderScheduler>>,
    audit_log: Arc<AuditLog>,
    pending: Arc<PendingAudits>,
    config: HitlConfig,
}

impl HitlCoordinator {
    pub fn new(
        backend: Option<Arc<dyn CommunicationBackend>>,
        scheduler: Option<Arc<ReminderScheduler>>,
        audit_log: Arc<AuditLog>,
        pending: Arc<PendingAudits>,
        config: HitlConfig,
    ) -> Self {
        Self {
            backend,
            scheduler,
            audit_log,
            pending,
            config,
        }
    }

    /// Ask the requestor to fill in missing extraction fields.
    ///
    /// Without a configured backend this falls back deterministically: the
    /// extracted info is returned unchanged, marked incomplete, and no
    /// pending audit is registered (demo mode, nothing can ever reply).
    pub async fn request_info(
        &self,
        event: &CalendarEvent,
        extracted: &ExtractionResult,
    ) -> Result<InfoRequestOutcome, HitlError> {
        let missing = missing_fields(&extracted.info);
        let subject = format!("Missing details for \"{}\"", event.summary);
        let body = format!(
            "Please reply with the following fields for {}: {}",
            event.summary,
            missing.join(", ")
        );

        let audit_id = self
            .audit_log
            .record(
                Some(&event.id),
                RequestType::MissingInfo,
                AuditStage::Request,
                self.backend.as_ref().map(|b| b.name()).unwrap_or("fallback"),
                "pending",
                Some(serde_json::json!({"missing": missing})),
                None,
            )
            .await?;

        let Some(backend) = &self.backend else {
            info!(event_id = %event.id, "No communication backend, using deterministic fallback");
            self.audit_log
                .record(
                    Some(&event.id),
                    RequestType::MissingInfo,
                    AuditStage::Response,
                    "fallback",
                    "incomplete",
                    None,
                    Some(audit_id),
                )
                .await?;

            return Ok(InfoRequestOutcome {
                info: extracted.info.clone(),
                is_complete: false,
                status: HitlStatus::Incomplete,
                audit_id,
            });
        };

        let raw = backend
            .request_confirmation(
                event.requestor(),
                &subject,
                &body,
                event,
                &extracted.info,
                None,
            )
            .await?;

        // A synchronously supplied info map completes the request in place.
        if let Some(supplied) = raw.get("info").and_then(Value::as_object) {
            let mut merged = extracted.info.clone();
            for (key, value) in supplied {
                if let Some(text) = value.as_str() {
                    merged.insert(key.clone(), text.to_string());
                }
            }
            let merged = normalize_info(merged);

            self.audit_log
                .record(
                    Some(&event.id),
                    RequestType::MissingInfo,
                    AuditStage::Response,
                    backend.name(),
                    "completed",
                    Some(raw.clone()),
                    Some(audit_id),
                )
                .await?;

            let is_complete = crate::domain::trigger::has_required_fields(&merged);
            return Ok(InfoRequestOutcome {
                info: merged,
                is_complete,
                status: HitlStatus::Completed,
                audit_id,
            });
        }

        // No answer yet: park the event and start the reminder clock.
        self.register_pending(event, audit_id, PendingKind::MissingInfo, &subject);

        Ok(InfoRequestOutcome {
            info: extracted.info.clone(),
            is_complete: false,
            status: HitlStatus::Pending,
            audit_id,
        })
    }

    /// Ask a human whether a dossier should be produced.
    pub async fn request_dossier_confirmation(
        &self,
        event: &CalendarEvent,
        info: &BTreeMap<String, String>,
        context: Option<&Value>,
    ) -> Result<DossierOutcome, HitlError> {
        let backend = self.backend.as_ref().ok_or(HitlError::BackendUnavailable)?;

        let company = info
            .get("company_name")
            .map(String::as_str)
            .unwrap_or("this company");
        let subject = format!("Confirm dossier for {company}");
        let body = format!(
            "A report already exists or research is ready to start for {company} \
             (event \"{}\"). Reply Yes to proceed or No to skip.",
            event.summary
        );

        let audit_id = self
            .audit_log
            .record(
                Some(&event.id),
                RequestType::DossierConfirmation,
                AuditStage::Request,
                backend.name(),
                "pending",
                context.cloned(),
                None,
            )
            .await?;

        let raw = backend
            .request_confirmation(event.requestor(), &subject, &body, event, info, context)
            .await?;

        let decision = HitlDecision::from_response(&raw);

        if decision.is_pending() {
            self.register_pending(event, audit_id, PendingKind::DossierDecision, &subject);

            return Ok(DossierOutcome {
                decision,
                details: Some(raw),
                status: HitlStatus::Pending,
                audit_id,
            });
        }

        self.audit_log
            .record(
                Some(&event.id),
                RequestType::DossierConfirmation,
                AuditStage::Response,
                backend.name(),
                decision.as_outcome(),
                Some(raw.clone()),
                Some(audit_id),
            )
            .await?;

        let status = match decision {
            HitlDecision::Approved => HitlStatus::Approved,
            HitlDecision::Declined => HitlStatus::Declined,
            HitlDecision::Pending => HitlStatus::Pending,
        };

        Ok(DossierOutcome {
            decision,
            details: Some(raw),
            status,
            audit_id,
        })
    }

    /// Register the audit as pending and start reminder/escalation timers.
    fn register_pending(
        &self,
        event: &CalendarEvent,
        audit_id: Uuid,
        kind: PendingKind,
        subject: &str,
    ) {
        self.pending.register(PendingAudit {
            audit_id,
            kind,
            event_id: event.id.clone(),
            created_at: Utc::now(),
            resolved: false,
        });

        let Some(scheduler) = &self.scheduler else {
            warn!(%audit_id, "No scheduler configured, pending audit has no reminders");
            return;
        };

        let reminder_body = format!("Reminder: a reply is still needed for \"{subject}\".");
        scheduler.schedule_reminder(
            event.requestor(),
            &format!("Reminder: {subject}"),
            &reminder_body,
            self.config.reminder_delay,
            audit_id,
        );

        let escalation_recipient = self
            .config
            .escalation_recipient
            .clone()
            .unwrap_or_else(|| event.requestor().to_string());
        scheduler.schedule_escalation(
            &escalation_recipient,
            &format!("Escalation: {subject}"),
            &format!("No reply received yet for \"{subject}\"."),
            self.config.escalation_delay,
            audit_id,
        );

        if let Some(admin) = &self.config.admin_recipient {
            scheduler.schedule_admin_recurring_reminders(
                admin,
                &format!("Outstanding decision: {subject}"),
                &format!("The decision \"{subject}\" is still unanswered."),
                self.config.admin_reminder_interval,
                audit_id,
            );
        }

        info!(%audit_id, event_id = %event.id, ?kind, "Registered pending audit with reminders");
    }
}

/// Required fields not yet present in the info map.
fn missing_fields(info: &BTreeMap<String, String>) -> Vec<String> {
    crate::domain::trigger::REQUIRED_FIELDS
        .iter()
        .filter(|f| info.get(**f).map(|v| v.trim().is_empty()).unwrap_or(true))
        .map(|f| f.to_string())
        .collect()
}
