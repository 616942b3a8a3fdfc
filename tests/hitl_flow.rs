//! HITL Flow Integration Tests
//!
//! End-to-end pipeline scenarios: pending dossier confirmations resolved
//! by inbox replies, missing-info follow-ups, and duplicate-reply
//! deduplication.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

use dealflow::adapters::{
    CommunicationBackend, CrmSink, EventSource, Extractor, InboxReply, ResearchBackend,
    ResearchRegistry, TriggerClassifier,
};
use dealflow::core::hitl::{HitlConfig, HitlCoordinator};
use dealflow::core::orchestrator::OrchestratorSettings;
use dealflow::core::pipeline::PipelineConfig;
use dealflow::core::{
    AuditLog, ConcurrencyGate, EventPipeline, FingerprintCache, Orchestrator, PendingAudits,
    ReminderScheduler, ResearchCoordinator, StepLedger,
};
use dealflow::domain::{
    AuditStage, CalendarEvent, ExtractionResult, RequestType, ResearchResult, ResearchStatus,
    ResearchTrigger, TriggerKind, TriggerResult,
};

fn kickoff_event() -> CalendarEvent {
    CalendarEvent {
        id: "e1".to_string(),
        summary: "Kickoff with Acme".to_string(),
        description: "intro call".to_string(),
        updated: Utc::now().to_rfc3339(),
        organizer: "alice@example.com".to_string(),
        creator: String::new(),
    }
}

struct VecSource(Vec<CalendarEvent>);

#[async_trait]
impl EventSource for VecSource {
    async fn poll(&self) -> Result<Vec<CalendarEvent>> {
        Ok(self.0.clone())
    }
}

struct HardClassifier;

#[async_trait]
impl TriggerClassifier for HardClassifier {
    async fn check(&self, _event: &CalendarEvent) -> Result<TriggerResult> {
        Ok(TriggerResult {
            matched: true,
            kind: TriggerKind::Hard,
            confidence: 1.0,
            matched_word: Some("kickoff".to_string()),
            matched_field: Some("summary".to_string()),
            extraction_context: None,
        })
    }

    fn trigger_words(&self) -> Vec<String> {
        vec!["kickoff".to_string()]
    }
}

struct MapExtractor {
    complete: bool,
}

#[async_trait]
impl Extractor for MapExtractor {
    async fn extract(&self, _event: &CalendarEvent) -> Result<ExtractionResult> {
        let mut info = BTreeMap::new();
        info.insert("company_name".to_string(), "Acme".to_string());
        if self.complete {
            info.insert("company_domain".to_string(), "acme.io".to_string());
        }
        Ok(ExtractionResult {
            info,
            is_complete: self.complete,
            confidence: 0.9,
        })
    }
}

/// Backend whose confirmation requests always come back pending, so every
/// decision has to arrive through the inbox.
struct PendingBackend {
    emails_sent: AtomicUsize,
}

#[async_trait]
impl CommunicationBackend for PendingBackend {
    fn name(&self) -> &str {
        "email"
    }

    async fn request_confirmation(
        &self,
        _contact: &str,
        _subject: &str,
        _body: &str,
        _event: &CalendarEvent,
        _info: &BTreeMap<String, String>,
        _context: Option<&Value>,
    ) -> Result<Value> {
        Ok(json!({"status": "pending"}))
    }

    async fn send_email(&self, _recipient: &str, _subject: &str, _body: &str) -> Result<bool> {
        self.emails_sent.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Internal agent that finds an existing report and defers to the human.
struct ExistingReportAgent;

#[async_trait]
impl ResearchBackend for ExistingReportAgent {
    async fn run(&self, _trigger: &ResearchTrigger) -> Result<ResearchResult> {
        Ok(ResearchResult {
            source: "internal_research".to_string(),
            status: ResearchStatus::AwaitRequestorDecision,
            payload: json!({"existing_report": "reports/acme.pdf"}),
            artifact_path: None,
        })
    }
}

struct OkAgent(&'static str);

#[async_trait]
impl ResearchBackend for OkAgent {
    async fn run(&self, trigger: &ResearchTrigger) -> Result<ResearchResult> {
        Ok(ResearchResult {
            source: self.0.to_string(),
            status: ResearchStatus::Completed,
            payload: json!({"event": trigger.event.id}),
            artifact_path: None,
        })
    }
}

struct CountingCrm {
    sent: AtomicUsize,
    last_info: StdMutex<BTreeMap<String, String>>,
}

impl CountingCrm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicUsize::new(0),
            last_info: StdMutex::new(BTreeMap::new()),
        })
    }
}

#[async_trait]
impl CrmSink for CountingCrm {
    async fn send(&self, _event: &CalendarEvent, info: &BTreeMap<String, String>) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        *self.last_info.lock().unwrap() = info.clone();
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    audit_log: Arc<AuditLog>,
    pending: Arc<PendingAudits>,
    scheduler: Arc<ReminderScheduler>,
    crm: Arc<CountingCrm>,
    _temp: TempDir,
}

async fn harness(extractor_complete: bool, internal: Arc<dyn ResearchBackend>) -> Harness {
    let temp = TempDir::new().unwrap();

    let audit_log = Arc::new(AuditLog::open(temp.path().join("audit.jsonl")).await.unwrap());
    let cache = Arc::new(Mutex::new(
        FingerprintCache::load(temp.path().join("fp.json")).await.unwrap(),
    ));
    let ledger = Arc::new(Mutex::new(StepLedger::new()));
    let pending = Arc::new(PendingAudits::default());

    let backend: Arc<dyn CommunicationBackend> = Arc::new(PendingBackend {
        emails_sent: AtomicUsize::new(0),
    });
    let scheduler = Arc::new(ReminderScheduler::new(backend.clone()));

    let mut registry = ResearchRegistry::new();
    registry.register("internal_research", internal);
    registry.register("dossier", Arc::new(OkAgent("dossier")));
    registry.register("similar_companies", Arc::new(OkAgent("similar_companies")));

    let research = Arc::new(ResearchCoordinator::new(
        registry,
        ConcurrencyGate::new(3).unwrap(),
    ));

    let hitl = Arc::new(HitlCoordinator::new(
        Some(backend),
        Some(scheduler.clone()),
        audit_log.clone(),
        pending.clone(),
        HitlConfig {
            admin_recipient: Some("ops@example.com".to_string()),
            ..HitlConfig::default()
        },
    ));

    let crm = CountingCrm::new();
    let pipeline = Arc::new(EventPipeline::new(
        Arc::new(HardClassifier),
        Arc::new(MapExtractor {
            complete: extractor_complete,
        }),
        crm.clone(),
        ConcurrencyGate::new(2).unwrap(),
        cache.clone(),
        ledger.clone(),
        research,
        hitl,
        PipelineConfig::default(),
    ));

    let orchestrator = Orchestrator::new(
        Arc::new(VecSource(vec![kickoff_event()])),
        None,
        None,
        pipeline,
        audit_log.clone(),
        Some(scheduler.clone()),
        pending.clone(),
        cache,
        ledger,
        OrchestratorSettings {
            state_dir: Some(temp.path().to_path_buf()),
            ..OrchestratorSettings::default()
        },
    );

    Harness {
        orchestrator,
        audit_log,
        pending,
        scheduler,
        crm,
        _temp: temp,
    }
}

/// Find the audit id of the latest request of the given type.
async fn request_audit_id(audit_log: &AuditLog, request_type: RequestType) -> Uuid {
    audit_log
        .load_entries()
        .await
        .unwrap()
        .iter()
        .rev()
        .find(|r| r.stage == AuditStage::Request && r.request_type == request_type)
        .map(|r| r.audit_id)
        .expect("request record")
}

fn reply(audit_id: Uuid, body: &str) -> InboxReply {
    InboxReply {
        subject: "Re: Confirm dossier for Acme".to_string(),
        sender: "alice@example.com".to_string(),
        body: body.to_string(),
        audit_id: Some(audit_id),
    }
}

#[tokio::test]
async fn test_pending_dossier_resolved_by_inbox_reply() {
    let h = harness(true, Arc::new(ExistingReportAgent)).await;

    h.orchestrator.run().await.unwrap();

    // Suspended: audit pending, reminders ticking, nothing dispatched
    assert_eq!(h.pending.pending_count(), 1);
    assert!(h.scheduler.pending_count() > 0);
    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 0);

    let audit_id = request_audit_id(&h.audit_log, RequestType::DossierConfirmation).await;

    h.orchestrator
        .handle_inbox_reply(reply(audit_id, "Yes, go ahead"))
        .await
        .unwrap();

    // Resolved: approved response recorded, reminders canceled, exactly
    // one CRM dispatch
    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 1);
    assert_eq!(h.scheduler.pending_count(), 0);
    assert!(!h.pending.has_pending());
    assert!(h.audit_log.has_response(audit_id).await.unwrap());

    let records = h.audit_log.load_entries().await.unwrap();
    let response = records
        .iter()
        .find(|r| r.audit_id == audit_id && r.stage == AuditStage::Response)
        .unwrap();
    assert_eq!(response.outcome, "approved");
}

#[tokio::test]
async fn test_duplicate_replies_resume_once() {
    let h = harness(true, Arc::new(ExistingReportAgent)).await;

    h.orchestrator.run().await.unwrap();
    let audit_id = request_audit_id(&h.audit_log, RequestType::DossierConfirmation).await;

    h.orchestrator
        .handle_inbox_reply(reply(audit_id, "Yes"))
        .await
        .unwrap();
    h.orchestrator
        .handle_inbox_reply(reply(audit_id, "Yes"))
        .await
        .unwrap();
    h.orchestrator
        .handle_inbox_reply(reply(audit_id, "Yes please"))
        .await
        .unwrap();

    // Downstream continuation ran exactly once
    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 1);

    // Only one response record exists for the audit id
    let responses = h
        .audit_log
        .load_entries()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.audit_id == audit_id && r.stage == AuditStage::Response)
        .count();
    assert_eq!(responses, 1);
}

#[tokio::test]
async fn test_declined_dossier_still_dispatches_without_group() {
    let h = harness(true, Arc::new(ExistingReportAgent)).await;

    h.orchestrator.run().await.unwrap();
    let audit_id = request_audit_id(&h.audit_log, RequestType::DossierConfirmation).await;

    h.orchestrator
        .handle_inbox_reply(reply(audit_id, "No thanks"))
        .await
        .unwrap();

    // The record still reaches the CRM; the existing report is reused
    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 1);

    let records = h.audit_log.load_entries().await.unwrap();
    let response = records
        .iter()
        .find(|r| r.audit_id == audit_id && r.stage == AuditStage::Response)
        .unwrap();
    assert_eq!(response.outcome, "declined");
}

#[tokio::test]
async fn test_missing_info_reply_merges_fields() {
    let h = harness(false, Arc::new(OkAgent("internal_research"))).await;

    h.orchestrator.run().await.unwrap();

    // Suspended on the missing-info request
    assert_eq!(h.pending.pending_count(), 1);
    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 0);

    let audit_id = request_audit_id(&h.audit_log, RequestType::MissingInfo).await;

    h.orchestrator
        .handle_inbox_reply(reply(audit_id, "Company: Acme Corp\nDomain: acme.io"))
        .await
        .unwrap();

    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 1);

    // Aliases were resolved during the merge
    let info = h.crm.last_info.lock().unwrap().clone();
    assert_eq!(info.get("company_domain").unwrap(), "acme.io");
}

#[tokio::test]
async fn test_reply_after_restart_dedups_via_audit_log() {
    let h = harness(true, Arc::new(ExistingReportAgent)).await;

    h.orchestrator.run().await.unwrap();
    let audit_id = request_audit_id(&h.audit_log, RequestType::DossierConfirmation).await;

    // A previous process already recorded the response before crashing
    h.audit_log
        .record(
            Some("e1"),
            RequestType::DossierConfirmation,
            AuditStage::Response,
            "alice@example.com",
            "approved",
            None,
            Some(audit_id),
        )
        .await
        .unwrap();

    h.orchestrator
        .handle_inbox_reply(reply(audit_id, "Yes"))
        .await
        .unwrap();

    // The late reply was ignored: no continuation, no second response
    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 0);
    let responses = h
        .audit_log
        .load_entries()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.audit_id == audit_id && r.stage == AuditStage::Response)
        .count();
    assert_eq!(responses, 1);
}

#[tokio::test]
async fn test_reply_without_audit_id_is_ignored() {
    let h = harness(true, Arc::new(ExistingReportAgent)).await;

    h.orchestrator.run().await.unwrap();

    h.orchestrator
        .handle_inbox_reply(InboxReply {
            subject: "unrelated".to_string(),
            sender: "spam@example.com".to_string(),
            body: "Yes".to_string(),
            audit_id: None,
        })
        .await
        .unwrap();

    assert_eq!(h.crm.sent.load(Ordering::SeqCst), 0);
    assert_eq!(h.pending.pending_count(), 1);
}
