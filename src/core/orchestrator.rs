//! Top-level run loop and inbox-reply correlation.
//!
//! One run polls the event source and drives each event through the
//! pipeline sequentially. Events suspended on a human decision park their
//! context here, keyed by audit id; a lazily started inbox-polling loop
//! correlates replies back and resumes them. Repeated failing runs
//! escalate alerts; shutdown is idempotent and bounded.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{AlertSeverity, AlertSink, EventSource, InboxReply, InboxSource};
use crate::core::audit_log::AuditLog;
use crate::core::fingerprint::FingerprintCache;
use crate::core::ledger::StepLedger;
use crate::core::pipeline::{EventContext, EventPipeline, PipelineOutcome};
use crate::core::scheduler::ReminderScheduler;
use crate::domain::{AuditStage, HitlDecision, PendingAudit, PendingKind, RequestType};

/// Unanswered HITL requests, shared between the HITL coordinator (which
/// registers them) and the orchestrator (which resolves them).
///
/// Resolution is a one-shot check-and-set, which is what makes duplicate
/// inbox replies safe under at-least-once delivery.
#[derive(Default)]
pub struct PendingAudits {
    inner: StdMutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    pending: HashMap<Uuid, PendingAudit>,
    resolved: HashSet<Uuid>,
}

impl PendingAudits {
    pub fn register(&self, audit: PendingAudit) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.insert(audit.audit_id, audit);
    }

    /// Atomically mark the audit resolved and hand back its record.
    /// Returns `None` when unknown or already resolved.
    pub fn resolve(&self, audit_id: Uuid) -> Option<PendingAudit> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut audit = state.pending.remove(&audit_id)?;
        state.resolved.insert(audit_id);
        audit.resolved = true;
        Some(audit)
    }

    pub fn is_resolved(&self, audit_id: Uuid) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.resolved.contains(&audit_id)
    }

    pub fn has_pending(&self) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !state.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.len()
    }
}

/// Consecutive-failure counter, persisted when a state path is available.
struct FailureTracker {
    path: Option<PathBuf>,
    count: u32,
}

#[derive(Serialize, Deserialize)]
struct FailureFile {
    consecutive_failures: u32,
}

impl FailureTracker {
    fn load(path: Option<PathBuf>) -> Self {
        let count = path
            .as_deref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|content| serde_json::from_str::<FailureFile>(&content).ok())
            .map(|f| f.consecutive_failures)
            .unwrap_or(0);

        Self { path, count }
    }

    fn record_failure(&mut self) -> u32 {
        self.count += 1;
        self.persist();
        self.count
    }

    fn reset(&mut self) {
        if self.count != 0 {
            self.count = 0;
            self.persist();
        }
    }

    fn persist(&mut self) {
        let Some(path) = &self.path else { return };
        let file = FailureFile {
            consecutive_failures: self.count,
        };
        if let Err(e) = serde_json::to_string(&file)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from))
        {
            // Storage trouble downgrades to in-memory counting.
            warn!(error = %e, "Failed to persist failure counter, keeping it in memory");
            self.path = None;
        }
    }
}

/// Summary written once per run.
#[derive(Debug, Serialize)]
struct RunManifest {
    run_id: String,
    finished_at: chrono::DateTime<chrono::Utc>,
    events_seen: usize,
    dispatched: usize,
    skipped: usize,
    suspended: usize,
    failed: usize,
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Consecutive failing runs before alerts turn critical
    pub failure_alert_threshold: u32,

    pub inbox_poll_interval: Duration,

    /// Hard cap per shutdown cleanup step
    pub shutdown_step_timeout: Duration,

    /// State directory for the failure counter and run manifests
    pub state_dir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            failure_alert_threshold: 3,
            inbox_poll_interval: Duration::from_secs(60),
            shutdown_step_timeout: Duration::from_secs(5),
            state_dir: None,
        }
    }
}

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Top-level workflow orchestrator.
pub struct Orchestrator {
    /// Handle to ourselves for the background inbox loop
    me: Weak<Self>,
    source: Arc<dyn EventSource>,
    inbox: Option<Arc<dyn InboxSource>>,
    alerts: Option<Arc<dyn AlertSink>>,
    pipeline: Arc<EventPipeline>,
    audit_log: Arc<AuditLog>,
    scheduler: Option<Arc<ReminderScheduler>>,
    pending: Arc<PendingAudits>,
    cache: Arc<Mutex<FingerprintCache>>,
    ledger: Arc<Mutex<StepLedger>>,
    settings: OrchestratorSettings,

    /// Suspended event contexts keyed by audit id
    contexts: Mutex<HashMap<Uuid, EventContext>>,
    failures: Mutex<FailureTracker>,
    inbox_task: Mutex<Option<JoinHandle<()>>>,
    cleanups: Mutex<Vec<CleanupFn>>,
    /// `false` until shutdown has completed; doubles as the idempotency
    /// latch (a second caller waits on the lock, then sees `true`)
    shutdown_done: Mutex<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn EventSource>,
        inbox: Option<Arc<dyn InboxSource>>,
        alerts: Option<Arc<dyn AlertSink>>,
        pipeline: Arc<EventPipeline>,
        audit_log: Arc<AuditLog>,
        scheduler: Option<Arc<ReminderScheduler>>,
        pending: Arc<PendingAudits>,
        cache: Arc<Mutex<FingerprintCache>>,
        ledger: Arc<Mutex<StepLedger>>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let failures_path = settings
            .state_dir
            .as_ref()
            .map(|dir| dir.join("failures.json"));

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            source,
            inbox,
            alerts,
            pipeline,
            audit_log,
            scheduler,
            pending,
            cache,
            ledger,
            settings,
            contexts: Mutex::new(HashMap::new()),
            failures: Mutex::new(FailureTracker::load(failures_path)),
            inbox_task: Mutex::new(None),
            cleanups: Mutex::new(Vec::new()),
            shutdown_done: Mutex::new(false),
        })
    }

    pub fn pending_audits(&self) -> &Arc<PendingAudits> {
        &self.pending
    }

    /// Register an async cleanup callback invoked during shutdown.
    pub async fn register_cleanup<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cleanups
            .lock()
            .await
            .push(Box::new(move || Box::pin(f())));
    }

    /// Execute one full run: poll → per-event pipeline → finalize.
    pub async fn run(&self) -> Result<()> {
        let run_id = Uuid::new_v4().to_string();
        info!(%run_id, "Starting run");

        let result = self.run_inner(&run_id).await;

        match &result {
            Ok(()) => {
                self.failures.lock().await.reset();
            }
            Err(e) => {
                let count = self.failures.lock().await.record_failure();
                let severity = if count >= self.settings.failure_alert_threshold {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Error
                };
                error!(%run_id, consecutive = count, error = %e, "Run failed");
                if let Some(alerts) = &self.alerts {
                    alerts
                        .alert(severity, &format!("Run {run_id} failed ({count} consecutive): {e:#}"))
                        .await;
                }
            }
        }

        result
    }

    async fn run_inner(&self, run_id: &str) -> Result<()> {
        let events = self.source.poll().await.context("Event poll failed")?;
        info!(count = events.len(), "Polled events");

        let mut dispatched = 0usize;
        let mut skipped = 0usize;
        let mut suspended = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<anyhow::Error> = None;

        for event in &events {
            match self.pipeline.process(run_id, event).await {
                Ok(outcome) => match outcome {
                    PipelineOutcome::Dispatched => dispatched += 1,
                    PipelineOutcome::SkippedUnchanged
                    | PipelineOutcome::NoTrigger
                    | PipelineOutcome::BelowThreshold => skipped += 1,
                    PipelineOutcome::AwaitingInfo { audit_id, ctx }
                    | PipelineOutcome::AwaitingDecision { audit_id, ctx } => {
                        suspended += 1;
                        self.contexts.lock().await.insert(audit_id, ctx);
                        self.ensure_inbox_loop().await;
                    }
                },
                Err(e) => {
                    // One bad event does not stop its siblings, but the run
                    // still counts as failed for alerting.
                    failed += 1;
                    error!(event_id = %event.id, error = %e, "Event pipeline failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Err(e) = self.cache.lock().await.flush().await {
            warn!(error = %e, "Fingerprint cache flush failed");
        }

        self.write_manifest(run_id, events.len(), dispatched, skipped, suspended, failed)
            .await;

        info!(
            %run_id,
            events = events.len(),
            dispatched,
            skipped,
            suspended,
            failed,
            "Run finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handle one inbox reply. Safe under at-least-once delivery: replays
    /// and late replies are logged and dropped.
    pub async fn handle_inbox_reply(&self, reply: InboxReply) -> Result<()> {
        let Some(audit_id) = reply.audit_id else {
            debug!(sender = %reply.sender, "Reply carries no audit id, ignoring");
            return Ok(());
        };

        if self.pending.is_resolved(audit_id) {
            info!(%audit_id, "Duplicate reply for resolved audit, ignoring");
            return Ok(());
        }

        // Durable dedup: a response already on the audit trail means this
        // decision was handled before a restart.
        if self.audit_log.has_response(audit_id).await? {
            info!(%audit_id, "Audit log already has a response, ignoring reply");
            self.pending.resolve(audit_id);
            return Ok(());
        }

        let Some(pending) = self.pending.resolve(audit_id) else {
            warn!(%audit_id, sender = %reply.sender, "Reply for unknown audit, ignoring");
            return Ok(());
        };

        // Stop the reminder clock the instant the reply is correlated.
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel_for_audit(audit_id);
        }

        let decision = HitlDecision::from_reply_text(&reply.body);
        let request_type = match pending.kind {
            PendingKind::MissingInfo => RequestType::MissingInfo,
            PendingKind::DossierDecision => RequestType::DossierConfirmation,
        };
        let outcome = match pending.kind {
            PendingKind::MissingInfo => "completed",
            PendingKind::DossierDecision => decision.as_outcome(),
        };

        self.audit_log
            .record(
                Some(&pending.event_id),
                request_type,
                AuditStage::Response,
                &reply.sender,
                outcome,
                Some(serde_json::json!({"subject": reply.subject, "body": reply.body})),
                Some(audit_id),
            )
            .await?;

        let Some(ctx) = self.contexts.lock().await.remove(&audit_id) else {
            warn!(%audit_id, "No stored context for resolved audit, cannot resume");
            return Ok(());
        };

        let resumed = match pending.kind {
            PendingKind::MissingInfo => {
                let fields = parse_reply_fields(&reply.body);
                self.pipeline.continue_after_missing_info(ctx, fields).await
            }
            PendingKind::DossierDecision => {
                let approved = decision == HitlDecision::Approved;
                self.pipeline.continue_after_dossier_decision(ctx, approved).await
            }
        };

        match resumed {
            Ok(PipelineOutcome::AwaitingInfo { audit_id: next, ctx })
            | Ok(PipelineOutcome::AwaitingDecision { audit_id: next, ctx }) => {
                // Suspended again on a fresh audit; park under the new id.
                debug!(%next, "Event suspended again after resume");
                self.contexts.lock().await.insert(next, ctx);
                Ok(())
            }
            Ok(outcome) => {
                debug!(?outcome, "Resumed event completed");
                Ok(())
            }
            Err(e) => {
                error!(%audit_id, error = %e, "Resume failed");
                Err(e)
            }
        }
    }

    /// Spawn the inbox-polling loop if it is not already running. Called
    /// lazily, only once at least one audit is pending.
    async fn ensure_inbox_loop(&self) {
        let Some(inbox) = self.inbox.clone() else {
            return;
        };

        let mut task = self.inbox_task.lock().await;
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        // The loop holds a weak handle so it dies with the orchestrator.
        let me = self.me.clone();
        let interval = self.settings.inbox_poll_interval;

        info!("Starting inbox-reply polling loop");
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(orchestrator) = me.upgrade() else {
                    break;
                };

                match inbox.poll_replies().await {
                    Ok(replies) => {
                        for reply in replies {
                            if let Err(e) = orchestrator.handle_inbox_reply(reply).await {
                                error!(error = %e, "Inbox reply handling failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Inbox poll failed"),
                }
            }
        }));
    }

    async fn write_manifest(
        &self,
        run_id: &str,
        events_seen: usize,
        dispatched: usize,
        skipped: usize,
        suspended: usize,
        failed: usize,
    ) {
        if !self.ledger.lock().await.should_write_manifest(run_id) {
            debug!(%run_id, "Manifest already written for run");
            return;
        }

        let Some(state_dir) = &self.settings.state_dir else {
            return;
        };

        let manifest = RunManifest {
            run_id: run_id.to_string(),
            finished_at: chrono::Utc::now(),
            events_seen,
            dispatched,
            skipped,
            suspended,
            failed,
        };

        let runs_dir = state_dir.join("runs");
        let path = runs_dir.join(format!("{run_id}.json"));
        let write = async {
            tokio::fs::create_dir_all(&runs_dir).await?;
            let json = serde_json::to_string_pretty(&manifest)?;
            tokio::fs::write(&path, json).await?;
            Ok::<_, anyhow::Error>(())
        };

        if let Err(e) = write.await {
            warn!(error = %e, path = %path.display(), "Failed to write run manifest");
        }
    }

    /// Graceful, idempotent shutdown.
    ///
    /// A concurrent second caller blocks until the first finishes, then
    /// returns without repeating work. Every step runs under a bounded
    /// timeout; a timeout is logged, never fatal.
    pub async fn shutdown(&self) {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            debug!("Shutdown already completed");
            return;
        }

        info!("Shutting down");
        let step_timeout = self.settings.shutdown_step_timeout;

        if let Some(task) = self.inbox_task.lock().await.take() {
            task.abort();
            if timeout(step_timeout, async { let _ = task.await; })
                .await
                .is_err()
            {
                warn!("Inbox loop did not stop within the shutdown timeout");
            }
        }

        if let Some(scheduler) = &self.scheduler {
            let canceled = scheduler.cancel_pending();
            debug!(canceled, "Scheduler tasks canceled");
        }

        let cleanups: Vec<CleanupFn> = self.cleanups.lock().await.drain(..).collect();
        for (idx, cleanup) in cleanups.into_iter().enumerate() {
            if timeout(step_timeout, cleanup()).await.is_err() {
                warn!(idx, "Cleanup callback timed out");
            }
        }

        match timeout(step_timeout, async {
            self.cache.lock().await.flush().await
        })
        .await
        {
            Ok(Err(e)) => warn!(error = %e, "Fingerprint cache flush failed during shutdown"),
            Err(_) => warn!("Fingerprint cache flush timed out during shutdown"),
            Ok(Ok(())) => {}
        }

        let still_pending = self.pending.pending_count();
        if still_pending > 0 {
            info!(still_pending, "Shutting down with unresolved audits");
        }

        *done = true;
        info!("Shutdown complete");
    }
}

/// Parse `key: value` lines from a reply body into an info map.
///
/// Lines without a colon are ignored; keys are lowercased with spaces
/// collapsed to underscores so "Company Name: Acme" lands on the
/// canonical field.
pub fn parse_reply_fields(body: &str) -> std::collections::BTreeMap<String, String> {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim().to_lowercase().replace(' ', "_");
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key, value.to_string()))
        })
        .collect()
}
