//! Per-event workflow state machine.
//!
//! Drives one event through trigger → extraction → conditional HITL →
//! research fan-out → CRM dispatch. Events that wait on a human suspend
//! with an `EventContext` the orchestrator stores until the matching
//! inbox reply arrives, then resume through one of the `continue_after_*`
//! paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{CrmSink, Extractor, TriggerClassifier};
use crate::core::fingerprint::{rule_hash, FingerprintCache, NegativeDecision};
use crate::core::gate::ConcurrencyGate;
use crate::core::hitl::{HitlCoordinator, HitlStatus};
use crate::core::ledger::StepLedger;
use crate::core::research::ResearchCoordinator;
use crate::domain::{CalendarEvent, HitlDecision, ResearchStatus, TriggerKind};

/// Agent wiring and thresholds for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Soft triggers below this confidence are skipped
    pub soft_trigger_threshold: f64,

    /// Agent consulted first; may suspend the event on missing details or
    /// an existing report
    pub internal_agent: String,

    /// Agents fanned out concurrently as a fail-fast group
    pub group_agents: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            soft_trigger_threshold: 0.6,
            internal_agent: "internal_research".to_string(),
            group_agents: vec!["dossier".to_string(), "similar_companies".to_string()],
        }
    }
}

/// Where one event ended up this run.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Unchanged since a cached negative decision
    SkippedUnchanged,

    /// No trigger word matched
    NoTrigger,

    /// Soft trigger below the confidence threshold
    BelowThreshold,

    /// Suspended waiting for missing info from the requestor. Carries the
    /// context the orchestrator must hold for the resume.
    AwaitingInfo { audit_id: Uuid, ctx: EventContext },

    /// Suspended waiting for a dossier go/no-go
    AwaitingDecision { audit_id: Uuid, ctx: EventContext },

    /// Record delivered to the CRM
    Dispatched,
}

/// State carried across a suspension, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub run_id: String,
    pub event: CalendarEvent,
    pub info: BTreeMap<String, String>,
}

/// The per-event workflow state machine.
pub struct EventPipeline {
    classifier: Arc<dyn TriggerClassifier>,
    extractor: Arc<dyn Extractor>,
    crm: Arc<dyn CrmSink>,
    crm_gate: ConcurrencyGate,
    cache: Arc<Mutex<FingerprintCache>>,
    ledger: Arc<Mutex<StepLedger>>,
    research: Arc<ResearchCoordinator>,
    hitl: Arc<HitlCoordinator>,
    config: PipelineConfig,
}

impl EventPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: Arc<dyn TriggerClassifier>,
        extractor: Arc<dyn Extractor>,
        crm: Arc<dyn CrmSink>,
        crm_gate: ConcurrencyGate,
        cache: Arc<Mutex<FingerprintCache>>,
        ledger: Arc<Mutex<StepLedger>>,
        research: Arc<ResearchCoordinator>,
        hitl: Arc<HitlCoordinator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            classifier,
            extractor,
            crm,
            crm_gate,
            cache,
            ledger,
            research,
            hitl,
            config,
        }
    }

    /// Run one event through the pipeline from the top.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn process(&self, run_id: &str, event: &CalendarEvent) -> Result<PipelineOutcome> {
        let rules = rule_hash(&self.classifier.trigger_words());

        if self.cache.lock().await.should_skip(event, &rules) {
            self.record_step(run_id, &event.id, "skip_unchanged", None).await;
            return Ok(PipelineOutcome::SkippedUnchanged);
        }

        let trigger = self
            .classifier
            .check(event)
            .await
            .context("Trigger classification failed")?;

        if !trigger.matched {
            self.cache
                .lock()
                .await
                .record_no_trigger(event, &rules, NegativeDecision::NoTrigger);
            self.record_step(run_id, &event.id, "no_trigger", None).await;
            return Ok(PipelineOutcome::NoTrigger);
        }

        if trigger.kind == TriggerKind::Soft
            && trigger.confidence < self.config.soft_trigger_threshold
        {
            self.cache.lock().await.record_no_trigger(
                event,
                &rules,
                NegativeDecision::SkippedTriggerThreshold,
            );
            self.record_step(
                run_id,
                &event.id,
                "below_threshold",
                Some(&format!("confidence={:.2}", trigger.confidence)),
            )
            .await;
            return Ok(PipelineOutcome::BelowThreshold);
        }

        // A firing trigger invalidates any cached negative decision.
        self.cache.lock().await.forget(&event.id);
        self.record_step(run_id, &event.id, "trigger", trigger.matched_word.as_deref())
            .await;

        let extraction = self
            .extractor
            .extract(event)
            .await
            .context("Extraction failed")?
            .normalized();
        self.record_step(run_id, &event.id, "extraction", None).await;

        let mut info = extraction.info.clone();

        if !extraction.is_complete {
            let outcome = self.hitl.request_info(event, &extraction).await?;
            if outcome.status == HitlStatus::Pending {
                self.record_step(run_id, &event.id, "awaiting_info", None).await;
                return Ok(PipelineOutcome::AwaitingInfo {
                    audit_id: outcome.audit_id,
                    ctx: EventContext {
                        run_id: run_id.to_string(),
                        event: event.clone(),
                        info: extraction.info.clone(),
                    },
                });
            }
            // Completed with merged fields, or the deterministic fallback;
            // either way the pipeline continues with what it has.
            info = outcome.info;
        }

        let ctx = EventContext {
            run_id: run_id.to_string(),
            event: event.clone(),
            info,
        };

        self.research_and_dispatch(ctx, false).await
    }

    /// Resume after the requestor supplied missing fields.
    ///
    /// The new fields are merged over the stored context and the internal
    /// research call is forced so the changed info is actually used.
    pub async fn continue_after_missing_info(
        &self,
        mut ctx: EventContext,
        fields: BTreeMap<String, String>,
    ) -> Result<PipelineOutcome> {
        for (key, value) in fields {
            ctx.info.insert(key, value);
        }
        ctx.info = crate::domain::normalize_info(std::mem::take(&mut ctx.info));

        info!(event_id = %ctx.event.id, "Resuming after missing-info reply");
        self.research_and_dispatch(ctx, true).await
    }

    /// Resume after the requestor decided whether a dossier is wanted.
    pub async fn continue_after_dossier_decision(
        &self,
        ctx: EventContext,
        approved: bool,
    ) -> Result<PipelineOutcome> {
        info!(event_id = %ctx.event.id, approved, "Resuming after dossier decision");

        if !approved {
            self.record_step(&ctx.run_id, &ctx.event.id, "dossier_declined", None)
                .await;
            return self.dispatch(&ctx).await;
        }

        self.group_research_and_dispatch(&ctx, true).await
    }

    /// Internal research, then conditional confirmation, then the
    /// concurrent group, then dispatch.
    async fn research_and_dispatch(
        &self,
        ctx: EventContext,
        force: bool,
    ) -> Result<PipelineOutcome> {
        let internal = self
            .research
            .run_agent(&self.config.internal_agent, &ctx.event, &ctx.info, force)
            .await?;
        self.record_step(&ctx.run_id, &ctx.event.id, "internal_research", None)
            .await;

        if let Some(result) = internal {
            match result.status {
                ResearchStatus::AwaitRequestorDetails => {
                    let extraction = crate::domain::ExtractionResult {
                        info: ctx.info.clone(),
                        is_complete: false,
                        confidence: 1.0,
                    };
                    let outcome = self.hitl.request_info(&ctx.event, &extraction).await?;
                    match outcome.status {
                        HitlStatus::Pending => {
                            self.record_step(&ctx.run_id, &ctx.event.id, "awaiting_info", None)
                                .await;
                            return Ok(PipelineOutcome::AwaitingInfo {
                                audit_id: outcome.audit_id,
                                ctx,
                            });
                        }
                        HitlStatus::Completed => {
                            let mut ctx = ctx;
                            ctx.info = outcome.info;
                            // The info changed; the cached Await result
                            // must not short-circuit the retry.
                            return Box::pin(self.research_and_dispatch(ctx, true)).await;
                        }
                        _ => {
                            warn!(
                                event_id = %ctx.event.id,
                                "Details still missing and no way to ask; dispatching partial record"
                            );
                        }
                    }
                }
                ResearchStatus::AwaitRequestorDecision => {
                    let outcome = self
                        .hitl
                        .request_dossier_confirmation(&ctx.event, &ctx.info, Some(&result.payload))
                        .await
                        .map_err(anyhow::Error::from)?;

                    match outcome.decision {
                        HitlDecision::Pending => {
                            self.record_step(&ctx.run_id, &ctx.event.id, "awaiting_decision", None)
                                .await;
                            return Ok(PipelineOutcome::AwaitingDecision {
                                audit_id: outcome.audit_id,
                                ctx,
                            });
                        }
                        HitlDecision::Declined => {
                            self.record_step(&ctx.run_id, &ctx.event.id, "dossier_declined", None)
                                .await;
                            return self.dispatch(&ctx).await;
                        }
                        HitlDecision::Approved => {}
                    }
                }
                ResearchStatus::Completed | ResearchStatus::Failed => {}
            }
        }

        self.group_research_and_dispatch(&ctx, force).await
    }

    async fn group_research_and_dispatch(
        &self,
        ctx: &EventContext,
        force: bool,
    ) -> Result<PipelineOutcome> {
        if !self.config.group_agents.is_empty() {
            self.research
                .run_group(&self.config.group_agents, &ctx.event, &ctx.info, force)
                .await
                .map_err(anyhow::Error::from)
                .context("Concurrent research group failed")?;
            self.record_step(&ctx.run_id, &ctx.event.id, "research_group", None)
                .await;
        }

        self.dispatch(ctx).await
    }

    /// Deliver the qualified record to the CRM under the dispatch gate.
    async fn dispatch(&self, ctx: &EventContext) -> Result<PipelineOutcome> {
        let errors = self.research.take_errors(&ctx.event.id);
        if !errors.is_empty() {
            warn!(
                event_id = %ctx.event.id,
                research_errors = ?errors,
                "Dispatching with partial research"
            );
        }

        let _permit = self.crm_gate.acquire().await?;
        self.crm
            .send(&ctx.event, &ctx.info)
            .await
            .context("CRM dispatch failed")?;

        self.research.clear_event(&ctx.event.id);
        self.record_step(&ctx.run_id, &ctx.event.id, "crm_dispatch", None)
            .await;
        info!(event_id = %ctx.event.id, "Event dispatched to CRM");

        Ok(PipelineOutcome::Dispatched)
    }

    async fn record_step(&self, run_id: &str, event_id: &str, step: &str, extra: Option<&str>) {
        self.ledger
            .lock()
            .await
            .record_step(run_id, event_id, step, extra);
    }
}
