//! Append-only audit log with file-based persistence.
//!
//! Every HITL request/response pair is stored as newline-delimited JSON
//! (JSONL), one record per line, never mutated or deleted. The log is the
//! durable side of audit correlation: an orchestrator resuming after a
//! crash checks `has_response` before re-requesting a decision.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{AuditRecord, AuditStage, RequestType};

/// File-based audit log using JSONL format.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open (or create the parent directory for) an audit log at `path`.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Generates a fresh audit id when the caller does
    /// not supply one; returns the id either way.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        event_id: Option<&str>,
        request_type: RequestType,
        stage: AuditStage,
        responder: &str,
        outcome: &str,
        payload: Option<Value>,
        audit_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let audit_id = audit_id.unwrap_or_else(Uuid::new_v4);

        let mut record = AuditRecord::new(
            audit_id,
            event_id.map(str::to_string),
            request_type,
            stage,
            responder.to_string(),
            outcome.to_string(),
        );
        if let Some(payload) = payload {
            record = record.with_payload(payload);
        }

        self.append(&record).await?;

        Ok(audit_id)
    }

    /// Append a pre-built record to the log.
    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;

        let json = serde_json::to_string(record).context("Failed to serialize audit record")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write audit record")?;
        file.flush().await.context("Failed to flush audit record")?;

        Ok(())
    }

    /// Load every parseable record in order. Unparsable lines are skipped
    /// with a warning.
    pub async fn load_entries(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(error = %e, "Skipping unparsable audit record");
                }
            }
        }

        Ok(records)
    }

    /// Whether a response record exists for the given audit id.
    pub async fn has_response(&self, audit_id: Uuid) -> Result<bool> {
        let records = self.load_entries().await?;

        Ok(records
            .iter()
            .any(|r| r.audit_id == audit_id && r.stage == AuditStage::Response))
    }

    /// All records concerning one event, in log order.
    pub async fn entries_for_event(&self, event_id: &str) -> Result<Vec<AuditRecord>> {
        let records = self.load_entries().await?;

        Ok(records
            .into_iter()
            .filter(|r| r.event_id.as_deref() == Some(event_id))
            .collect())
    }
}
