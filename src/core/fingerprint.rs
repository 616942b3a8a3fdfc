//! Negative-decision cache keyed by event fingerprints.
//!
//! When an event does not trigger the pipeline, the decision is remembered
//! so unchanged events are not reclassified on every poll. An entry only
//! suppresses reprocessing while the event content, the trigger ruleset,
//! and the classifier version all still match, and while the entry is
//! younger than the retention ceiling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::CalendarEvent;

/// Entries older than this are purged lazily on read.
const RETENTION_DAYS: i64 = 30;

/// Bumped when classification semantics change; mismatched entries are
/// discarded.
const CLASSIFICATION_VERSION: u32 = 1;

/// On-disk file format version.
const FILE_VERSION: u32 = 1;

/// The negative decision that was cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeDecision {
    /// No trigger word matched
    NoTrigger,

    /// A soft trigger matched below the confidence threshold
    SkippedTriggerThreshold,
}

/// One cached negative decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Content fingerprint at decision time
    pub fingerprint: String,

    /// The event's `updated` value at decision time
    pub updated: String,

    /// Hash of the trigger-word set the decision was made under
    pub rule_hash: String,

    pub decision: NegativeDecision,

    pub first_seen: DateTime<Utc>,

    pub last_seen: DateTime<Utc>,

    pub classification_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

/// File-backed cache of negative trigger decisions.
pub struct FingerprintCache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
    dirty: bool,
}

impl FingerprintCache {
    /// Load the cache from `path`. Corrupt or unreadable state is logged
    /// and treated as empty, never a fatal error.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
        }

        let entries = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) if file.version == FILE_VERSION => file.entries,
                Ok(file) => {
                    warn!(
                        found = file.version,
                        expected = FILE_VERSION,
                        "Fingerprint cache version mismatch, starting empty"
                    );
                    HashMap::new()
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Corrupt fingerprint cache, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this event can be skipped without reclassification.
    ///
    /// True only when the stored fingerprint and rule hash both equal the
    /// current values and the entry is not stale. A fingerprint mismatch on
    /// a known id implicitly forgets the stale entry; stale entries are
    /// purged on read.
    pub fn should_skip(&mut self, event: &CalendarEvent, rule_hash: &str) -> bool {
        let (stored_version, stored_last_seen, stored_fingerprint, stored_rule_hash) =
            match self.entries.get(&event.id) {
                Some(e) => (
                    e.classification_version,
                    e.last_seen,
                    e.fingerprint.clone(),
                    e.rule_hash.clone(),
                ),
                None => return false,
            };

        if stored_version != CLASSIFICATION_VERSION {
            debug!(event_id = %event.id, "Classifier version changed, forgetting entry");
            self.forget(&event.id);
            return false;
        }

        // Prefer the event-supplied timestamp as age evidence, fall back to
        // our own last observation time.
        let reference = event.updated_at().unwrap_or(stored_last_seen);
        if Utc::now() - reference > Duration::days(RETENTION_DAYS) {
            debug!(event_id = %event.id, "Cache entry stale, purging");
            self.forget(&event.id);
            return false;
        }

        if stored_fingerprint != event_fingerprint(event) {
            debug!(event_id = %event.id, "Event content changed, forgetting entry");
            self.forget(&event.id);
            return false;
        }

        if stored_rule_hash != rule_hash {
            debug!(event_id = %event.id, "Trigger ruleset changed, reprocessing");
            return false;
        }

        // Refresh the observation time so live events do not age out.
        if let Some(entry) = self.entries.get_mut(&event.id) {
            entry.last_seen = Utc::now();
            self.dirty = true;
        }

        true
    }

    /// Remember a negative trigger decision for this event.
    pub fn record_no_trigger(
        &mut self,
        event: &CalendarEvent,
        rule_hash: &str,
        decision: NegativeDecision,
    ) {
        let now = Utc::now();
        let first_seen = self
            .entries
            .get(&event.id)
            .map(|e| e.first_seen)
            .unwrap_or(now);

        self.entries.insert(
            event.id.clone(),
            CacheEntry {
                fingerprint: event_fingerprint(event),
                updated: event.updated.clone(),
                rule_hash: rule_hash.to_string(),
                decision,
                first_seen,
                last_seen: now,
                classification_version: CLASSIFICATION_VERSION,
            },
        );
        self.dirty = true;
    }

    /// Drop the cached decision for an event id (a trigger fired for it).
    pub fn forget(&mut self, event_id: &str) {
        if self.entries.remove(event_id).is_some() {
            self.dirty = true;
        }
    }

    /// Persist batched changes via atomic file replacement. A no-op when
    /// nothing changed since the last flush.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let file = CacheFile {
            version: FILE_VERSION,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize cache")?;

        // Write-temp, fsync, rename: a crash mid-write never corrupts the
        // previous cache file.
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .await
                .with_context(|| format!("Failed to create temp cache file: {}", tmp_path.display()))?;
            tmp.write_all(json.as_bytes())
                .await
                .context("Failed to write cache")?;
            tmp.sync_all().await.context("Failed to sync cache")?;
        }
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace cache file: {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

/// Stable fingerprint over an event's identity-relevant fields.
pub fn event_fingerprint(event: &CalendarEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.id.as_bytes());
    hasher.update(b"|");
    hasher.update(event.updated.as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_text(&event.summary).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_text(&event.description).as_bytes());

    hex::encode(&hasher.finalize()[..8])
}

/// Hash of the active trigger-word set, order-insensitive.
pub fn rule_hash(words: &[String]) -> String {
    let mut sorted: Vec<String> = words.iter().map(|w| w.trim().to_lowercase()).collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for word in &sorted {
        hasher.update(word.as_bytes());
        hasher.update(b"\n");
    }

    hex::encode(&hasher.finalize()[..8])
}

/// Lowercase and collapse runs of whitespace so cosmetic edits do not
/// invalidate fingerprints.
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
