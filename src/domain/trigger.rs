//! Trigger classification and extraction results.
//!
//! Produced once per event per run by the classifier and extractor
//! collaborators; not persisted beyond the run except through the
//! fingerprint cache's negative decisions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How strongly a trigger word matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Always proceeds to extraction
    Hard,

    /// Proceeds only above the configured confidence threshold
    Soft,
}

/// Result of running the trigger classifier over an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResult {
    /// Whether any trigger word matched
    pub matched: bool,

    /// Match strength
    pub kind: TriggerKind,

    /// Classifier confidence in [0, 1]
    pub confidence: f64,

    /// The word that matched (if any)
    pub matched_word: Option<String>,

    /// Which event field the match came from (summary/description)
    pub matched_field: Option<String>,

    /// Surrounding text handed to the extractor
    pub extraction_context: Option<String>,
}

impl TriggerResult {
    /// A non-match with zero confidence.
    pub fn no_match() -> Self {
        Self {
            matched: false,
            kind: TriggerKind::Soft,
            confidence: 0.0,
            matched_word: None,
            matched_field: None,
            extraction_context: None,
        }
    }
}

/// Structured company info pulled out of an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Extracted fields, `company_name`/`company_domain` plus optionals
    pub info: BTreeMap<String, String>,

    /// Whether every required field is present
    pub is_complete: bool,

    /// Extractor confidence in [0, 1]
    pub confidence: f64,
}

impl ExtractionResult {
    /// Resolve field aliases in place and recompute completeness.
    pub fn normalized(mut self) -> Self {
        self.info = normalize_info(self.info);
        self.is_complete = has_required_fields(&self.info);
        self
    }
}

/// Fields that must be present before research can start.
pub const REQUIRED_FIELDS: &[&str] = &["company_name", "company_domain"];

/// Resolve common field-name aliases to their canonical keys.
///
/// Canonical keys win on collision; aliases never overwrite an
/// already-present canonical value.
pub fn normalize_info(info: BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut normalized = BTreeMap::new();
    let mut aliased = Vec::new();

    // Canonical keys land first; aliases are held back so they can never
    // shadow a canonical value that is also present.
    for (key, value) in info {
        match key.as_str() {
            "company" | "name" | "company name" => aliased.push(("company_name", value)),
            "domain" | "website" | "url" => aliased.push(("company_domain", value)),
            _ => {
                normalized.insert(key, value);
            }
        }
    }

    for (canonical, value) in aliased {
        normalized.entry(canonical.to_string()).or_insert(value);
    }

    normalized
}

/// Check that all required fields are present and non-empty.
pub fn has_required_fields(info: &BTreeMap<String, String>) -> bool {
    REQUIRED_FIELDS
        .iter()
        .all(|f| info.get(*f).map(|v| !v.trim().is_empty()).unwrap_or(false))
}
