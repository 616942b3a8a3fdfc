//! Externally-sourced calendar events.
//!
//! Events are immutable once polled; the pipeline only ever reads them.
//! Identity (`id`) plus a content fingerprint is all the cache retains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A calendar event as delivered by the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Source-assigned identifier (stable across updates)
    pub id: String,

    /// Event title
    pub summary: String,

    /// Free-form body text
    #[serde(default)]
    pub description: String,

    /// Last-modified timestamp as supplied by the source (RFC 3339)
    #[serde(default)]
    pub updated: String,

    /// Organizer email address
    #[serde(default)]
    pub organizer: String,

    /// Creator email address
    #[serde(default)]
    pub creator: String,
}

impl CalendarEvent {
    /// Parse the source-supplied `updated` timestamp, if present and valid.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.updated)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Contact to direct human follow-ups to: organizer, falling back to creator.
    pub fn requestor(&self) -> &str {
        if self.organizer.is_empty() {
            &self.creator
        } else {
            &self.organizer
        }
    }
}
