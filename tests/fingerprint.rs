//! Fingerprint Cache Integration Tests
//!
//! Tests for negative-decision caching, invalidation, and persistence.

use chrono::Utc;
use dealflow::core::fingerprint::{rule_hash, FingerprintCache, NegativeDecision};
use dealflow::domain::CalendarEvent;
use tempfile::TempDir;

fn event(id: &str, summary: &str, description: &str) -> CalendarEvent {
    CalendarEvent {
        id: id.to_string(),
        summary: summary.to_string(),
        description: description.to_string(),
        updated: Utc::now().to_rfc3339(),
        organizer: "alice@example.com".to_string(),
        creator: String::new(),
    }
}

#[tokio::test]
async fn test_no_trigger_then_replay_then_edit() {
    let temp = TempDir::new().unwrap();
    let mut cache = FingerprintCache::load(temp.path().join("fp.json"))
        .await
        .unwrap();

    let e1 = event("e1", "Kickoff", "");

    // No trigger detected: the decision is cached
    assert!(!cache.should_skip(&e1, "h1"));
    cache.record_no_trigger(&e1, "h1", NegativeDecision::NoTrigger);

    // Replaying the same event and hash skips
    assert!(cache.should_skip(&e1, "h1"));

    // Changing the summary no longer skips
    let edited = event("e1", "Kickoff with Acme", "");
    assert!(!cache.should_skip(&edited, "h1"));
}

#[tokio::test]
async fn test_ruleset_change_forces_reprocessing() {
    let temp = TempDir::new().unwrap();
    let mut cache = FingerprintCache::load(temp.path().join("fp.json"))
        .await
        .unwrap();

    let e1 = event("e1", "Weekly sync", "");
    cache.record_no_trigger(&e1, "h1", NegativeDecision::NoTrigger);

    assert!(cache.should_skip(&e1, "h1"));
    assert!(!cache.should_skip(&e1, "h2"));
}

#[tokio::test]
async fn test_threshold_decision_cached_like_no_trigger() {
    let temp = TempDir::new().unwrap();
    let mut cache = FingerprintCache::load(temp.path().join("fp.json"))
        .await
        .unwrap();

    let e1 = event("e1", "Maybe a kickoff", "");
    cache.record_no_trigger(&e1, "h1", NegativeDecision::SkippedTriggerThreshold);

    assert!(cache.should_skip(&e1, "h1"));
}

#[tokio::test]
async fn test_forget_after_trigger_fires() {
    let temp = TempDir::new().unwrap();
    let mut cache = FingerprintCache::load(temp.path().join("fp.json"))
        .await
        .unwrap();

    let e1 = event("e1", "Kickoff", "");
    cache.record_no_trigger(&e1, "h1", NegativeDecision::NoTrigger);
    assert_eq!(cache.len(), 1);

    cache.forget("e1");
    assert!(cache.is_empty());
    assert!(!cache.should_skip(&e1, "h1"));
}

#[tokio::test]
async fn test_decisions_survive_flush_and_reload() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("fp.json");

    let e1 = event("e1", "Kickoff", "agenda attached");
    let e2 = event("e2", "Standup", "");

    {
        let mut cache = FingerprintCache::load(path.clone()).await.unwrap();
        cache.record_no_trigger(&e1, "h1", NegativeDecision::NoTrigger);
        cache.record_no_trigger(&e2, "h1", NegativeDecision::SkippedTriggerThreshold);
        cache.flush().await.unwrap();
    }

    let mut cache = FingerprintCache::load(path).await.unwrap();
    assert_eq!(cache.len(), 2);
    assert!(cache.should_skip(&e1, "h1"));
    assert!(cache.should_skip(&e2, "h1"));
}

#[tokio::test]
async fn test_flush_is_noop_when_clean() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("fp.json");

    let mut cache = FingerprintCache::load(path.clone()).await.unwrap();
    cache.flush().await.unwrap();

    // Nothing was dirty, so no file was written
    assert!(!path.exists());
}

#[tokio::test]
async fn test_corrupt_cache_recovers_empty() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("fp.json");
    tokio::fs::write(&path, b"\x00\xffgarbage").await.unwrap();

    let mut cache = FingerprintCache::load(path.clone()).await.unwrap();
    assert!(cache.is_empty());

    // The cache is usable after recovery
    let e1 = event("e1", "Kickoff", "");
    cache.record_no_trigger(&e1, "h1", NegativeDecision::NoTrigger);
    cache.flush().await.unwrap();

    let mut reloaded = FingerprintCache::load(path).await.unwrap();
    assert!(reloaded.should_skip(&e1, "h1"));
}

#[test]
fn test_rule_hash_reflects_word_set() {
    let words_a = vec!["kickoff".to_string(), "intro".to_string()];
    let words_b = vec!["intro".to_string(), "kickoff".to_string()];
    let words_c = vec!["kickoff".to_string(), "intro".to_string(), "demo".to_string()];

    assert_eq!(rule_hash(&words_a), rule_hash(&words_b));
    assert_ne!(rule_hash(&words_a), rule_hash(&words_c));
}
