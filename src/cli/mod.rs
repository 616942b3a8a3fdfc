//! Command-line interface for dealflow.
//!
//! Operational inspection commands: the audit trail, the fingerprint
//! cache, and the resolved configuration. The orchestrator itself is
//! embedded by a host binary that wires in the concrete backends.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config;
use crate::core::{AuditLog, FingerprintCache};

/// dealflow - event-to-CRM workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "dealflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List audit records
    Audit {
        /// Only show records for this event id
        #[arg(short, long)]
        event: Option<String>,

        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show fingerprint cache statistics
    Cache,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Audit { event, limit } => show_audit(event.as_deref(), *limit).await,
            Commands::Cache => show_cache().await,
            Commands::Config => show_config(),
        }
    }
}

async fn show_audit(event: Option<&str>, limit: usize) -> Result<()> {
    let config = config::config()?;
    let log = AuditLog::open(config.audit_log_path())
        .await
        .context("Failed to open audit log")?;

    let records = match event {
        Some(event_id) => log.entries_for_event(event_id).await?,
        None => log.load_entries().await?,
    };

    if records.is_empty() {
        println!("No audit records.");
        return Ok(());
    }

    for record in records.iter().rev().take(limit) {
        println!(
            "{}  {}  {:?}/{:?}  {}  {}  event={}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.audit_id,
            record.request_type,
            record.stage,
            record.responder,
            record.outcome,
            record.event_id.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

async fn show_cache() -> Result<()> {
    let config = config::config()?;
    let cache = FingerprintCache::load(config.fingerprint_cache_path())
        .await
        .context("Failed to load fingerprint cache")?;

    println!("Fingerprint cache: {}", cache.path().display());
    println!("Cached negative decisions: {}", cache.len());

    Ok(())
}

fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("home: {}", config.home.display());
    match &config.config_file {
        Some(path) => println!("config file: {}", path.display()),
        None => println!("config file: (defaults)"),
    }
    println!("trigger words: {}", config.trigger_words.join(", "));
    println!("soft trigger threshold: {}", config.soft_trigger_threshold);
    println!("internal agent: {}", config.internal_agent);
    println!("group agents: {}", config.group_agents.join(", "));
    println!(
        "concurrency: research={} crm={}",
        config.research_concurrency, config.crm_concurrency
    );
    println!(
        "failure alert threshold: {}",
        config.failure_alert_threshold
    );

    Ok(())
}
