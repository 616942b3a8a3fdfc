//! Configuration for dealflow paths and tunables.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DEALFLOW_HOME)
//! 2. Config file (.dealflow/config.yaml)
//! 3. Defaults (~/.dealflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .dealflow/config.yaml
//! - Paths in the config file are relative to the config file's parent

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Deserialize;

use crate::core::hitl::HitlConfig;
use crate::core::orchestrator::OrchestratorSettings;
use crate::core::pipeline::PipelineConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: Option<PipelineSection>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencySection>,
    #[serde(default)]
    pub hitl: Option<HitlSection>,
    #[serde(default)]
    pub orchestrator: Option<OrchestratorSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to config file)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSection {
    pub soft_trigger_threshold: Option<f64>,
    pub trigger_words: Option<Vec<String>>,
    pub internal_agent: Option<String>,
    pub group_agents: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConcurrencySection {
    pub research: Option<usize>,
    pub crm: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HitlSection {
    pub reminder_delay_secs: Option<u64>,
    pub escalation_delay_secs: Option<u64>,
    pub admin_reminder_interval_hours: Option<u64>,
    pub escalation_recipient: Option<String>,
    pub admin_recipient: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorSection {
    pub failure_alert_threshold: Option<u32>,
    pub inbox_poll_interval_secs: Option<u64>,
    pub shutdown_step_timeout_secs: Option<u64>,
}

/// Resolved configuration with absolute paths and validated tunables.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the state directory
    pub home: PathBuf,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub soft_trigger_threshold: f64,
    pub trigger_words: Vec<String>,
    pub internal_agent: String,
    pub group_agents: Vec<String>,

    pub research_concurrency: usize,
    pub crm_concurrency: usize,

    pub reminder_delay: Duration,
    pub escalation_delay: Duration,
    pub admin_reminder_interval: Duration,
    pub escalation_recipient: Option<String>,
    pub admin_recipient: Option<String>,

    pub failure_alert_threshold: u32,
    pub inbox_poll_interval: Duration,
    pub shutdown_step_timeout: Duration,
}

impl ResolvedConfig {
    /// Invalid thresholds are configuration errors: fail fast, before any
    /// component is built on top of them.
    pub fn validate(&self) -> Result<()> {
        if self.research_concurrency == 0 {
            anyhow::bail!("concurrency.research must be at least 1");
        }
        if self.crm_concurrency == 0 {
            anyhow::bail!("concurrency.crm must be at least 1");
        }
        if self.failure_alert_threshold == 0 {
            anyhow::bail!("orchestrator.failure_alert_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.soft_trigger_threshold) {
            anyhow::bail!("pipeline.soft_trigger_threshold must be within [0, 1]");
        }
        Ok(())
    }

    pub fn fingerprint_cache_path(&self) -> PathBuf {
        self.home.join("fingerprints.json")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.home.join("audit.jsonl")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            soft_trigger_threshold: self.soft_trigger_threshold,
            internal_agent: self.internal_agent.clone(),
            group_agents: self.group_agents.clone(),
        }
    }

    pub fn hitl_config(&self) -> HitlConfig {
        HitlConfig {
            reminder_delay: self.reminder_delay,
            escalation_delay: self.escalation_delay,
            admin_reminder_interval: self.admin_reminder_interval,
            escalation_recipient: self.escalation_recipient.clone(),
            admin_recipient: self.admin_recipient.clone(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            failure_alert_threshold: self.failure_alert_threshold,
            inbox_poll_interval: self.inbox_poll_interval,
            shutdown_step_timeout: self.shutdown_step_timeout,
            state_dir: Some(self.home.clone()),
        }
    }

    /// Take an advisory exclusive lock on the state directory so two
    /// orchestrator processes cannot share the cache and audit files.
    /// The lock is held for as long as the returned file is alive.
    pub fn lock_state_dir(&self) -> Result<std::fs::File> {
        std::fs::create_dir_all(&self.home)
            .with_context(|| format!("Failed to create state directory: {}", self.home.display()))?;

        let lock_path = self.home.join(".lock");
        let file = std::fs::File::create(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!(
                "Another dealflow process holds the state directory: {}",
                self.home.display()
            )
        })?;

        Ok(file)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".dealflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".dealflow");

    let config_file = find_config_file();
    let parsed = match &config_file {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };

    // Resolve home path
    let home = if let Ok(env_home) = std::env::var("DEALFLOW_HOME") {
        PathBuf::from(env_home)
    } else if let Some(home_path) = parsed.as_ref().and_then(|c| c.paths.home.as_ref()) {
        let dealflow_dir = config_file
            .as_ref()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));
        resolve_path(dealflow_dir, home_path)
    } else {
        default_home
    };

    let pipeline = parsed.as_ref().and_then(|c| c.pipeline.clone()).unwrap_or_default();
    let concurrency = parsed
        .as_ref()
        .and_then(|c| c.concurrency.clone())
        .unwrap_or_default();
    let hitl = parsed.as_ref().and_then(|c| c.hitl.clone()).unwrap_or_default();
    let orchestrator = parsed
        .as_ref()
        .and_then(|c| c.orchestrator.clone())
        .unwrap_or_default();

    let config = ResolvedConfig {
        home,
        config_file,
        soft_trigger_threshold: pipeline.soft_trigger_threshold.unwrap_or(0.6),
        trigger_words: pipeline.trigger_words.unwrap_or_else(|| {
            vec![
                "kickoff".to_string(),
                "intro".to_string(),
                "discovery".to_string(),
                "demo".to_string(),
            ]
        }),
        internal_agent: pipeline
            .internal_agent
            .unwrap_or_else(|| "internal_research".to_string()),
        group_agents: pipeline
            .group_agents
            .unwrap_or_else(|| vec!["dossier".to_string(), "similar_companies".to_string()]),
        research_concurrency: concurrency.research.unwrap_or(3),
        crm_concurrency: concurrency.crm.unwrap_or(2),
        reminder_delay: Duration::from_secs(hitl.reminder_delay_secs.unwrap_or(4 * 3600)),
        escalation_delay: Duration::from_secs(hitl.escalation_delay_secs.unwrap_or(24 * 3600)),
        admin_reminder_interval: Duration::from_secs(
            hitl.admin_reminder_interval_hours.unwrap_or(24) * 3600,
        ),
        escalation_recipient: hitl.escalation_recipient,
        admin_recipient: hitl.admin_recipient,
        failure_alert_threshold: orchestrator.failure_alert_threshold.unwrap_or(3),
        inbox_poll_interval: Duration::from_secs(
            orchestrator.inbox_poll_interval_secs.unwrap_or(60),
        ),
        shutdown_step_timeout: Duration::from_secs(
            orchestrator.shutdown_step_timeout_secs.unwrap_or(5),
        ),
    };

    config.validate()?;

    Ok(config)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{e:#}")));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
