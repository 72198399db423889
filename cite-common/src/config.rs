//! Bootstrap configuration for the citation repair services
//!
//! Configuration is a single TOML file. Every section is optional and falls
//! back to built-in defaults, so an empty file (or no file at all) yields a
//! working configuration.
//!
//! # Resolution order
//!
//! 1. Explicit path (command-line / caller supplied)
//! 2. `CITE_REPAIR_CONFIG` environment variable
//! 3. Platform config directory (`~/.config/cite-repair/config.toml` on Linux)
//! 4. Built-in defaults

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "CITE_REPAIR_CONFIG";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Phase orchestrator settings
    pub orchestrator: OrchestratorSettings,
    /// Batch processor settings
    pub batch: BatchSettings,
    /// Transactional replacer settings
    pub replacer: ReplacerSettings,
    /// Job scheduler settings
    pub scheduler: SchedulerSettings,
    /// Persistence settings
    pub storage: StorageSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Phase orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Retry budget for phases classified as retryable
    pub max_retries: u32,
    /// Base delay for exponential phase retry backoff
    pub retry_base_delay_ms: u64,
    /// Continue with the next phase when a phase fails unrecoverably
    pub enable_partial_validation: bool,
    /// Number of finished sessions kept in history
    pub history_limit: usize,
    /// Poll interval while paused
    pub pause_poll_interval_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1000,
            enable_partial_validation: true,
            history_limit: 10,
            pause_poll_interval_ms: 100,
        }
    }
}

/// Batch processor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Items per batch
    pub batch_size: usize,
    /// Soft cap on in-flight requests; the effective batch never exceeds it
    pub max_concurrent_requests: usize,
    /// Pause between consecutive batches
    pub rate_limit_delay_ms: u64,
    /// Persist a checkpoint every N processed items (0 disables checkpoints)
    pub checkpoint_interval: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_requests: 10,
            rate_limit_delay_ms: 1000,
            checkpoint_interval: 50,
        }
    }
}

/// Transactional replacer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacerSettings {
    /// Snapshot the target record before mutating it
    pub backup_enabled: bool,
    /// Run acceptance checks on the candidate before committing
    pub validate_before_commit: bool,
    /// Commit a batch transaction even when some replacements failed
    pub allow_partial_success: bool,
    /// Domains that are never accepted as replacement sources
    pub blocked_domains: Vec<String>,
    /// Number of finished transactions kept for audit
    pub transaction_history_limit: usize,
}

impl Default for ReplacerSettings {
    fn default() -> Self {
        Self {
            backup_enabled: true,
            validate_before_commit: true,
            allow_partial_success: false,
            blocked_domains: vec![
                "example.com".to_string(),
                "bit.ly".to_string(),
                "tinyurl.com".to_string(),
            ],
            transaction_history_limit: 100,
        }
    }
}

/// Job scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Maximum number of entries executing at the same time
    pub max_concurrent_jobs: usize,
    /// Linear retry backoff unit (delay = retry_delay * retry_count)
    pub retry_delay_ms: u64,
    /// Deferral applied when the concurrency cap is reached
    pub back_pressure_delay_ms: u64,
    /// Health monitor period
    pub health_check_interval_ms: u64,
    /// Executing longer than this is reported as stuck
    pub stuck_job_threshold_ms: u64,
    /// Overdue by more than this is reported as missed
    pub overdue_grace_ms: u64,
    /// Delay before the first run of a newly scheduled entry
    pub initial_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            retry_delay_ms: 60_000,
            back_pressure_delay_ms: 30_000,
            health_check_interval_ms: 60_000,
            stuck_job_threshold_ms: 30 * 60_000,
            overdue_grace_ms: 5 * 60_000,
            initial_delay_ms: 5_000,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory for file-backed checkpoints (in-memory store when unset)
    pub checkpoint_dir: Option<PathBuf>,
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Resolve and load configuration following the documented priority order
    ///
    /// A missing file at the platform location is not an error; defaults are used.
    /// An explicit path (argument or environment) that cannot be read is an error.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
            debug!("No config file at {}, using defaults", path.display());
        }

        Ok(Self::default())
    }

    /// Sanity-check values that would make components misbehave
    pub fn validate(&self) -> Result<()> {
        if self.batch.batch_size == 0 {
            return Err(Error::Config("batch.batch_size must be at least 1".to_string()));
        }
        if self.batch.max_concurrent_requests == 0 {
            return Err(Error::Config(
                "batch.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(Error::Config(
                "scheduler.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.history_limit == 0 {
            return Err(Error::Config(
                "orchestrator.history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Platform-specific default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cite-repair").join("config.toml"))
}

/// Write configuration to disk atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = TomlConfig::from_toml_str("").unwrap();
        assert_eq!(config, TomlConfig::default());
        assert_eq!(config.batch.batch_size, 10);
        assert!(config.replacer.backup_enabled);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            [batch]
            batch_size = 25

            [scheduler]
            max_concurrent_jobs = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.batch.batch_size, 25);
        assert_eq!(config.batch.rate_limit_delay_ms, 1000);
        assert_eq!(config.scheduler.max_concurrent_jobs, 4);
        assert_eq!(config.orchestrator.max_retries, 3);
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = TomlConfig::default();
        config.batch.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = TomlConfig::default();
        config.logging.level = "debug".to_string();
        config.replacer.blocked_domains = vec!["spam.test".to_string()];

        write_toml_config(&config, &path).unwrap();
        let loaded = TomlConfig::resolve(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let result = TomlConfig::resolve(Some(Path::new("/nonexistent/cite-repair.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
