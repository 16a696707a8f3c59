//! Configuration for phasegate.
//!
//! Settings are read from `.phasegate/phasegate.toml`, then overridden by
//! environment variables, then by CLI flags. Every field has a default, so an
//! absent file yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [lifecycle]
//! max_retries = 3
//! default_phase_timeout_secs = 1800
//!
//! [lifecycle.phase_timeouts]
//! "execution" = 7200
//! "*_validation" = 600
//!
//! [locks]
//! max_write_workers = 4
//! lock_ttl_secs = 600
//!
//! [pools]
//! l1_capacity = 9
//! l2_capacity = 4
//! l1_queue_enabled = true
//! stale_after_secs = 300
//!
//! [continuation]
//! request_timeout_secs = 3600
//! min_progress = 0.0
//!
//! [review]
//! max_iterations = 3
//!
//! [storage]
//! state_dir = ".phasegate/sessions"
//! ```

use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::phase::Phase;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the project-level configuration directory.
pub const CONFIG_DIR: &str = ".phasegate";
/// Name of the configuration file inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "phasegate.toml";

/// Lifecycle controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSection {
    /// Recoverable errors tolerated per phase before escalating to ERROR
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Timeout applied to phases without a specific entry
    #[serde(default)]
    pub default_phase_timeout_secs: Option<u64>,
    /// Per-phase timeouts keyed by phase slug or glob pattern
    #[serde(default)]
    pub phase_timeouts: BTreeMap<String, u64>,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_phase_timeout_secs: None,
            phase_timeouts: BTreeMap::new(),
        }
    }
}

/// Lock manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksSection {
    /// Cap on concurrently registered write-capable workers
    #[serde(default = "default_max_write_workers")]
    pub max_write_workers: usize,
    /// Informational expiry stamped on each lock; never drives release
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

fn default_max_write_workers() -> usize {
    4
}

fn default_lock_ttl_secs() -> u64 {
    600
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            max_write_workers: default_max_write_workers(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsSection {
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,
    #[serde(default = "default_l2_capacity")]
    pub l2_capacity: usize,
    /// Queue L1 requests when the pool is full instead of failing them
    #[serde(default = "default_l1_queue_enabled")]
    pub l1_queue_enabled: bool,
    /// Inactivity after which a slot is considered stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_l1_capacity() -> usize {
    9
}

fn default_l2_capacity() -> usize {
    4
}

fn default_l1_queue_enabled() -> bool {
    true
}

fn default_stale_after_secs() -> u64 {
    300
}

impl Default for PoolsSection {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l2_capacity: default_l2_capacity(),
            l1_queue_enabled: default_l1_queue_enabled(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Continuation control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationSection {
    /// Pending requests older than this are swept to expired
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Fraction of phases (0.0 to 1.0) that must be complete to continue
    #[serde(default)]
    pub min_progress: f64,
}

fn default_request_timeout_secs() -> u64 {
    3600
}

impl Default for ContinuationSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            min_progress: 0.0,
        }
    }
}

/// Review loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Judgments per task before the verdict becomes ESCALATE
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    3
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding one subdirectory per session
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("sessions")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

/// Full configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasegateConfig {
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub locks: LocksSection,
    #[serde(default)]
    pub pools: PoolsSection,
    #[serde(default)]
    pub continuation: ContinuationSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub storage: StorageSection,
}

impl PhasegateConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasegate.toml")
    }

    /// Load from `<project_dir>/.phasegate/phasegate.toml`, falling back to defaults.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load with the full layering: file, then environment.
    pub fn resolve(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(project_dir)?;
        config.apply_env();
        if config.storage.state_dir.is_relative() {
            config.storage.state_dir = project_dir.join(&config.storage.state_dir);
        }
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize phasegate.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PHASEGATE_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("PHASEGATE_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(dir);
        }
        if let Some(retries) = std::env::var("PHASEGATE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.lifecycle.max_retries = retries;
        }
    }

    /// Timeout for a phase: the first matching pattern wins, then the default.
    pub fn phase_timeout(&self, phase: Phase) -> Option<Duration> {
        self.lifecycle
            .phase_timeouts
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, phase.slug()))
            .map(|(_, secs)| *secs)
            .or(self.lifecycle.default_phase_timeout_secs)
            .map(Duration::from_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.pools.stale_after_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.locks.lock_ttl_secs)
    }

    pub fn continuation_timeout(&self) -> Duration {
        Duration::from_secs(self.continuation.request_timeout_secs)
    }

    /// Reject settings that would make a session unable to start.
    pub fn validate(&self) -> CoreResult<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        Err(
            CoreError::new(ErrorKind::Configuration, problems.join("; "))
                .with_detail("problems", &problems),
        )
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.pools.l1_capacity == 0 {
            problems.push("pools.l1_capacity must be at least 1".to_string());
        }
        if self.pools.l2_capacity == 0 {
            problems.push("pools.l2_capacity must be at least 1".to_string());
        }
        if self.locks.max_write_workers == 0 {
            problems.push("locks.max_write_workers must be at least 1".to_string());
        }
        if self.review.max_iterations == 0 {
            problems.push("review.max_iterations must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.continuation.min_progress) {
            problems.push(format!(
                "continuation.min_progress must be within 0.0..=1.0, got {}",
                self.continuation.min_progress
            ));
        }
        for pattern in self.lifecycle.phase_timeouts.keys() {
            if glob::Pattern::new(pattern).is_err() {
                problems.push(format!("invalid phase timeout pattern '{}'", pattern));
            }
        }
        problems
    }

    /// Non-fatal observations about the configuration.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.pools.l2_capacity > self.locks.max_write_workers {
            warnings.push(format!(
                "pools.l2_capacity ({}) exceeds locks.max_write_workers ({}); extra L2 slots can never write",
                self.pools.l2_capacity, self.locks.max_write_workers
            ));
        }
        for pattern in self.lifecycle.phase_timeouts.keys() {
            if !Phase::ALL.iter().any(|p| pattern_matches(pattern, p.slug())) {
                warnings.push(format!("phase timeout pattern '{}' matches no phase", pattern));
            }
        }
        warnings
    }
}

/// Case-insensitive glob match of a config key against a phase slug.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(&pattern.to_lowercase())
        .map(|p| p.matches(&name.to_lowercase()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = PhasegateConfig::parse("").unwrap();
        assert_eq!(config.lifecycle.max_retries, 3);
        assert_eq!(config.locks.max_write_workers, 4);
        assert_eq!(config.pools.l1_capacity, 9);
        assert_eq!(config.pools.l2_capacity, 4);
        assert!(config.pools.l1_queue_enabled);
        assert_eq!(config.pools.stale_after_secs, 300);
        assert_eq!(config.review.max_iterations, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[lifecycle]
max_retries = 5

[lifecycle.phase_timeouts]
"execution" = 120
"*_validation" = 30

[pools]
l2_capacity = 2
l1_queue_enabled = false
"#;
        let config = PhasegateConfig::parse(content).unwrap();
        assert_eq!(config.lifecycle.max_retries, 5);
        assert_eq!(config.pools.l2_capacity, 2);
        assert!(!config.pools.l1_queue_enabled);
        assert_eq!(
            config.phase_timeout(Phase::Execution),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            config.phase_timeout(Phase::CompletionValidation),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.phase_timeout(Phase::Planning), None);
    }

    #[test]
    fn test_default_phase_timeout_applies_to_unmatched() {
        let content = r#"
[lifecycle]
default_phase_timeout_secs = 900
"#;
        let config = PhasegateConfig::parse(content).unwrap();
        assert_eq!(
            config.phase_timeout(Phase::Qa),
            Some(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = PhasegateConfig::default();
        config.pools.l2_capacity = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.message().contains("l2_capacity"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_progress() {
        let mut config = PhasegateConfig::default();
        config.continuation.min_progress = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warnings_flag_unmatched_pattern() {
        let mut config = PhasegateConfig::default();
        config
            .lifecycle
            .phase_timeouts
            .insert("deploy".to_string(), 10);
        let warnings = config.warnings();
        assert!(warnings.iter().any(|w| w.contains("deploy")));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = PhasegateConfig::default();
        config.review.max_iterations = 7;
        config.save(&path).unwrap();
        let loaded = PhasegateConfig::load(&path).unwrap();
        assert_eq!(loaded.review.max_iterations, 7);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PhasegateConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.pools.l1_capacity, 9);
    }

    #[test]
    fn test_pattern_matches_case_insensitive() {
        assert!(pattern_matches("EXEC*", "execution"));
        assert!(pattern_matches("*", "qa"));
        assert!(!pattern_matches("plan", "planning"));
    }
}
