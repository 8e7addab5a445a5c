//! Engine configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$THREADLINE_CONFIG` (environment variable)
//! 2. `~/.config/threadline/config.toml` (Linux/macOS)
//!    `%APPDATA%\threadline\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! The banner/footer pattern table lives here too, so it can be edited
//! without touching engine code.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::canonical::patterns::{default_rules, PatternRule, DEFAULT_RULESET_VERSION};
use crate::error::{EngineError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Thread Graph Builder tuning.
    pub threading: ThreadingConfig,
    /// Inclusivity / near-duplicate tuning.
    pub analysis: AnalysisConfig,
    /// Attachment hashing and blob layout.
    pub attachments: AttachmentConfig,
    /// Consistency Reporter thresholds.
    pub consistency: ConsistencyConfig,
    /// Canonicalization pattern table.
    pub canonical: CanonicalConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Worker threads for the parallel phases (0 = one per core).
    pub worker_threads: usize,
}

/// Thread Graph Builder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    /// Window for the subject/time fallback tier, in days.
    pub fallback_time_window_days: i64,
    /// Require sender/recipient overlap for the subject/time fallback.
    pub subject_fallback_requires_participants: bool,
    /// Use the MAPI conversation index as a tertiary signal.
    pub conversation_index_enabled: bool,
    /// Never thread a forwarded message (`Fw:`/`Fwd:` subject) by subject/time.
    pub subject_fallback_skips_forwards: bool,
}

/// Inclusivity / near-duplicate tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Minimum shingle resemblance for two messages to be near-duplicates.
    pub near_dup_similarity_threshold: f64,
    /// Words per shingle.
    pub shingle_size: usize,
}

/// Attachment hashing and blob layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// File sources larger than this are stream-hashed instead of buffered.
    pub max_attachment_bytes_for_hashing: u64,
    /// Prefix of `canonical_blob_ref` values.
    pub blob_prefix: String,
}

/// Consistency Reporter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Participant-set Jaccard below which recipient drift is reported.
    pub recipient_drift_threshold: f64,
    /// Parent→child gap (days) above which a time anomaly is reported.
    pub time_gap_threshold_days: i64,
}

/// Canonicalization pattern table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalConfig {
    /// Version tag stamped on every run.
    pub ruleset_version: String,
    /// Ordered banner/footer rules; order decides which rule fires first.
    pub patterns: Vec<PatternRule>,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            cache_dir: None,
            worker_threads: 0,
        }
    }
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            fallback_time_window_days: 90,
            subject_fallback_requires_participants: false,
            conversation_index_enabled: true,
            subject_fallback_skips_forwards: true,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            near_dup_similarity_threshold: 0.92,
            shingle_size: 3,
        }
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_attachment_bytes_for_hashing: 64 * 1024 * 1024, // 64 MB
            blob_prefix: "sha256".to_string(),
        }
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            recipient_drift_threshold: 0.5,
            time_gap_threshold_days: 30,
        }
    }
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        Self {
            ruleset_version: DEFAULT_RULESET_VERSION.to_string(),
            patterns: default_rules(),
        }
    }
}

impl Config {
    /// Check value ranges. Called once when an engine is built.
    pub fn validate(&self) -> Result<()> {
        let t = self.analysis.near_dup_similarity_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "near_dup_similarity_threshold must be in (0, 1], got {t}"
            )));
        }
        if self.analysis.shingle_size == 0 {
            return Err(EngineError::InvalidConfig(
                "shingle_size must be at least 1".into(),
            ));
        }
        check_days(
            "fallback_time_window_days",
            self.threading.fallback_time_window_days,
        )?;
        let d = self.consistency.recipient_drift_threshold;
        if !(0.0..=1.0).contains(&d) {
            return Err(EngineError::InvalidConfig(format!(
                "recipient_drift_threshold must be in [0, 1], got {d}"
            )));
        }
        check_days(
            "time_gap_threshold_days",
            self.consistency.time_gap_threshold_days,
        )?;
        if self.attachments.blob_prefix.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "blob_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A day count must be positive and representable as a `chrono::Duration`.
fn check_days(name: &str, days: i64) -> Result<()> {
    if days <= 0 || chrono::Duration::try_days(days).is_none() {
        return Err(EngineError::InvalidConfig(format!(
            "{name} must be a positive number of days within range, got {days}"
        )));
    }
    Ok(())
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("THREADLINE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("threadline").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("threadline")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("threadline.log")
}
