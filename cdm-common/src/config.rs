//! Configuration loading and root folder resolution
//!
//! Resolution order for every setting that can come from several places:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application directory name under the OS config/data folders
pub const APP_DIR: &str = "cdm-etl";

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "CDM_ROOT_FOLDER";

/// Contents of `cdm-etl.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    /// Folder holding the SQLite database
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub ingestion: IngestionSection,

    #[serde(default)]
    pub normalization: NormalizationSection,

    #[serde(default)]
    pub reasoning: ReasoningSection,

    #[serde(default)]
    pub embedding: EmbeddingSection,

    #[serde(default)]
    pub predictor: PredictorSection,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "cdm_etl=info,tower_http=info".to_string()
}

/// `[ingestion]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionSection {
    /// Persist job metrics every N records
    #[serde(default = "default_flush_interval")]
    pub metrics_flush_interval: u64,

    /// Maximum time to retry a locked staging write (milliseconds)
    #[serde(default = "default_lock_wait_ms")]
    pub max_lock_wait_ms: u64,
}

impl Default for IngestionSection {
    fn default() -> Self {
        Self {
            metrics_flush_interval: default_flush_interval(),
            max_lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

fn default_flush_interval() -> u64 {
    50
}

fn default_lock_wait_ms() -> u64 {
    5000
}

/// `[normalization]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizationSection {
    #[serde(default = "default_auto_approve")]
    pub auto_approve_threshold: f32,
    #[serde(default = "default_review_floor")]
    pub review_floor: f32,
    #[serde(default = "default_similarity")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for NormalizationSection {
    fn default() -> Self {
        Self {
            auto_approve_threshold: default_auto_approve(),
            review_floor: default_review_floor(),
            similarity_threshold: default_similarity(),
            top_k: default_top_k(),
        }
    }
}

fn default_auto_approve() -> f32 {
    0.90
}

fn default_review_floor() -> f32 {
    0.50
}

fn default_similarity() -> f32 {
    0.90
}

fn default_top_k() -> usize {
    5
}

/// `[reasoning]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningSection {
    /// Registered backend name, or "disabled"
    #[serde(default = "default_provider")]
    pub provider: String,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_reasoning_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            model: None,
            api_key: None,
            timeout_ms: default_reasoning_timeout(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}

fn default_reasoning_timeout() -> u64 {
    10_000
}

fn default_requests_per_second() -> u32 {
    5
}

/// `[embedding]`
///
/// Without an endpoint the local trigram embedder is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingSection {
    pub endpoint: Option<String>,
    pub model: Option<String>,
}

/// `[predictor]` keyword weights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictorSection {
    #[serde(default = "default_primary_weight")]
    pub primary_weight: u32,
    #[serde(default = "default_secondary_weight")]
    pub secondary_weight: u32,
    #[serde(default = "default_generic_weight")]
    pub generic_weight: u32,
}

impl Default for PredictorSection {
    fn default() -> Self {
        Self {
            primary_weight: default_primary_weight(),
            secondary_weight: default_secondary_weight(),
            generic_weight: default_generic_weight(),
        }
    }
}

fn default_primary_weight() -> u32 {
    5
}

fn default_secondary_weight() -> u32 {
    2
}

fn default_generic_weight() -> u32 {
    1
}

/// Resolve the root folder following CLI → ENV → TOML → default priority
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("./cdm_data"))
}

/// Default TOML config path (`~/.config/cdm-etl/cdm-etl.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("cdm-etl.toml"))
}

/// Load TOML config; a missing file yields defaults
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::debug!("No config file at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Write TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}
