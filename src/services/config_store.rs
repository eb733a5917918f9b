// Configuration Storage Service
// Handles config file read/write and version backup

use crate::models::{SamplingParams, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};
use crate::services::providers::{DEFAULT_CHAT_MODEL, DEFAULT_MODERATION_MODEL};
use crate::services::scoring::weights::{WeightSet, WEIGHT_TOLERANCE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const MAX_BACKUPS: usize = 10;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Failed to serialize: {0}")]
    Serialize(String),
}

impl PersistenceError {
    pub(crate) fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub weights: WeightSet,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p", rename = "top_p")]
    pub top_p: f64,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_moderation_model")]
    pub moderation_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            weights: WeightSet::default(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            model: default_model(),
            moderation_model: default_moderation_model(),
            base_url: None,
            api_keys: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

fn default_version() -> String { env!("CARGO_PKG_VERSION").to_string() }
fn default_temperature() -> f64 { DEFAULT_TEMPERATURE }
fn default_top_p() -> f64 { DEFAULT_TOP_P }
fn default_model() -> String { DEFAULT_CHAT_MODEL.to_string() }
fn default_moderation_model() -> String { DEFAULT_MODERATION_MODEL.to_string() }

/// Where a finished batch writes back its weights and sampling parameters.
pub trait SettingsStore: Send + Sync {
    fn save_settings(&self, weights: &WeightSet, sampling: SamplingParams) -> Result<(), PersistenceError>;
}

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("aggroScore"))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.config_dir)
            .map_err(|e| PersistenceError::io("create config dir", &self.config_dir, e))
    }

    /// Load configuration from file. A missing file yields the defaults.
    pub fn load(&self) -> Result<AppConfig, PersistenceError> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_file)
            .map_err(|e| PersistenceError::io("read config", &self.config_file, e))?;

        let config: AppConfig = serde_json::from_str(&content).map_err(|e| PersistenceError::Parse {
            path: self.config_file.clone(),
            message: e.to_string(),
        })?;

        // Loaded weights are kept as-is; the batch gate decides whether they are usable.
        let remaining = config.weights.remaining();
        if remaining.abs() > WEIGHT_TOLERANCE {
            warn!(
                "[CONFIG] loaded weights sum to {:.4} (remaining {:.4})",
                config.weights.total(),
                remaining
            );
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig) -> Result<(), PersistenceError> {
        self.ensure_dir()?;

        // Create backup if file exists
        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| PersistenceError::Serialize(e.to_string()))?;

        fs::write(&self.config_file, content)
            .map_err(|e| PersistenceError::io("write config", &self.config_file, e))?;
        info!("[CONFIG] saved {}", self.config_file.display());
        Ok(())
    }

    /// Create a backup of current config
    fn create_backup(&self) -> Result<(), PersistenceError> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir)
            .map_err(|e| PersistenceError::io("create backup dir", &backup_dir, e))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));

        fs::copy(&self.config_file, &backup_file)
            .map_err(|e| PersistenceError::io("create backup", &backup_file, e))?;

        self.cleanup_old_backups(&backup_dir, MAX_BACKUPS)?;

        Ok(())
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), PersistenceError> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(|e| PersistenceError::io("read backup dir", backup_dir, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Oldest first; names carry the timestamp so they break mtime ties.
        entries.sort_by_key(|e| {
            (
                e.metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                e.file_name(),
            )
        });

        for entry in entries.iter().take(entries.len() - keep) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }
}

impl SettingsStore for ConfigStore {
    fn save_settings(&self, weights: &WeightSet, sampling: SamplingParams) -> Result<(), PersistenceError> {
        let mut config = self.load()?;
        config.weights = weights.clone();
        config.temperature = sampling.temperature;
        config.top_p = sampling.top_p;
        self.save(&config)
    }
}
