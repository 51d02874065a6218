//! # Tessera Config
//!
//! Unified single-file configuration for Tessera.
//! A single `tessera.yaml` configures language-model providers, the
//! optimizer, the training loop, the variable store and observability.

mod loader;
mod providers;

pub use loader::{load_config, load_providers_config, validate_config, ConfigError, ConfigManager};
pub use providers::{ApiKeyError, BackendSpec, ModelPolicy, ModelProfile, ProvidersConfig};

use serde::Deserialize;

/// Top-level configuration schema for Tessera.
#[derive(Debug, Clone, Deserialize)]
pub struct TesseraConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            providers: ProvidersConfig::default(),
            optimizer: OptimizerConfig::default(),
            training: TrainingConfig::default(),
            stores: StoresConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl TesseraConfig {
    pub fn providers(&self) -> &ProvidersConfig {
        &self.providers
    }

    /// Model profile used by the optimizer: the explicit one, else the default.
    pub fn optimizer_model(&self) -> Option<ModelProfile> {
        match &self.optimizer.model {
            Some(name) => self.providers.get_model(name),
            None => self.providers.get_default_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "tessera".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer_kind")]
    pub kind: String,
    #[serde(default = "default_k_best")]
    pub k_best: usize,
    /// Model profile name for instruction generation.
    #[serde(default)]
    pub model: Option<String>,
    /// Optional optimizer name; also prefixes its generator's name.
    #[serde(default)]
    pub name: Option<String>,
    /// Replaces the built-in meta instructions when set.
    #[serde(default)]
    pub meta_instructions: Option<Vec<String>>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: default_optimizer_kind(),
            k_best: default_k_best(),
            model: None,
            name: None,
            meta_instructions: None,
        }
    }
}

fn default_optimizer_kind() -> String {
    "opro".to_string()
}

fn default_k_best() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Upper bound for one variable's optimize step.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub finalize_on_epoch_end: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            finalize_on_epoch_end: true,
        }
    }
}

fn default_epochs() -> usize {
    1
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoresConfig {
    #[serde(default)]
    pub variables: StoreSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSpec {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_max_variables")]
    pub max_variables: usize,
    /// JSON snapshot loaded at startup and written after training.
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

impl Default for StoreSpec {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_variables: default_max_variables(),
            snapshot_path: None,
        }
    }
}

fn default_backend() -> String {
    "in_memory".to_string()
}

fn default_max_variables() -> usize {
    1_024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub traces_enabled: bool,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traces_enabled: false,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
