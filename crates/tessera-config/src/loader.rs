//! Configuration loading and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::{ProvidersConfig, TesseraConfig};

const SUPPORTED_OPTIMIZERS: &[&str] = &["opro"];
const SUPPORTED_STORE_BACKENDS: &[&str] = &["in_memory"];

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load full Tessera configuration from YAML file.
pub fn load_config(path: &Path) -> Result<TesseraConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: TesseraConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load only providers section from unified config file.
pub fn load_providers_config(path: &Path) -> Result<ProvidersConfig, ConfigError> {
    let config = load_config(path)?;
    Ok(config.providers)
}

pub fn validate_config(config: &TesseraConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    validate_providers(&config.providers)?;

    let optimizer = &config.optimizer;
    if !SUPPORTED_OPTIMIZERS.contains(&optimizer.kind.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "optimizer.kind '{}' is not supported",
            optimizer.kind
        )));
    }
    if optimizer.k_best == 0 {
        return Err(ConfigError::Invalid(
            "optimizer.k_best must be > 0".to_string(),
        ));
    }
    if let Some(model) = &optimizer.model {
        if config.providers.get_model(model).is_none() {
            return Err(ConfigError::Invalid(format!(
                "optimizer.model '{}' not found",
                model
            )));
        }
    }

    if config.training.epochs == 0 {
        return Err(ConfigError::Invalid(
            "training.epochs must be > 0".to_string(),
        ));
    }
    if config.training.generation_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "training.generation_timeout_secs must be > 0".to_string(),
        ));
    }

    let variables = &config.stores.variables;
    if !SUPPORTED_STORE_BACKENDS.contains(&variables.backend.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "stores.variables.backend '{}' is not supported",
            variables.backend
        )));
    }
    if variables.max_variables == 0 {
        return Err(ConfigError::Invalid(
            "stores.variables.max_variables must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_providers(config: &ProvidersConfig) -> Result<(), ConfigError> {
    for backend in &config.backends {
        if backend.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "providers.backends[].name must not be empty".to_string(),
            ));
        }
        if backend.kind.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "providers.backends[].kind must not be empty".to_string(),
            ));
        }
    }

    for model in &config.models {
        if model.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "providers.models[].name must not be empty".to_string(),
            ));
        }
        if model.model.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "providers.models[{}].model must not be empty",
                model.name
            )));
        }
        if let Some(backend) = &model.backend {
            if config.get_backend(backend).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "providers.models[{}].backend '{}' not found",
                    model.name, backend
                )));
            }
        }
    }

    if let Some(default_backend) = &config.default_backend {
        if config.get_backend(default_backend).is_none() {
            return Err(ConfigError::Invalid(format!(
                "providers.default_backend '{}' not found",
                default_backend
            )));
        }
    }

    if let Some(default_model) = &config.default_model {
        if config.get_model(default_model).is_none() {
            return Err(ConfigError::Invalid(format!(
                "providers.default_model '{}' not found",
                default_model
            )));
        }
    }

    Ok(())
}

/// Holds the current configuration for shared readers.
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<TesseraConfig>>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: Arc::new(RwLock::new(TesseraConfig::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a reference to the current config.
    pub fn config(&self) -> Arc<RwLock<TesseraConfig>> {
        self.config.clone()
    }

    /// Load configuration from file, keeping the previous one on error.
    pub async fn load(&self) -> Result<(), ConfigError> {
        let config = load_config(&self.path)?;
        let mut current = self.config.write().await;
        *current = config;
        tracing::info!(path = %self.path.display(), "config loaded");
        Ok(())
    }
}
