//! Language-model backend and model profile types.

use serde::Deserialize;
use serde_json::Value;

/// Root configuration for language-model providers.
///
/// - `backends`: vendor/endpoint/auth config
/// - `models`: model presets referencing a backend, with optional guardrails
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    /// Default backend name.
    #[serde(default)]
    pub default_backend: Option<String>,
    /// Default model profile name.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
    #[serde(default)]
    pub models: Vec<ModelProfile>,
}

impl ProvidersConfig {
    pub fn get_backend(&self, name: &str) -> Option<BackendSpec> {
        self.backends.iter().find(|b| b.name == name).cloned()
    }

    pub fn get_model(&self, name: &str) -> Option<ModelProfile> {
        self.models.iter().find(|m| m.name == name).cloned()
    }

    /// Named default, else the first declared backend.
    pub fn get_default_backend(&self) -> Option<BackendSpec> {
        match &self.default_backend {
            Some(name) => self.get_backend(name),
            None => self.backends.first().cloned(),
        }
    }

    /// Named default, else the first declared profile.
    pub fn get_default_model(&self) -> Option<ModelProfile> {
        match &self.default_model {
            Some(name) => self.get_model(name),
            None => self.models.first().cloned(),
        }
    }

    /// Backend serving `model`: its own reference, else the default backend.
    pub fn backend_for(&self, model: &ModelProfile) -> Option<BackendSpec> {
        model
            .backend
            .as_ref()
            .and_then(|name| self.get_backend(name))
            .or_else(|| self.get_default_backend())
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name.clone()).collect()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }
}

/// Backend configuration (auth, endpoint, vendor).
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSpec {
    /// Backend identifier (e.g. "openai", "local").
    pub name: String,
    /// Backend kind understood by the language-model factory.
    pub kind: String,
    /// Optional custom endpoint URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable name containing the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Backend-specific settings.
    #[serde(default)]
    pub config: Value,
}

impl BackendSpec {
    /// Resolve the API key from environment variable.
    pub fn resolve_api_key(&self) -> Result<String, ApiKeyError> {
        let env_name = self.api_key_env.as_ref().ok_or(ApiKeyError::NotConfigured)?;
        std::env::var(env_name).map_err(|_| ApiKeyError::EnvNotFound(env_name.clone()))
    }

    /// Read backend config value as typed object.
    pub fn get_config<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Model profile used by generators and the optimizer.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelProfile {
    /// Profile name (e.g. "fast", "meta").
    pub name: String,
    /// Backend reference.
    #[serde(default)]
    pub backend: Option<String>,
    /// Actual model name.
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub policy: ModelPolicy,
    /// Extra arbitrary config.
    #[serde(default)]
    pub config: Value,
}

impl ModelProfile {
    pub fn get_config<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Clamp input temperature with configured guardrails.
    pub fn clamp_temperature(&self, candidate: f32) -> f32 {
        let mut value = candidate;
        if let Some(min) = self.policy.temperature_min {
            value = value.max(min);
        }
        if let Some(max) = self.policy.temperature_max {
            value = value.min(max);
        }
        value
    }
}

/// Optional model guardrails.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPolicy {
    #[serde(default)]
    pub temperature_min: Option<f32>,
    #[serde(default)]
    pub temperature_max: Option<f32>,
}

/// Errors related to API key resolution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiKeyError {
    #[error("API key environment variable not configured")]
    NotConfigured,
    #[error("Environment variable '{0}' not found")]
    EnvNotFound(String),
}
