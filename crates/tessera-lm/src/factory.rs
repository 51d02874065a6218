//! Language model factory for building models from backend configuration.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use tessera_config::{ApiKeyError, BackendSpec, ModelProfile, ProvidersConfig};
use tessera_core::lm::{LanguageModel, LanguageModelResolver, LmError};

use crate::http::{HttpLanguageModel, HttpLanguageModelConfig};

/// Runtime invocation config for one model.
#[derive(Debug, Clone)]
pub struct LmInvocationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for LmInvocationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

impl LmInvocationConfig {
    /// Profile values, with temperature clamped by the profile's guardrails.
    pub fn from_profile(profile: &ModelProfile) -> Self {
        let defaults = Self::default();
        let temperature = profile.temperature.unwrap_or(defaults.temperature);
        Self {
            model: profile.model.clone(),
            temperature: profile.clamp_temperature(temperature),
            max_tokens: profile.max_tokens,
        }
    }
}

/// Errors that can occur when building a language model.
#[derive(Debug, Error)]
pub enum LmBuildError {
    #[error("unknown backend kind: {0}")]
    UnknownKind(String),
    #[error("missing API key for backend '{0}'")]
    MissingApiKey(String),
    #[error("environment variable '{0}' not found")]
    EnvNotFound(String),
    #[error("unknown model profile: {0}")]
    UnknownModel(String),
    #[error("no backend available for model '{0}'")]
    NoBackend(String),
    #[error(transparent)]
    Client(#[from] LmError),
}

impl From<LmBuildError> for LmError {
    fn from(err: LmBuildError) -> Self {
        match err {
            LmBuildError::Client(inner) => inner,
            other => LmError::Config(other.to_string()),
        }
    }
}

/// Factory trait for building language models.
pub trait LanguageModelFactory: Send + Sync {
    fn build(
        &self,
        backend: &BackendSpec,
        invocation: &LmInvocationConfig,
    ) -> Result<Arc<dyn LanguageModel>, LmBuildError>;
}

/// Default factory producing `HttpLanguageModel`s.
pub struct DefaultLanguageModelFactory;

impl DefaultLanguageModelFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultLanguageModelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageModelFactory for DefaultLanguageModelFactory {
    fn build(
        &self,
        backend: &BackendSpec,
        invocation: &LmInvocationConfig,
    ) -> Result<Arc<dyn LanguageModel>, LmBuildError> {
        build_language_model(backend, invocation)
    }
}

/// Build an HTTP language model from backend spec and invocation defaults.
pub fn build_language_model(
    backend: &BackendSpec,
    invocation: &LmInvocationConfig,
) -> Result<Arc<dyn LanguageModel>, LmBuildError> {
    let kind = BackendKind::parse(&backend.kind)?;
    let api_key = match backend.resolve_api_key() {
        Ok(key) => Some(key),
        Err(ApiKeyError::NotConfigured) if !kind.requires_api_key() => None,
        Err(ApiKeyError::NotConfigured) => {
            return Err(LmBuildError::MissingApiKey(backend.name.clone()));
        }
        Err(ApiKeyError::EnvNotFound(name)) => return Err(LmBuildError::EnvNotFound(name)),
    };
    let endpoint = backend
        .endpoint
        .clone()
        .or_else(|| kind.default_endpoint().map(ToString::to_string))
        .ok_or_else(|| {
            LmBuildError::UnknownKind(format!("{} (endpoint required)", backend.kind))
        })?;

    let config = HttpLanguageModelConfig {
        endpoint,
        api_key,
        model: invocation.model.clone(),
        temperature: invocation.temperature,
        max_tokens: invocation.max_tokens,
        timeout_secs: backend.get_config::<u64>("timeout_secs").unwrap_or(60),
        backend: Some(backend.name.clone()),
        ..HttpLanguageModelConfig::default()
    };
    Ok(Arc::new(HttpLanguageModel::new(config)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    OpenAi,
    DeepSeek,
    Groq,
    OpenRouter,
    Mistral,
    Ollama,
    /// Any server speaking the chat-completions protocol; needs an endpoint.
    Compatible,
}

impl BackendKind {
    fn parse(kind: &str) -> Result<Self, LmBuildError> {
        match kind.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "deepseek" => Ok(Self::DeepSeek),
            "groq" => Ok(Self::Groq),
            "openrouter" => Ok(Self::OpenRouter),
            "mistral" => Ok(Self::Mistral),
            "ollama" => Ok(Self::Ollama),
            "openai_compatible" | "compatible" => Ok(Self::Compatible),
            _ => Err(LmBuildError::UnknownKind(kind.to_string())),
        }
    }

    fn default_endpoint(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("https://api.openai.com/v1/chat/completions"),
            Self::DeepSeek => Some("https://api.deepseek.com/chat/completions"),
            Self::Groq => Some("https://api.groq.com/openai/v1/chat/completions"),
            Self::OpenRouter => Some("https://openrouter.ai/api/v1/chat/completions"),
            Self::Mistral => Some("https://api.mistral.ai/v1/chat/completions"),
            Self::Ollama => Some("http://localhost:11434/v1/chat/completions"),
            Self::Compatible => None,
        }
    }

    fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama | Self::Compatible)
    }
}

/// Rebuilds HTTP models from their portable configs against a providers table.
///
/// Accepted configs: `{"profile": name}` or
/// `{"model": name, "backend"?: name, "temperature"?: f32, "max_tokens"?: u32}`.
pub struct ConfigLanguageModelResolver {
    providers: ProvidersConfig,
    factory: Arc<dyn LanguageModelFactory>,
}

impl ConfigLanguageModelResolver {
    pub fn new(providers: ProvidersConfig) -> Self {
        Self::with_factory(providers, Arc::new(DefaultLanguageModelFactory::new()))
    }

    pub fn with_factory(
        providers: ProvidersConfig,
        factory: Arc<dyn LanguageModelFactory>,
    ) -> Self {
        Self { providers, factory }
    }

    /// Build the model described by a named profile.
    pub fn build_profile(&self, name: &str) -> Result<Arc<dyn LanguageModel>, LmBuildError> {
        let profile = self
            .providers
            .get_model(name)
            .ok_or_else(|| LmBuildError::UnknownModel(name.to_string()))?;
        self.build_from(&profile)
    }

    /// Build the default profile's model.
    pub fn build_default(&self) -> Result<Arc<dyn LanguageModel>, LmBuildError> {
        let profile = self
            .providers
            .get_default_model()
            .ok_or_else(|| LmBuildError::UnknownModel("<default>".to_string()))?;
        self.build_from(&profile)
    }

    fn build_from(&self, profile: &ModelProfile) -> Result<Arc<dyn LanguageModel>, LmBuildError> {
        let backend = self
            .providers
            .backend_for(profile)
            .ok_or_else(|| LmBuildError::NoBackend(profile.name.clone()))?;
        self.factory
            .build(&backend, &LmInvocationConfig::from_profile(profile))
    }

    fn resolve_inline(&self, config: &Value) -> Result<Arc<dyn LanguageModel>, LmBuildError> {
        let model = config
            .get("model")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LmBuildError::UnknownModel("<missing 'model'>".to_string()))?;
        let backend = match config.get("backend").and_then(|v| v.as_str()) {
            Some(name) => self.providers.get_backend(name),
            None => self.providers.get_default_backend(),
        }
        .ok_or_else(|| LmBuildError::NoBackend(model.to_string()))?;

        let defaults = LmInvocationConfig::default();
        let invocation = LmInvocationConfig {
            model: model.to_string(),
            temperature: config
                .get("temperature")
                .and_then(|v| v.as_f64())
                .map(|t| t as f32)
                .unwrap_or(defaults.temperature),
            max_tokens: config
                .get("max_tokens")
                .and_then(|v| v.as_u64())
                .map(|t| t as u32),
        };
        self.factory.build(&backend, &invocation)
    }
}

impl LanguageModelResolver for ConfigLanguageModelResolver {
    fn resolve(&self, config: &Value) -> Result<Arc<dyn LanguageModel>, LmError> {
        if let Some(kind) = config.get("kind").and_then(|v| v.as_str()) {
            if kind != "http" {
                return Err(LmError::Config(format!(
                    "cannot resolve language model kind '{}'",
                    kind
                )));
            }
        }
        let model = match config.get("profile").and_then(|v| v.as_str()) {
            Some(profile) => self.build_profile(profile)?,
            None => self.resolve_inline(config)?,
        };
        Ok(model)
    }
}
