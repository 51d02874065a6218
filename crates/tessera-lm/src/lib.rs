//! Language model implementations for Tessera.
//!
//! This crate provides:
//! - `HttpLanguageModel` for OpenAI-compatible chat-completions APIs
//! - `PromptRenderer`, the handlebars prompt layout shared by HTTP models
//!
//! Use `LanguageModelFactory` to create models from configuration and
//! `ConfigLanguageModelResolver` to rebuild them from portable configs.

mod factory;
mod http;
mod prompt;

pub use factory::{
    build_language_model, ConfigLanguageModelResolver, DefaultLanguageModelFactory,
    LanguageModelFactory, LmBuildError, LmInvocationConfig,
};
pub use http::{extract_json, HttpLanguageModel, HttpLanguageModelConfig};
pub use prompt::{PromptRenderer, RenderedPrompt, DEFAULT_PROMPT_TEMPLATE};
