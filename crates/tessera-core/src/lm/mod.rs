//! Language-model boundary
//!
//! The core never inspects prompt text. A `LanguageModel` receives the input
//! value, the schema its answer must satisfy and the instructions to follow,
//! and returns a value conforming to that schema.

mod scripted;

pub use scripted::ScriptedLanguageModel;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::schema::Schema;
use crate::value::StructuralValue;
use crate::variable::Prediction;

/// Generation request payload
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub input: StructuralValue,
    pub output_schema: Schema,
    pub instructions: Vec<String>,
    pub examples: Vec<Prediction>,
    /// Optional template overriding the client's default prompt layout.
    pub prompt_template: Option<String>,
    /// Static system prompt; never trained.
    pub system_prompt: Option<String>,
}

impl GenerationRequest {
    pub fn new(input: StructuralValue, output_schema: Schema) -> Self {
        Self {
            input,
            output_schema,
            instructions: Vec::new(),
            examples: Vec::new(),
            prompt_template: None,
            system_prompt: None,
        }
    }

    pub fn with_instructions(mut self, instructions: Vec<String>) -> Self {
        self.instructions = instructions;
        self
    }
}

/// Language model errors
#[derive(Debug, Error)]
pub enum LmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("response error: {0}")]
    Response(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("output does not conform to schema: {0}")]
    Malformed(String),
    #[error("unsupported language model config: {0}")]
    Config(String),
}

/// Language model trait
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<StructuralValue, LmError>;

    /// Portable config used to rebuild this model through a resolver.
    fn get_config(&self) -> Value {
        json!({ "model": self.model_name() })
    }
}

#[async_trait]
impl LanguageModel for Arc<dyn LanguageModel> {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    async fn generate(&self, request: GenerationRequest) -> Result<StructuralValue, LmError> {
        (**self).generate(request).await
    }

    fn get_config(&self) -> Value {
        (**self).get_config()
    }
}

/// Rebuilds a language model from its portable config.
pub trait LanguageModelResolver: Send + Sync {
    fn resolve(&self, config: &Value) -> Result<Arc<dyn LanguageModel>, LmError>;
}
