//! Module composition layer
//!
//! Computation nodes whose inputs and outputs are structural values of
//! declared schemas:
//! - `Generator`: one language-model call with trainable instructions
//! - `ChainOfThought`: a generator whose answer is preceded by thinking fields
//! - `Program`: a named sequential chain of modules

mod chain_of_thought;
mod generator;
mod program;

pub use chain_of_thought::ChainOfThought;
pub use generator::Generator;
pub use program::Program;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::lm::LmError;
use crate::schema::{Schema, SchemaError};
use crate::store::StoreError;
use crate::value::{StructuralValue, ValueError};
use crate::variable::VariableKey;

/// Module errors
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("input does not satisfy the input schema of '{0}'")]
    InputMismatch(String),

    #[error("language model error: {0}")]
    Lm(#[from] LmError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("invalid module config: {0}")]
    Config(String),
}

/// Per-call execution flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Record predictions for later optimization.
    pub training: bool,
}

impl CallContext {
    pub fn training() -> Self {
        Self { training: true }
    }

    pub fn inference() -> Self {
        Self { training: false }
    }
}

/// Computation node trait
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn output_schema(&self) -> &Schema;

    /// Keys of the trainable variables owned by this module and its children.
    fn trainable_variables(&self) -> Vec<VariableKey> {
        Vec::new()
    }

    async fn call(
        &self,
        input: StructuralValue,
        ctx: CallContext,
    ) -> Result<StructuralValue, ModuleError>;

    fn get_config(&self) -> Value;
}

pub(crate) fn config_str(config: &Value, key: &str) -> Result<String, ModuleError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| ModuleError::Config(format!("missing string field '{}'", key)))
}

pub(crate) fn config_schema(config: &Value, key: &str) -> Result<Schema, ModuleError> {
    let schema = config
        .get(key)
        .ok_or_else(|| ModuleError::Config(format!("missing schema field '{}'", key)))?;
    Ok(Schema::from_json_schema(schema)?)
}
