use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{config_schema, config_str, CallContext, Generator, Module, ModuleError};
use crate::lm::{LanguageModel, LanguageModelResolver};
use crate::schema::{Field, FieldType, Schema};
use crate::store::VariableStore;
use crate::value::StructuralValue;
use crate::variable::VariableKey;

const THINKING_DESCRIPTION: &str = "Your step by step thinking";

/// Generator whose answer is preceded by `k` free-text thinking fields.
///
/// Thinking fields are named `thinking`, `thinking_1`, ... and placed before
/// the target schema's fields.
pub struct ChainOfThought {
    name: String,
    k: usize,
    target_schema: Schema,
    generator: Generator,
}

impl ChainOfThought {
    pub fn new(
        name: impl Into<String>,
        target_schema: Schema,
        language_model: Arc<dyn LanguageModel>,
        k: usize,
    ) -> Result<Self, ModuleError> {
        let name = name.into();
        let k = k.max(1);
        let schema = thinking_schema(k)?.compose(&target_schema)?;
        let generator = Generator::new(format!("{}_generator", name), schema, language_model);
        Ok(Self {
            name,
            k,
            target_schema,
            generator,
        })
    }

    pub fn with_generator(mut self, configure: impl FnOnce(Generator) -> Generator) -> Self {
        self.generator = configure(self.generator);
        self
    }

    pub async fn bind(mut self, store: Arc<dyn VariableStore>) -> Result<Self, ModuleError> {
        self.generator = self.generator.bind(store).await?;
        Ok(self)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn from_config(
        config: &Value,
        resolver: &dyn LanguageModelResolver,
    ) -> Result<Self, ModuleError> {
        let generator_config = config
            .get("generator")
            .ok_or_else(|| ModuleError::Config("missing 'generator'".to_string()))?;
        let generator = Generator::from_config(generator_config, resolver)?;
        let k = config
            .get("k")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ModuleError::Config("missing integer field 'k'".to_string()))?;
        Ok(Self {
            name: config_str(config, "name")?,
            k: k as usize,
            target_schema: config_schema(config, "target_schema")?,
            generator,
        })
    }
}

fn thinking_schema(k: usize) -> Result<Schema, ModuleError> {
    let fields = (0..k).map(|i| {
        let name = if i == 0 {
            "thinking".to_string()
        } else {
            format!("thinking_{}", i)
        };
        Field::required(name, FieldType::String).with_description(THINKING_DESCRIPTION)
    });
    Ok(Schema::new(fields)?)
}

#[async_trait]
impl Module for ChainOfThought {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_schema(&self) -> &Schema {
        self.generator.output_schema()
    }

    fn trainable_variables(&self) -> Vec<VariableKey> {
        self.generator.trainable_variables()
    }

    async fn call(
        &self,
        input: StructuralValue,
        ctx: CallContext,
    ) -> Result<StructuralValue, ModuleError> {
        self.generator.call(input, ctx).await
    }

    fn get_config(&self) -> Value {
        json!({
            "name": self.name,
            "k": self.k,
            "target_schema": self.target_schema.to_json_schema(),
            "generator": self.generator.get_config(),
        })
    }
}
