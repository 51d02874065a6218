use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{CallContext, Module, ModuleError};
use crate::schema::Schema;
use crate::value::StructuralValue;
use crate::variable::VariableKey;

/// Named sequential chain of modules with a declared input schema.
pub struct Program {
    name: String,
    description: String,
    input_schema: Schema,
    modules: Vec<Arc<dyn Module>>,
}

impl Program {
    pub fn new(name: impl Into<String>, input_schema: Schema) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema,
            modules: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a module to the chain.
    pub fn then(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn modules(&self) -> &[Arc<dyn Module>] {
        &self.modules
    }
}

#[async_trait]
impl Module for Program {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_schema(&self) -> &Schema {
        self.modules
            .last()
            .map(|m| m.output_schema())
            .unwrap_or(&self.input_schema)
    }

    fn trainable_variables(&self) -> Vec<VariableKey> {
        self.modules
            .iter()
            .flat_map(|m| m.trainable_variables())
            .collect()
    }

    async fn call(
        &self,
        input: StructuralValue,
        ctx: CallContext,
    ) -> Result<StructuralValue, ModuleError> {
        if !input.schema().contains(&self.input_schema) {
            return Err(ModuleError::InputMismatch(self.name.clone()));
        }
        let mut current = input;
        for module in &self.modules {
            debug!(program = %self.name, module = %module.name(), "program step");
            current = module.call(current, ctx).await?;
        }
        Ok(current)
    }

    fn get_config(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema.to_json_schema(),
            "modules": self.modules.iter().map(|m| m.get_config()).collect::<Vec<_>>(),
        })
    }
}
