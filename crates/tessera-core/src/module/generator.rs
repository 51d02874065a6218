use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{config_schema, config_str, CallContext, Module, ModuleError};
use crate::lm::{GenerationRequest, LanguageModel, LanguageModelResolver};
use crate::schema::Schema;
use crate::store::VariableStore;
use crate::value::StructuralValue;
use crate::variable::{Instructions, Prediction, VariableKey};

/// Single language-model call producing a value of `output_schema`.
///
/// Once bound to a store the generator owns one trainable variable keyed by
/// its name: the active instructions are read from it at call time, and
/// training-mode calls append a prediction to it.
pub struct Generator {
    name: String,
    output_schema: Schema,
    language_model: Arc<dyn LanguageModel>,
    instructions: Vec<String>,
    examples: Vec<Prediction>,
    prompt_template: Option<String>,
    static_system_prompt: Option<String>,
    return_inputs: bool,
    store: Option<Arc<dyn VariableStore>>,
}

impl Generator {
    pub fn new(
        name: impl Into<String>,
        output_schema: Schema,
        language_model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            name: name.into(),
            output_schema,
            language_model,
            instructions: Vec::new(),
            examples: Vec::new(),
            prompt_template: None,
            static_system_prompt: None,
            return_inputs: false,
            store: None,
        }
    }

    /// Default instructions, used until the variable holds trained ones.
    pub fn with_instructions<I, S>(mut self, instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instructions = instructions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_examples(mut self, examples: Vec<Prediction>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    pub fn with_static_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.static_system_prompt = Some(prompt.into());
        self
    }

    /// Concatenate the input to the generated output.
    pub fn with_return_inputs(mut self, return_inputs: bool) -> Self {
        self.return_inputs = return_inputs;
        self
    }

    /// Register this generator's variable and keep the store for later calls.
    pub async fn bind(mut self, store: Arc<dyn VariableStore>) -> Result<Self, ModuleError> {
        let initial = if self.instructions.is_empty() {
            None
        } else {
            Some(Instructions::new(self.instructions.clone()))
        };
        store.register(&self.name, initial).await?;
        self.store = Some(store);
        Ok(self)
    }

    pub fn variable_key(&self) -> &str {
        &self.name
    }

    pub fn default_instructions(&self) -> &[String] {
        &self.instructions
    }

    async fn active_instructions(&self) -> Result<Vec<String>, ModuleError> {
        let Some(store) = &self.store else {
            return Ok(self.instructions.clone());
        };
        Ok(store
            .get(&self.name)
            .await?
            .and_then(|variable| variable.instructions)
            .map(|active| active.instructions)
            .unwrap_or_else(|| self.instructions.clone()))
    }

    pub fn from_config(
        config: &Value,
        resolver: &dyn LanguageModelResolver,
    ) -> Result<Self, ModuleError> {
        let lm_config = config
            .get("language_model")
            .ok_or_else(|| ModuleError::Config("missing 'language_model'".to_string()))?;
        let language_model = resolver.resolve(lm_config)?;
        let mut generator = Self::new(
            config_str(config, "name")?,
            config_schema(config, "output_schema")?,
            language_model,
        );
        if let Some(instructions) = config.get("instructions") {
            generator.instructions = serde_json::from_value(instructions.clone())
                .map_err(|e| ModuleError::Config(format!("instructions: {}", e)))?;
        }
        if let Some(examples) = config.get("examples") {
            generator.examples = serde_json::from_value(examples.clone())
                .map_err(|e| ModuleError::Config(format!("examples: {}", e)))?;
        }
        generator.prompt_template = config_str(config, "prompt_template").ok();
        generator.static_system_prompt = config_str(config, "static_system_prompt").ok();
        generator.return_inputs = config
            .get("return_inputs")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(generator)
    }
}

#[async_trait]
impl Module for Generator {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    fn trainable_variables(&self) -> Vec<VariableKey> {
        if self.store.is_some() {
            vec![self.name.clone()]
        } else {
            Vec::new()
        }
    }

    async fn call(
        &self,
        input: StructuralValue,
        ctx: CallContext,
    ) -> Result<StructuralValue, ModuleError> {
        let instructions = self.active_instructions().await?;
        debug!(
            generator = %self.name,
            model = %self.language_model.model_name(),
            instruction_count = instructions.len(),
            training = ctx.training,
            "generator request prepared"
        );
        let request = GenerationRequest {
            input: input.clone(),
            output_schema: self.output_schema.clone(),
            instructions,
            examples: self.examples.clone(),
            prompt_template: self.prompt_template.clone(),
            system_prompt: self.static_system_prompt.clone(),
        };
        let output = self.language_model.generate(request).await?;

        if ctx.training {
            if let Some(store) = &self.store {
                let prediction = Prediction::new(input.data().clone(), output.data().clone());
                let index = store.append_prediction(&self.name, prediction).await?;
                debug!(generator = %self.name, index, "prediction recorded");
            }
        }

        if self.return_inputs {
            Ok(input.concat(&output)?)
        } else {
            Ok(output)
        }
    }

    fn get_config(&self) -> Value {
        json!({
            "name": self.name,
            "output_schema": self.output_schema.to_json_schema(),
            "instructions": self.instructions,
            "examples": self.examples,
            "prompt_template": self.prompt_template,
            "static_system_prompt": self.static_system_prompt,
            "return_inputs": self.return_inputs,
            "language_model": self.language_model.get_config(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::{LmError, ScriptedLanguageModel};
    use crate::schema::{Field, FieldType};

    fn query_value() -> StructuralValue {
        StructuralValue::construct(
            Schema::new([Field::required("query", FieldType::String)]).unwrap(),
            json!({"query": "2+2"}),
        )
        .unwrap()
    }

    fn answer_schema() -> Schema {
        Schema::new([Field::required("answer", FieldType::String)]).unwrap()
    }

    struct ScriptedResolver;

    impl LanguageModelResolver for ScriptedResolver {
        fn resolve(&self, config: &Value) -> Result<Arc<dyn LanguageModel>, LmError> {
            let model = config["model"].as_str().unwrap_or("scripted").to_string();
            Ok(Arc::new(ScriptedLanguageModel::new(model)))
        }
    }

    #[tokio::test]
    async fn test_unbound_generator_uses_default_instructions() {
        let lm = Arc::new(
            ScriptedLanguageModel::new("scripted").with_response(json!({"answer": "4"})),
        );
        let generator = Generator::new("math", answer_schema(), lm.clone())
            .with_instructions(["answer with a number"])
            .with_static_system_prompt("You are a calculator.");

        let output = generator
            .call(query_value(), CallContext::training())
            .await
            .unwrap();
        assert_eq!(output.get_field("answer"), Some(&json!("4")));
        assert!(generator.trainable_variables().is_empty());

        let requests = lm.requests();
        assert_eq!(requests[0].instructions, vec!["answer with a number"]);
        assert_eq!(
            requests[0].system_prompt.as_deref(),
            Some("You are a calculator.")
        );
    }

    #[tokio::test]
    async fn test_return_inputs_concatenates() {
        let lm = Arc::new(
            ScriptedLanguageModel::new("scripted").with_response(json!({"answer": "4"})),
        );
        let generator = Generator::new("math", answer_schema(), lm).with_return_inputs(true);
        let output = generator
            .call(query_value(), CallContext::inference())
            .await
            .unwrap();
        assert_eq!(output.schema().field_names(), vec!["query", "answer"]);
    }

    #[test]
    fn test_config_round_trip() {
        let lm = Arc::new(ScriptedLanguageModel::new("tiny"));
        let generator = Generator::new("math", answer_schema(), lm)
            .with_instructions(["be exact"])
            .with_prompt_template("{{input}}");
        let config = generator.get_config();
        let restored = Generator::from_config(&config, &ScriptedResolver).unwrap();
        assert_eq!(restored.name(), "math");
        assert_eq!(restored.output_schema(), &answer_schema());
        assert_eq!(
            restored.default_instructions().to_vec(),
            vec!["be exact".to_string()]
        );
        assert_eq!(restored.prompt_template.as_deref(), Some("{{input}}"));
        assert_eq!(restored.language_model.model_name(), "tiny");
    }
}
