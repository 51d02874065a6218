//! Optimization by PROmpting.
//!
//! Instructions are regenerated by a language model that is shown the best
//! previous instruction candidates and the best predictions, each with its
//! reward.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::ranking::top_k;
use super::{BuildError, OptimizationError, OptimizeReport, Optimizer};
use crate::lm::{LanguageModel, LanguageModelResolver};
use crate::models;
use crate::module::{CallContext, Generator, Module, Program};
use crate::schema::{Field, FieldType, Schema, SchemaError};
use crate::value::StructuralValue;
use crate::variable::{
    is_valid_reward, Instructions, Prediction, TrainableVariable, VariablePhase,
};

pub const DEFAULT_K_BEST: usize = 10;
const DEFAULT_NAME: &str = "opro";
const DEFAULT_DESCRIPTION: &str = "Optimization by PROmpting";

/// Instructions given to the instruction-writing generator.
pub fn default_meta_instructions() -> Vec<String> {
    vec![
        "Your task is to generate instructions that maximize rewards.".to_string(),
        "The reward ranges from 0.0 to 1.0".to_string(),
        "Below are some previous instructions candidates with their rewards.".to_string(),
        "Generate instructions that are different from all the candidates instructions."
            .to_string(),
        "The instructions should be concise, effective and generally applicable to all predictions below."
            .to_string(),
    ]
}

/// OPRO optimizer.
///
/// The generation program is built lazily, at most once, from the configured
/// language model unless a program was supplied up front.
pub struct OproOptimizer {
    name: String,
    description: String,
    k_best: usize,
    language_model: Option<Arc<dyn LanguageModel>>,
    meta_instructions: Vec<String>,
    program: OnceCell<Arc<dyn Module>>,
}

impl Default for OproOptimizer {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            k_best: DEFAULT_K_BEST,
            language_model: None,
            meta_instructions: default_meta_instructions(),
            program: OnceCell::new(),
        }
    }
}

impl OproOptimizer {
    pub fn new(language_model: Arc<dyn LanguageModel>) -> Self {
        Self {
            language_model: Some(language_model),
            ..Self::default()
        }
    }

    /// Use a caller-supplied generation program instead of building one.
    pub fn from_program(program: Arc<dyn Module>) -> Self {
        Self {
            program: OnceCell::new_with(Some(program)),
            ..Self::default()
        }
    }

    pub fn with_k_best(mut self, k_best: usize) -> Self {
        self.k_best = k_best.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_meta_instructions(mut self, instructions: Vec<String>) -> Self {
        self.meta_instructions = instructions;
        self
    }

    pub fn k_best(&self) -> usize {
        self.k_best
    }

    /// `{instructions_candidates: list<Instructions>, predictions: list<Prediction>}`
    pub fn input_schema() -> Schema {
        Schema::from_unique(
            "OPROInputs",
            vec![
                Field::required(
                    "instructions_candidates",
                    FieldType::list(FieldType::Object(models::instructions())),
                )
                .with_description("The list of previous instructions candidates"),
                Field::required(
                    "predictions",
                    FieldType::list(FieldType::Object(models::prediction())),
                )
                .with_description("The list of previous predictions"),
            ],
        )
    }

    /// `Instructions` without its bookkeeping `label` and `reward` fields.
    pub fn output_schema() -> Result<Schema, SchemaError> {
        models::instructions().mask(["label", "reward"])
    }

    async fn program(&self) -> Result<&Arc<dyn Module>, BuildError> {
        self.program
            .get_or_try_init(|| async {
                let language_model = self
                    .language_model
                    .clone()
                    .ok_or(BuildError::MissingLanguageModel)?;
                let generator = Generator::new(
                    format!("{}_generator", self.name),
                    Self::output_schema()?,
                    language_model,
                )
                .with_instructions(self.meta_instructions.clone());
                let program =
                    Program::new(format!("{}_program", self.name), Self::input_schema())
                        .with_description("Generate new instructions from rewarded history")
                        .then(Arc::new(generator));
                info!(optimizer = %self.name, k_best = self.k_best, "optimizer program built");
                Ok::<_, BuildError>(Arc::new(program) as Arc<dyn Module>)
            })
            .await
    }

    fn pool_value(
        candidates: &[Instructions],
        predictions: &[Prediction],
    ) -> Result<StructuralValue, OptimizationError> {
        Self::input_value(json!({
            "instructions_candidates": candidates,
            "predictions": predictions,
        }))
    }

    /// Rejected pools surface as generation failures, keeping the rewards
    /// already broadcast to the variable.
    fn input_value(data: Value) -> Result<StructuralValue, OptimizationError> {
        StructuralValue::construct(Self::input_schema(), data)
            .map_err(|e| {
                OptimizationError::Generation(format!("generation input rejected: {}", e))
            })
    }

    pub fn from_config(
        config: &Value,
        resolver: &dyn LanguageModelResolver,
    ) -> Result<Self, BuildError> {
        let mut optimizer = match config.get("language_model") {
            Some(lm) if !lm.is_null() => Self::new(resolver.resolve(lm)?),
            _ => Self::default(),
        };
        if let Some(k_best) = config.get("k_best") {
            let k_best = k_best
                .as_u64()
                .ok_or_else(|| BuildError::Config("k_best must be an integer".to_string()))?;
            optimizer = optimizer.with_k_best(k_best as usize);
        }
        if let Some(name) = config.get("name").and_then(|v| v.as_str()) {
            optimizer.name = name.to_string();
        }
        if let Some(description) = config.get("description").and_then(|v| v.as_str()) {
            optimizer.description = description.to_string();
        }
        if let Some(meta) = config.get("meta_instructions") {
            optimizer.meta_instructions = serde_json::from_value(meta.clone())
                .map_err(|e| BuildError::Config(format!("meta_instructions: {}", e)))?;
        }
        Ok(optimizer)
    }
}

#[async_trait]
impl Optimizer for OproOptimizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build(&self, variables: &mut [TrainableVariable]) -> Result<(), BuildError> {
        self.program().await?;
        for variable in variables.iter_mut() {
            if variable.phase == VariablePhase::Unbuilt {
                variable.phase = VariablePhase::Idle;
            }
        }
        Ok(())
    }

    async fn optimize(
        &self,
        variable: &mut TrainableVariable,
        reward: f64,
    ) -> Result<OptimizeReport, OptimizationError> {
        if !is_valid_reward(reward) {
            return Err(OptimizationError::InvalidReward(reward));
        }
        if !variable.phase.is_built() {
            return Err(OptimizationError::NotBuilt(variable.key.clone()));
        }
        let program = self.program().await?;

        variable.phase = VariablePhase::Optimizing;
        let mut backpropagated = 0;
        for prediction in variable.predictions.iter_mut() {
            if prediction.reward.is_none() {
                prediction.reward = Some(reward);
                backpropagated += 1;
            }
        }
        if backpropagated == 0 {
            variable.phase = VariablePhase::Idle;
            debug!(variable = %variable.key, "no unscored predictions; skipping regeneration");
            return Ok(OptimizeReport::default());
        }

        if let Some(active) = &variable.instructions {
            variable
                .instructions_candidates
                .push(active.clone().with_reward(reward));
        }

        let predictions = top_k(&variable.predictions, self.k_best);
        let candidates = top_k(&variable.instructions_candidates, self.k_best);
        info!(
            optimizer = %self.name,
            variable = %variable.key,
            reward,
            backpropagated,
            candidate_count = candidates.len(),
            prediction_count = predictions.len(),
            "regenerating instructions"
        );

        let outcome = match Self::pool_value(&candidates, &predictions) {
            Ok(input) => program
                .call(input, CallContext::inference())
                .await
                .map_err(OptimizationError::from),
            Err(err) => Err(err),
        };
        variable.phase = VariablePhase::Idle;
        let output = outcome?;

        let generated = output.get_field("instructions").cloned().ok_or_else(|| {
            OptimizationError::MalformedOutput("missing 'instructions'".to_string())
        })?;
        let generated: Vec<String> = serde_json::from_value(generated)
            .map_err(|e| OptimizationError::MalformedOutput(e.to_string()))?;
        debug!(
            variable = %variable.key,
            instruction_count = generated.len(),
            "instructions regenerated"
        );
        variable.instructions = Some(Instructions::new(generated));

        Ok(OptimizeReport {
            backpropagated,
            regenerated: true,
        })
    }

    async fn finalize(&self, variable: &mut TrainableVariable) -> Result<(), OptimizationError> {
        variable.instructions_candidates.clear();
        if variable.phase.is_built() {
            variable.phase = VariablePhase::Finalized;
        }
        Ok(())
    }

    fn get_config(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "k_best": self.k_best,
            "meta_instructions": self.meta_instructions,
            "language_model": self.language_model.as_ref().map(|lm| lm.get_config()),
            "program": self.program.get().map(|p| p.get_config()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::{LmError, ScriptedLanguageModel};
    use serde_json::Map;

    fn prediction(reward: Option<f64>, tag: &str) -> Prediction {
        let mut inputs = Map::new();
        inputs.insert("tag".to_string(), json!(tag));
        let mut p = Prediction::new(inputs, Map::new());
        p.reward = reward;
        p
    }

    fn built_variable(rewards: &[Option<f64>]) -> TrainableVariable {
        let mut variable = TrainableVariable::new("program/generator")
            .with_instructions(Instructions::new(["initial"]));
        variable.phase = VariablePhase::Idle;
        variable.predictions = rewards
            .iter()
            .enumerate()
            .map(|(i, r)| prediction(*r, &format!("p{}", i)))
            .collect();
        variable
    }

    fn new_instructions() -> Value {
        json!({"instructions": ["think step by step"]})
    }

    #[tokio::test]
    async fn test_build_requires_language_model_or_program() {
        let optimizer = OproOptimizer::default();
        let mut variables = vec![TrainableVariable::new("a")];
        let err = optimizer.build(&mut variables).await.unwrap_err();
        assert!(matches!(err, BuildError::MissingLanguageModel));
        assert_eq!(variables[0].phase, VariablePhase::Unbuilt);
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted"));
        let optimizer = OproOptimizer::new(lm);
        let mut variables = vec![TrainableVariable::new("a")];
        optimizer.build(&mut variables).await.unwrap();
        let first = optimizer.program.get().map(Arc::as_ptr);
        optimizer.build(&mut variables).await.unwrap();
        assert_eq!(optimizer.program.get().map(Arc::as_ptr), first);
        assert_eq!(variables[0].phase, VariablePhase::Idle);
    }

    #[tokio::test]
    async fn test_optimize_broadcasts_reward_and_regenerates_once() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted").with_response(new_instructions()));
        let optimizer = OproOptimizer::new(lm.clone());
        let mut variable = built_variable(&[Some(0.5), None, None]);

        let report = optimizer.optimize(&mut variable, 0.9).await.unwrap();
        assert_eq!(
            report,
            OptimizeReport {
                backpropagated: 2,
                regenerated: true
            }
        );
        let rewards: Vec<Option<f64>> = variable.predictions.iter().map(|p| p.reward).collect();
        assert_eq!(rewards, vec![Some(0.5), Some(0.9), Some(0.9)]);
        assert_eq!(lm.call_count(), 1);

        assert_eq!(variable.instructions_candidates.len(), 1);
        assert_eq!(variable.instructions_candidates[0].instructions, vec!["initial"]);
        assert_eq!(variable.instructions_candidates[0].reward, Some(0.9));
        let active = variable.instructions.as_ref().unwrap();
        assert_eq!(active.instructions, vec!["think step by step"]);
        assert_eq!(active.reward, None);
        assert_eq!(active.label, "Instructions");
        assert_eq!(variable.phase, VariablePhase::Idle);

        let request = &lm.requests()[0];
        assert_eq!(request.instructions, default_meta_instructions());
        assert_eq!(request.output_schema.field_names(), vec!["instructions"]);
    }

    #[tokio::test]
    async fn test_optimize_is_noop_when_fully_scored() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted").with_fallback(new_instructions()));
        let optimizer = OproOptimizer::new(lm.clone());
        let mut variable = built_variable(&[Some(0.2), Some(0.4)]);
        let before = variable.clone();

        let report = optimizer.optimize(&mut variable, 0.7).await.unwrap();
        assert!(report.is_noop());
        assert!(!report.regenerated);
        assert_eq!(lm.call_count(), 0);
        assert_eq!(variable, before);
    }

    #[tokio::test]
    async fn test_optimize_with_zero_predictions_is_noop() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted"));
        let optimizer = OproOptimizer::new(lm.clone());
        let mut variable = built_variable(&[]);
        assert!(optimizer.optimize(&mut variable, 0.5).await.unwrap().is_noop());
        assert_eq!(lm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_is_truncated_to_k_best() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted").with_response(new_instructions()));
        let optimizer = OproOptimizer::new(lm.clone()).with_k_best(2);
        let mut variable = built_variable(&[Some(0.9), Some(0.1), Some(0.5), Some(0.7), None]);

        optimizer.optimize(&mut variable, 0.3).await.unwrap();
        let request = &lm.requests()[0];
        let pool = request.input.get_field("predictions").unwrap().as_array().unwrap();
        let rewards: Vec<f64> = pool.iter().map(|p| p["reward"].as_f64().unwrap()).collect();
        assert_eq!(rewards, vec![0.9, 0.7]);
        assert_eq!(variable.predictions.len(), 5);
    }

    #[tokio::test]
    async fn test_candidate_pool_is_truncated_to_k_best() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted").with_response(new_instructions()));
        let optimizer = OproOptimizer::new(lm.clone()).with_k_best(2);
        let mut variable = built_variable(&[None]);
        variable.instructions_candidates = vec![
            Instructions::new(["low"]).with_reward(0.2),
            Instructions::new(["unscored"]),
            Instructions::new(["best"]).with_reward(0.8),
            Instructions::new(["mid"]).with_reward(0.5),
        ];

        optimizer.optimize(&mut variable, 0.3).await.unwrap();
        let request = &lm.requests()[0];
        let pool = request
            .input
            .get_field("instructions_candidates")
            .unwrap()
            .as_array()
            .unwrap();
        let ranked: Vec<(String, f64)> = pool
            .iter()
            .map(|c| {
                (
                    c["instructions"][0].as_str().unwrap().to_string(),
                    c["reward"].as_f64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            ranked,
            vec![("best".to_string(), 0.8), ("mid".to_string(), 0.5)]
        );

        // The full history is kept; the active set was stamped and appended.
        assert_eq!(variable.instructions_candidates.len(), 5);
        let stamped = variable.instructions_candidates.last().unwrap();
        assert_eq!(stamped.instructions, vec!["initial"]);
        assert_eq!(stamped.reward, Some(0.3));
    }

    #[test]
    fn test_rejected_generation_input_is_partial() {
        let err = OproOptimizer::input_value(json!({
            "instructions_candidates": "not a list",
            "predictions": [],
        }))
        .unwrap_err();
        assert!(matches!(err, OptimizationError::Generation(_)));
        assert!(err.is_partial());
    }

    #[tokio::test]
    async fn test_failed_generation_keeps_local_steps() {
        let lm = Arc::new(
            ScriptedLanguageModel::new("scripted").with_error(LmError::Http("timeout".to_string())),
        );
        let optimizer = OproOptimizer::new(lm);
        let mut variable = built_variable(&[None]);

        let err = optimizer.optimize(&mut variable, 0.6).await.unwrap_err();
        assert!(matches!(err, OptimizationError::Generation(_)));
        assert!(err.is_partial());
        assert_eq!(variable.predictions[0].reward, Some(0.6));
        assert_eq!(variable.instructions_candidates.len(), 1);
        assert_eq!(
            variable.instructions.as_ref().unwrap().instructions,
            vec!["initial"]
        );
        assert_eq!(variable.phase, VariablePhase::Idle);
    }

    #[tokio::test]
    async fn test_malformed_generation_output() {
        let lm = Arc::new(
            ScriptedLanguageModel::new("scripted").with_response(json!({"instructions": "nope"})),
        );
        let optimizer = OproOptimizer::new(lm);
        let mut variable = built_variable(&[None]);
        let err = optimizer.optimize(&mut variable, 0.6).await.unwrap_err();
        assert!(matches!(err, OptimizationError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn test_invalid_reward_and_unbuilt_variable() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted"));
        let optimizer = OproOptimizer::new(lm);
        let mut variable = built_variable(&[None]);
        assert!(matches!(
            optimizer.optimize(&mut variable, 1.5).await,
            Err(OptimizationError::InvalidReward(_))
        ));
        assert_eq!(variable.predictions[0].reward, None);

        variable.phase = VariablePhase::Unbuilt;
        assert!(matches!(
            optimizer.optimize(&mut variable, 0.5).await,
            Err(OptimizationError::NotBuilt(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_clears_candidates_only() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted"));
        let optimizer = OproOptimizer::new(lm);
        let mut variable = built_variable(&[Some(0.4)]);
        variable.instructions_candidates = vec![Instructions::new(["old"]).with_reward(0.2)];
        let predictions = variable.predictions.clone();
        let instructions = variable.instructions.clone();

        optimizer.finalize(&mut variable).await.unwrap();
        assert!(variable.instructions_candidates.is_empty());
        assert_eq!(variable.predictions, predictions);
        assert_eq!(variable.instructions, instructions);
        assert_eq!(variable.phase, VariablePhase::Finalized);
    }

    #[tokio::test]
    async fn test_finalize_with_several_candidates_keeps_active_instructions() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted"));
        let optimizer = OproOptimizer::new(lm);
        let mut variable = built_variable(&[Some(0.4), Some(0.6)]);
        variable.instructions = Some(Instructions::new(["current"]));
        variable.instructions_candidates = vec![
            Instructions::new(["first"]).with_reward(0.2),
            Instructions::new(["second"]).with_reward(0.7),
            Instructions::new(["third"]),
        ];

        optimizer.finalize(&mut variable).await.unwrap();
        assert!(variable.instructions_candidates.is_empty());
        assert_eq!(
            variable.instructions.as_ref().unwrap().instructions,
            vec!["current"]
        );
        assert_eq!(variable.predictions.len(), 2);
        assert_eq!(variable.phase, VariablePhase::Finalized);
    }

    #[tokio::test]
    async fn test_finalized_variable_reenters_idle() {
        let lm = Arc::new(ScriptedLanguageModel::new("scripted").with_response(new_instructions()));
        let optimizer = OproOptimizer::new(lm);
        let mut variable = built_variable(&[None]);
        variable.phase = VariablePhase::Finalized;
        optimizer.optimize(&mut variable, 0.5).await.unwrap();
        assert_eq!(variable.phase, VariablePhase::Idle);
    }

    struct ScriptedResolver;

    impl LanguageModelResolver for ScriptedResolver {
        fn resolve(
            &self,
            config: &Value,
        ) -> Result<Arc<dyn LanguageModel>, crate::lm::LmError> {
            let model = config["model"].as_str().unwrap_or_default().to_string();
            Ok(Arc::new(ScriptedLanguageModel::new(model)))
        }
    }

    #[test]
    fn test_config_round_trip() {
        let lm = Arc::new(ScriptedLanguageModel::new("meta-model"));
        let optimizer = OproOptimizer::new(lm).with_k_best(3).with_name("opro_qa");
        let config = optimizer.get_config();
        assert_eq!(config["k_best"], json!(3));
        assert_eq!(config["language_model"]["model"], json!("meta-model"));

        let restored = OproOptimizer::from_config(&config, &ScriptedResolver).unwrap();
        assert_eq!(restored.k_best(), 3);
        assert_eq!(restored.name(), "opro_qa");
        assert_eq!(restored.get_config()["language_model"], config["language_model"]);
    }
}
