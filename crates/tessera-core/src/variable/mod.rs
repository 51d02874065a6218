//! Trainable variables
//!
//! Per-variable optimization state: recorded predictions, the active
//! instruction set and the pool of superseded instruction candidates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{self, INSTRUCTIONS_LABEL, PREDICTION_LABEL};
use crate::value::{StructuralValue, ValueError};

/// Stable reference of a trainable variable, e.g. `program/generator`.
pub type VariableKey = String;

/// Rewards are finite values in `[0, 1]`.
pub fn is_valid_reward(reward: f64) -> bool {
    reward.is_finite() && (0.0..=1.0).contains(&reward)
}

/// Anything carrying an optional reward.
pub trait Rewarded {
    fn reward(&self) -> Option<f64>;
}

impl Rewarded for Option<f64> {
    fn reward(&self) -> Option<f64> {
        *self
    }
}

fn default_prediction_label() -> String {
    PREDICTION_LABEL.to_string()
}

fn default_instructions_label() -> String {
    INSTRUCTIONS_LABEL.to_string()
}

/// A recorded generator execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default = "default_prediction_label")]
    pub label: String,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub reward: Option<f64>,
}

impl Prediction {
    pub fn new(inputs: Map<String, Value>, outputs: Map<String, Value>) -> Self {
        Self {
            label: default_prediction_label(),
            inputs,
            outputs,
            reward: None,
        }
    }

    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }

    pub fn to_value(&self) -> Result<StructuralValue, ValueError> {
        to_structural(self, models::prediction())
    }

    pub fn from_value(value: &StructuralValue) -> Result<Self, ValueError> {
        from_structural(value)
    }
}

impl Rewarded for Prediction {
    fn reward(&self) -> Option<f64> {
        self.reward
    }
}

/// An instruction set, optionally stamped with the reward it earned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instructions {
    #[serde(default = "default_instructions_label")]
    pub label: String,
    pub instructions: Vec<String>,
    #[serde(default)]
    pub reward: Option<f64>,
}

impl Instructions {
    pub fn new<I, S>(instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: default_instructions_label(),
            instructions: instructions.into_iter().map(Into::into).collect(),
            reward: None,
        }
    }

    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }

    pub fn to_value(&self) -> Result<StructuralValue, ValueError> {
        to_structural(self, models::instructions())
    }

    pub fn from_value(value: &StructuralValue) -> Result<Self, ValueError> {
        from_structural(value)
    }
}

impl Rewarded for Instructions {
    fn reward(&self) -> Option<f64> {
        self.reward
    }
}

fn to_structural<T: Serialize>(
    item: &T,
    schema: crate::schema::Schema,
) -> Result<StructuralValue, ValueError> {
    let data = serde_json::to_value(item).map_err(|e| ValueError::Format(e.to_string()))?;
    Ok(StructuralValue::construct(schema, data)?)
}

fn from_structural<T: serde::de::DeserializeOwned>(
    value: &StructuralValue,
) -> Result<T, ValueError> {
    serde_json::from_value(Value::Object(value.data().clone()))
        .map_err(|e| ValueError::Format(e.to_string()))
}

/// Optimizer state of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariablePhase {
    #[default]
    Unbuilt,
    Idle,
    Optimizing,
    Finalized,
}

impl VariablePhase {
    pub fn is_built(&self) -> bool {
        !matches!(self, Self::Unbuilt)
    }
}

/// Named, versioned optimization state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainableVariable {
    pub key: VariableKey,
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    #[serde(default)]
    pub instructions: Option<Instructions>,
    #[serde(default)]
    pub instructions_candidates: Vec<Instructions>,
    #[serde(default)]
    pub phase: VariablePhase,
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl TrainableVariable {
    pub fn new(key: impl Into<VariableKey>) -> Self {
        Self {
            key: key.into(),
            predictions: Vec::new(),
            instructions: None,
            instructions_candidates: Vec::new(),
            phase: VariablePhase::Unbuilt,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_instructions(mut self, instructions: Instructions) -> Self {
        self.instructions = Some(instructions);
        self
    }

    pub fn unscored_count(&self) -> usize {
        self.predictions.iter().filter(|p| p.reward.is_none()).count()
    }

    /// Field-wise merge of a partial update.
    pub fn apply(&mut self, update: VariableUpdate) {
        if let Some(predictions) = update.predictions {
            self.predictions = predictions;
        }
        if let Some(instructions) = update.instructions {
            self.instructions = instructions;
        }
        if let Some(candidates) = update.instructions_candidates {
            self.instructions_candidates = candidates;
        }
        if let Some(phase) = update.phase {
            self.phase = phase;
        }
    }

    /// Record a committed write.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct VariableUpdate {
    pub predictions: Option<Vec<Prediction>>,
    pub instructions: Option<Option<Instructions>>,
    pub instructions_candidates: Option<Vec<Instructions>>,
    pub phase: Option<VariablePhase>,
}

impl VariableUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predictions(mut self, predictions: Vec<Prediction>) -> Self {
        self.predictions = Some(predictions);
        self
    }

    pub fn instructions(mut self, instructions: Option<Instructions>) -> Self {
        self.instructions = Some(instructions);
        self
    }

    pub fn instructions_candidates(mut self, candidates: Vec<Instructions>) -> Self {
        self.instructions_candidates = Some(candidates);
        self
    }

    pub fn phase(mut self, phase: VariablePhase) -> Self {
        self.phase = Some(phase);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{is_instructions, is_prediction};
    use serde_json::json;

    #[test]
    fn test_reward_bounds() {
        assert!(is_valid_reward(0.0));
        assert!(is_valid_reward(1.0));
        assert!(!is_valid_reward(1.01));
        assert!(!is_valid_reward(-0.1));
        assert!(!is_valid_reward(f64::NAN));
    }

    #[test]
    fn test_prediction_structural_round_trip() {
        let mut inputs = Map::new();
        inputs.insert("query".to_string(), json!("2+2"));
        let mut outputs = Map::new();
        outputs.insert("answer".to_string(), json!("4"));
        let prediction = Prediction::new(inputs, outputs).with_reward(0.5);

        let value = prediction.to_value().unwrap();
        assert!(is_prediction(&value));
        assert_eq!(Prediction::from_value(&value).unwrap(), prediction);
    }

    #[test]
    fn test_instructions_structural_value() {
        let value = Instructions::new(["be concise"]).to_value().unwrap();
        assert!(is_instructions(&value));
        assert_eq!(value.get_field("reward"), Some(&Value::Null));
    }

    #[test]
    fn test_apply_is_field_wise() {
        let mut variable = TrainableVariable::new("program/generator")
            .with_instructions(Instructions::new(["a"]));
        variable.apply(VariableUpdate::new().phase(VariablePhase::Idle));
        assert_eq!(variable.phase, VariablePhase::Idle);
        assert!(variable.instructions.is_some());

        variable.apply(VariableUpdate::new().instructions(None));
        assert!(variable.instructions.is_none());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(VariablePhase::Finalized).unwrap(),
            json!("finalized")
        );
    }
}
