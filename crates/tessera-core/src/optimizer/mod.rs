//! Optimizer protocol
//!
//! Per-variable state machine:
//!
//! ```text
//! Unbuilt -> Idle <-> Optimizing -> Idle -> (epoch boundary) Finalized -> Idle
//! ```
//!
//! `optimize` backpropagates a batch reward to unscored predictions and, when
//! anything was newly scored, regenerates the variable's instructions through
//! a language-model program. The store-level helpers below run these steps
//! under the variable's per-key lock.

mod opro;
pub mod ranking;

pub use opro::{default_meta_instructions, OproOptimizer, DEFAULT_K_BEST};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::lm::LmError;
use crate::module::ModuleError;
use crate::schema::SchemaError;
use crate::store::{StoreError, VariableStore};
use crate::value::ValueError;
use crate::variable::{TrainableVariable, VariableKey};

/// Program build errors
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no language model configured and no program supplied")]
    MissingLanguageModel,
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("language model error: {0}")]
    Lm(#[from] LmError),
    #[error("invalid optimizer config: {0}")]
    Config(String),
}

/// Optimization errors
#[derive(Debug, Error)]
pub enum OptimizationError {
    #[error("reward must be a finite value in [0, 1], got {0}")]
    InvalidReward(f64),
    #[error("variable '{0}' has not been built")]
    NotBuilt(VariableKey),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("generation returned malformed output: {0}")]
    MalformedOutput(String),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("build error: {0}")]
    Build(#[from] BuildError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl OptimizationError {
    /// Failures raised after local steps were applied to the variable.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Generation(_) | Self::MalformedOutput(_))
    }
}

impl From<ModuleError> for OptimizationError {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::Lm(LmError::Malformed(msg)) => Self::MalformedOutput(msg),
            ModuleError::Value(e) => Self::MalformedOutput(e.to_string()),
            other => Self::Generation(other.to_string()),
        }
    }
}

/// Outcome of one `optimize` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    /// Predictions scored by this call.
    pub backpropagated: usize,
    /// Whether new instructions were generated.
    pub regenerated: bool,
}

impl OptimizeReport {
    pub fn is_noop(&self) -> bool {
        self.backpropagated == 0
    }
}

/// Optimizer trait
#[async_trait]
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    /// Build the generation program once and mark `variables` idle.
    async fn build(&self, variables: &mut [TrainableVariable]) -> Result<(), BuildError>;

    async fn optimize(
        &self,
        variable: &mut TrainableVariable,
        reward: f64,
    ) -> Result<OptimizeReport, OptimizationError>;

    /// Epoch-end reset of transient state.
    async fn finalize(&self, variable: &mut TrainableVariable) -> Result<(), OptimizationError>;

    fn get_config(&self) -> Value;
}

/// Build every variable in `store`.
pub async fn build_stored(
    optimizer: &dyn Optimizer,
    store: &dyn VariableStore,
) -> Result<(), OptimizationError> {
    let keys = store.keys().await?;
    let mut guards = Vec::with_capacity(keys.len());
    let mut variables = Vec::with_capacity(keys.len());
    for key in &keys {
        match store.lock(key).await {
            Ok(guard) => guards.push(guard),
            Err(StoreError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        }
        if let Some(variable) = store.get(key).await? {
            variables.push(variable);
        }
    }
    optimizer.build(&mut variables).await?;
    for variable in variables {
        store.replace(variable).await?;
    }
    debug!(optimizer = %optimizer.name(), variables = keys.len(), "variables built");
    Ok(())
}

/// Run `optimize` on the stored variable under its per-key lock.
///
/// The updated variable is committed on success and on partial failures, so
/// backpropagated rewards and stamped candidates survive a failed generation.
/// A no-op pass commits only when it changed the variable, such as a
/// finalized variable returning to idle. Dropping the future before the
/// commit leaves the stored state untouched.
pub async fn optimize_stored(
    optimizer: &dyn Optimizer,
    store: &dyn VariableStore,
    key: &str,
    reward: f64,
) -> Result<OptimizeReport, OptimizationError> {
    let _guard = store.lock(key).await?;
    let mut variable = store
        .get(key)
        .await?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

    let before = variable.clone();
    let outcome = optimizer.optimize(&mut variable, reward).await;
    match &outcome {
        Ok(report) if report.is_noop() => {
            if variable != before {
                store.replace(variable).await?;
            }
        }
        Ok(_) => store.replace(variable).await?,
        Err(err) if err.is_partial() => {
            warn!(variable = %key, error = %err, "generation failed; keeping backpropagated state");
            store.replace(variable).await?;
        }
        Err(_) => {}
    }
    outcome
}

/// Run `finalize` on the stored variable under its per-key lock.
pub async fn finalize_stored(
    optimizer: &dyn Optimizer,
    store: &dyn VariableStore,
    key: &str,
) -> Result<(), OptimizationError> {
    let _guard = store.lock(key).await?;
    let mut variable = store
        .get(key)
        .await?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
    optimizer.finalize(&mut variable).await?;
    store.replace(variable).await?;
    Ok(())
}
