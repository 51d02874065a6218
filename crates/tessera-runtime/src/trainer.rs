//! Trainer - epoch loop over the stored trainable variables
//!
//! One epoch applies a single batch reward to every variable in the store:
//! each variable runs `optimize` under its per-key lock, all variables
//! concurrently, and every variable is finalized at the epoch boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use tessera_config::TrainingConfig;
use tessera_core::module::{CallContext, Module};
use tessera_core::optimizer::{
    build_stored, finalize_stored, optimize_stored, OptimizationError, Optimizer,
};
use tessera_core::store::{StoreError, VariableStore};
use tessera_core::value::StructuralValue;
use tessera_core::variable::{is_valid_reward, VariableKey};

use crate::hooks::{HookRegistry, TrainingHookContext};

/// Trainer errors
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("epochs must be > 0")]
    InvalidEpochs,
    #[error("dataset is empty")]
    EmptyDataset,
    #[error("batch reward must be a finite value in [0, 1], got {0}")]
    InvalidReward(f64),
    #[error("reward source error: {0}")]
    RewardSource(String),
    #[error(transparent)]
    Optimization(#[from] OptimizationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Trainer configuration
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Upper bound for one variable's optimize step.
    pub generation_timeout: Duration,
    pub finalize_on_epoch_end: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(60),
            finalize_on_epoch_end: true,
        }
    }
}

impl From<&TrainingConfig> for TrainerConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            generation_timeout: Duration::from_secs(config.generation_timeout_secs),
            finalize_on_epoch_end: config.finalize_on_epoch_end,
        }
    }
}

/// Supplies the batch reward of each epoch.
#[async_trait]
pub trait RewardSource: Send + Sync {
    async fn reward(&self, epoch: usize) -> Result<f64, String>;
}

/// Same reward every epoch.
#[derive(Debug, Clone, Copy)]
pub struct FixedReward(pub f64);

#[async_trait]
impl RewardSource for FixedReward {
    async fn reward(&self, _epoch: usize) -> Result<f64, String> {
        Ok(self.0)
    }
}

/// One reward per epoch; the last one repeats.
#[derive(Debug, Clone)]
pub struct ScheduledRewards {
    rewards: Vec<f64>,
}

impl ScheduledRewards {
    pub fn new(rewards: Vec<f64>) -> Self {
        Self { rewards }
    }
}

#[async_trait]
impl RewardSource for ScheduledRewards {
    async fn reward(&self, epoch: usize) -> Result<f64, String> {
        self.rewards
            .get(epoch)
            .or_else(|| self.rewards.last())
            .copied()
            .ok_or_else(|| "reward schedule is empty".to_string())
    }
}

/// Scores one program output against its expected data.
pub trait Metric: Send + Sync {
    fn score(&self, output: &StructuralValue, expected: &Value) -> f64;
}

impl<F> Metric for F
where
    F: Fn(&StructuralValue, &Value) -> f64 + Send + Sync,
{
    fn score(&self, output: &StructuralValue, expected: &Value) -> f64 {
        self(output, expected)
    }
}

/// 1.0 when `field` of the output equals `field` of the expected data.
#[derive(Debug, Clone)]
pub struct ExactMatch {
    field: String,
}

impl ExactMatch {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Metric for ExactMatch {
    fn score(&self, output: &StructuralValue, expected: &Value) -> f64 {
        match (output.get_field(&self.field), expected.get(&self.field)) {
            (Some(actual), Some(expected)) if actual == expected => 1.0,
            _ => 0.0,
        }
    }
}

/// Labeled training example.
#[derive(Debug, Clone)]
pub struct Example {
    pub input: StructuralValue,
    pub expected: Value,
}

impl Example {
    pub fn new(input: StructuralValue, expected: Value) -> Self {
        Self { input, expected }
    }
}

/// Result of one variable's optimize step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariableOutcome {
    Optimized { backpropagated: usize },
    NoOp,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableReport {
    pub variable: VariableKey,
    #[serde(flatten)]
    pub outcome: VariableOutcome,
}

/// Per-epoch training report.
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub reward: f64,
    pub variables: Vec<VariableReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl EpochReport {
    fn count(&self, pred: impl Fn(&VariableOutcome) -> bool) -> usize {
        self.variables.iter().filter(|v| pred(&v.outcome)).count()
    }

    pub fn optimized_count(&self) -> usize {
        self.count(|o| matches!(o, VariableOutcome::Optimized { .. }))
    }

    pub fn noop_count(&self) -> usize {
        self.count(|o| matches!(o, VariableOutcome::NoOp))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, VariableOutcome::Skipped { .. }))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, VariableOutcome::Failed { .. }))
    }

    pub fn outcome(&self, variable: &str) -> Option<&VariableOutcome> {
        self.variables
            .iter()
            .find(|v| v.variable == variable)
            .map(|v| &v.outcome)
    }
}

/// Reports of one `fit` run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingHistory {
    pub run_id: String,
    pub epochs: Vec<EpochReport>,
}

impl TrainingHistory {
    fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            epochs: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&EpochReport> {
        self.epochs.last()
    }

    pub fn rewards(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.reward).collect()
    }

    pub fn total_optimized(&self) -> usize {
        self.epochs.iter().map(EpochReport::optimized_count).sum()
    }
}

/// Drives optimization epochs over a variable store.
pub struct Trainer {
    optimizer: Arc<dyn Optimizer>,
    store: Arc<dyn VariableStore>,
    hooks: Arc<HookRegistry>,
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(optimizer: Arc<dyn Optimizer>, store: Arc<dyn VariableStore>) -> Self {
        Self {
            optimizer,
            store,
            hooks: Arc::new(HookRegistry::new()),
            config: TrainerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TrainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn store(&self) -> &Arc<dyn VariableStore> {
        &self.store
    }

    pub fn optimizer(&self) -> &Arc<dyn Optimizer> {
        &self.optimizer
    }

    /// Build the optimizer program and mark every stored variable idle.
    pub async fn build(&self) -> Result<(), TrainerError> {
        build_stored(self.optimizer.as_ref(), self.store.as_ref()).await?;
        Ok(())
    }

    /// Run `epochs` epochs with rewards drawn from `rewards`.
    pub async fn fit(
        &self,
        epochs: usize,
        rewards: &dyn RewardSource,
    ) -> Result<TrainingHistory, TrainerError> {
        if epochs == 0 {
            return Err(TrainerError::InvalidEpochs);
        }
        self.build().await?;
        let mut history = TrainingHistory::new();
        info!(
            run_id = %history.run_id,
            epochs,
            optimizer = %self.optimizer.name(),
            "training started"
        );
        for epoch in 0..epochs {
            let reward = rewards
                .reward(epoch)
                .await
                .map_err(TrainerError::RewardSource)?;
            let report = self.run_epoch(&history.run_id, epoch, reward).await?;
            history.epochs.push(report);
        }
        info!(
            run_id = %history.run_id,
            total_optimized = history.total_optimized(),
            "training finished"
        );
        Ok(history)
    }

    /// Run `dataset` through `program` in training mode each epoch and use
    /// the mean metric score as that epoch's batch reward.
    pub async fn fit_program(
        &self,
        program: &dyn Module,
        dataset: &[Example],
        epochs: usize,
        metric: &dyn Metric,
    ) -> Result<TrainingHistory, TrainerError> {
        if epochs == 0 {
            return Err(TrainerError::InvalidEpochs);
        }
        if dataset.is_empty() {
            return Err(TrainerError::EmptyDataset);
        }
        self.build().await?;
        let mut history = TrainingHistory::new();
        info!(
            run_id = %history.run_id,
            program = %program.name(),
            examples = dataset.len(),
            epochs,
            "program training started"
        );
        for epoch in 0..epochs {
            let reward = self.evaluate(program, dataset, metric).await;
            let report = self.run_epoch(&history.run_id, epoch, reward).await?;
            history.epochs.push(report);
        }
        Ok(history)
    }

    async fn evaluate(
        &self,
        program: &dyn Module,
        dataset: &[Example],
        metric: &dyn Metric,
    ) -> f64 {
        let mut total = 0.0;
        for example in dataset {
            match program
                .call(example.input.clone(), CallContext::training())
                .await
            {
                Ok(output) => {
                    let score = metric.score(&output, &example.expected);
                    if score.is_finite() {
                        total += score.clamp(0.0, 1.0);
                    }
                }
                Err(err) => {
                    warn!(program = %program.name(), error = %err, "program call failed; scored 0");
                }
            }
        }
        total / dataset.len() as f64
    }

    /// One optimize pass over every stored variable, then finalization.
    pub async fn run_epoch(
        &self,
        run_id: &str,
        epoch: usize,
        reward: f64,
    ) -> Result<EpochReport, TrainerError> {
        if !is_valid_reward(reward) {
            return Err(TrainerError::InvalidReward(reward));
        }
        let started_at = Utc::now();
        let begin = TrainingHookContext::epoch(run_id, epoch, "epoch_begin")
            .with_metadata(json!({ "reward": reward }));
        self.hooks.on_epoch_begin(&begin).await;

        let keys = self.store.keys().await?;
        let outcomes = join_all(
            keys.iter()
                .map(|key| self.optimize_variable(run_id, epoch, key, reward)),
        )
        .await;
        let variables: Vec<VariableReport> = keys
            .into_iter()
            .zip(outcomes)
            .map(|(variable, outcome)| VariableReport { variable, outcome })
            .collect();

        if self.config.finalize_on_epoch_end {
            for report in &variables {
                if let Err(err) =
                    finalize_stored(self.optimizer.as_ref(), self.store.as_ref(), &report.variable)
                        .await
                {
                    warn!(variable = %report.variable, error = %err, "finalize failed");
                }
            }
        }

        let report = EpochReport {
            epoch,
            reward,
            variables,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            run_id,
            epoch,
            reward,
            optimized = report.optimized_count(),
            noop = report.noop_count(),
            skipped = report.skipped_count(),
            failed = report.failed_count(),
            "epoch finished"
        );
        let end = TrainingHookContext::epoch(run_id, epoch, "epoch_end").with_metadata(json!({
            "reward": reward,
            "optimized": report.optimized_count(),
            "noop": report.noop_count(),
            "skipped": report.skipped_count(),
            "failed": report.failed_count(),
        }));
        self.hooks.on_epoch_end(&end).await;
        Ok(report)
    }

    async fn optimize_variable(
        &self,
        run_id: &str,
        epoch: usize,
        key: &str,
        reward: f64,
    ) -> VariableOutcome {
        let timeout = self.config.generation_timeout;
        let step = optimize_stored(self.optimizer.as_ref(), self.store.as_ref(), key, reward);
        let outcome = match tokio::time::timeout(timeout, step).await {
            Ok(Ok(report)) if report.is_noop() => VariableOutcome::NoOp,
            Ok(Ok(report)) => VariableOutcome::Optimized {
                backpropagated: report.backpropagated,
            },
            Ok(Err(err @ OptimizationError::NotBuilt(_))) => VariableOutcome::Skipped {
                reason: err.to_string(),
            },
            Ok(Err(err)) => VariableOutcome::Failed {
                error: err.to_string(),
            },
            Err(_) => VariableOutcome::Skipped {
                reason: format!("timed out after {:?}", timeout),
            },
        };

        let ctx = TrainingHookContext::epoch(run_id, epoch, "variable").for_variable(key);
        match &outcome {
            VariableOutcome::Optimized { backpropagated } => {
                debug!(variable = %key, epoch, backpropagated, "variable optimized");
                self.hooks.on_variable_optimized(&ctx).await;
            }
            VariableOutcome::NoOp => {
                debug!(variable = %key, epoch, "variable had no unscored predictions");
            }
            VariableOutcome::Skipped { reason } => {
                warn!(variable = %key, epoch, reason = %reason, "variable skipped");
                let ctx = TrainingHookContext {
                    phase: "skipped".to_string(),
                    ..ctx
                }
                .with_message(reason.clone());
                self.hooks.on_variable_skipped(&ctx).await;
            }
            VariableOutcome::Failed { error } => {
                warn!(variable = %key, epoch, error = %error, "variable optimization failed");
                let ctx = TrainingHookContext {
                    phase: "failed".to_string(),
                    ..ctx
                }
                .with_message(error.clone());
                self.hooks.on_variable_skipped(&ctx).await;
            }
        }
        outcome
    }
}
