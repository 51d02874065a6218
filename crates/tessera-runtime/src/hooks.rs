use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use tessera_core::variable::VariableKey;

/// Training hook context exposed to runtime extensions.
#[derive(Debug, Clone)]
pub struct TrainingHookContext {
    pub run_id: String,
    pub epoch: usize,
    pub variable: Option<VariableKey>,
    pub phase: String,
    pub message: Option<String>,
    pub metadata: Value,
}

impl TrainingHookContext {
    pub fn epoch(run_id: &str, epoch: usize, phase: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            epoch,
            variable: None,
            phase: phase.to_string(),
            message: None,
            metadata: Value::Null,
        }
    }

    pub fn for_variable(mut self, variable: impl Into<VariableKey>) -> Self {
        self.variable = Some(variable.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Training hook extension point.
#[async_trait]
pub trait TrainingHook: Send + Sync {
    async fn on_epoch_begin(&self, _ctx: &TrainingHookContext) -> Result<(), String> {
        Ok(())
    }

    async fn on_epoch_end(&self, _ctx: &TrainingHookContext) -> Result<(), String> {
        Ok(())
    }

    async fn on_variable_optimized(&self, _ctx: &TrainingHookContext) -> Result<(), String> {
        Ok(())
    }

    async fn on_variable_skipped(&self, _ctx: &TrainingHookContext) -> Result<(), String> {
        Ok(())
    }
}

/// Registry for training hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn TrainingHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, hook: Arc<dyn TrainingHook>) {
        self.hooks.write().await.push(hook);
    }

    pub async fn register_many(&self, hooks: Vec<Arc<dyn TrainingHook>>) {
        self.hooks.write().await.extend(hooks);
    }

    async fn snapshot(&self) -> Vec<Arc<dyn TrainingHook>> {
        self.hooks.read().await.clone()
    }

    pub async fn on_epoch_begin(&self, ctx: &TrainingHookContext) {
        for hook in self.snapshot().await {
            if let Err(err) = hook.on_epoch_begin(ctx).await {
                tracing::warn!(error = %err, epoch = ctx.epoch, "training hook on_epoch_begin failed");
            }
        }
    }

    pub async fn on_epoch_end(&self, ctx: &TrainingHookContext) {
        for hook in self.snapshot().await {
            if let Err(err) = hook.on_epoch_end(ctx).await {
                tracing::warn!(error = %err, epoch = ctx.epoch, "training hook on_epoch_end failed");
            }
        }
    }

    pub async fn on_variable_optimized(&self, ctx: &TrainingHookContext) {
        for hook in self.snapshot().await {
            if let Err(err) = hook.on_variable_optimized(ctx).await {
                tracing::warn!(error = %err, phase = %ctx.phase, "training hook on_variable_optimized failed");
            }
        }
    }

    pub async fn on_variable_skipped(&self, ctx: &TrainingHookContext) {
        for hook in self.snapshot().await {
            if let Err(err) = hook.on_variable_skipped(ctx).await {
                tracing::warn!(error = %err, phase = %ctx.phase, "training hook on_variable_skipped failed");
            }
        }
    }
}
