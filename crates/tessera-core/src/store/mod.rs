//! Store module
//!
//! Persistence abstraction for trainable variables. Updates are atomic per
//! key, and `lock` serializes read-modify-write cycles such as optimization
//! passes on a single variable. `append_prediction`, `attach_reward` and
//! `set` wait for that lock; `replace` does not and is meant to be called by
//! the lock holder.
//!
//! Note: Implementations are in tessera-stores crate

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::variable::{Instructions, Prediction, TrainableVariable, VariableKey, VariableUpdate};

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Guard held while a variable is exclusively owned by one writer.
pub type VariableGuard = OwnedMutexGuard<()>;

/// Variable store trait
#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Create the variable if absent. Returns `true` when it was created.
    async fn register(
        &self,
        key: &str,
        initial: Option<Instructions>,
    ) -> Result<bool, StoreError>;

    /// Append a prediction and return its index.
    async fn append_prediction(
        &self,
        key: &str,
        prediction: Prediction,
    ) -> Result<usize, StoreError>;

    /// Attach a reward in `[0, 1]` to a recorded prediction.
    async fn attach_reward(&self, key: &str, index: usize, reward: f64) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<TrainableVariable>, StoreError>;

    /// Field-wise merge; returns the committed state.
    async fn set(&self, key: &str, update: VariableUpdate)
        -> Result<TrainableVariable, StoreError>;

    /// Commit a full variable state, upserting by `variable.key`.
    ///
    /// Callers mutating an existing key hold its lock across the
    /// read-modify-replace cycle.
    async fn replace(&self, variable: TrainableVariable) -> Result<(), StoreError>;

    async fn keys(&self) -> Result<Vec<VariableKey>, StoreError>;

    /// Acquire the per-key exclusive lock. Fails with `NotFound` for keys
    /// that are not registered.
    async fn lock(&self, key: &str) -> Result<VariableGuard, StoreError>;
}
