//! # Tessera Runtime
//!
//! Training loop and application wiring.
//!
//! Key components:
//! - `Trainer`: epoch loop applying batch rewards to every stored variable
//! - `HookRegistry`: extension points around epochs and variables
//! - `TrainingApp`: single-config bootstrap (store, optimizer, tracing)

pub mod bootstrap;
pub mod hooks;
pub mod trainer;

pub use bootstrap::{train_from_config, BootstrapError, TrainingApp};
pub use hooks::{HookRegistry, TrainingHook, TrainingHookContext};
pub use trainer::{
    EpochReport, Example, ExactMatch, FixedReward, Metric, RewardSource, ScheduledRewards,
    Trainer, TrainerConfig, TrainerError, TrainingHistory, VariableOutcome, VariableReport,
};
