//! # Tessera Core
//!
//! Structural data models and the prompt-optimization protocol.
//!
//! Key components:
//! - `schema`: structural schemas with compose / contains / mask algebra
//! - `value`: schema-validated structural values
//! - `models`: reference data models and recognizer predicates
//! - `variable`: trainable variables (predictions, instructions, candidates)
//! - `store`: async variable store abstraction
//! - `lm`: language-model boundary
//! - `module`: generator, chain-of-thought and program composition
//! - `optimizer`: reward backpropagation and instruction regeneration

pub mod lm;
pub mod models;
pub mod module;
pub mod optimizer;
pub mod schema;
pub mod store;
pub mod value;
pub mod variable;

pub mod prelude {
    pub use crate::lm::{
        GenerationRequest, LanguageModel, LanguageModelResolver, LmError, ScriptedLanguageModel,
    };
    pub use crate::module::{CallContext, ChainOfThought, Generator, Module, ModuleError, Program};
    pub use crate::optimizer::{
        build_stored, finalize_stored, optimize_stored, BuildError, OptimizationError,
        OptimizeReport, Optimizer, OproOptimizer,
    };
    pub use crate::schema::{Field, FieldType, Schema, SchemaError};
    pub use crate::store::{StoreError, VariableStore};
    pub use crate::value::{FieldViolation, StructuralValue, ValidationError, ValueError};
    pub use crate::variable::{
        Instructions, Prediction, Rewarded, TrainableVariable, VariableKey, VariablePhase,
        VariableUpdate,
    };
}
