//! # Tessera Stores
//!
//! Store implementations for Tessera trainable variables.
//!
//! This crate provides:
//! - InMemory VariableStore with JSON snapshot/restore

mod variable_store;

pub use variable_store::InMemoryVariableStore;

// Re-export core traits for convenience
pub use tessera_core::store::{StoreError, VariableGuard, VariableStore};
