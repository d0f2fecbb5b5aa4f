//! Storage for components and decisions.
//!
//! Traits define the abstract interface; `memory` holds the in-process backend.

mod memory;
mod traits;

pub use memory::{InMemoryComponentStore, InMemoryDecisionStore};
pub use traits::{ComponentStore, DecisionStore, StorageError};
