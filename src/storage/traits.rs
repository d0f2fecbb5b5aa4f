//! Abstract storage traits for simlink.
//!
//! These traits define the contract that storage backends must implement.
//! The broker and the project only talk to these traits, so a backend that
//! persists decisions across restarts can replace the in-memory one.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::component::{Component, ComponentId, Port};
use crate::decision::{Decision, DecisionKey};
use crate::error::{ExecutionError, SimlinkError, ValidationError};
use crate::value::Value;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Component not found.
    #[error("Component not found: {0}")]
    ComponentNotFound(ComponentId),

    /// Decision not found.
    #[error("Decision not found: {0}")]
    DecisionNotFound(DecisionKey),

    /// Decision cannot be removed while pending.
    #[error("Decision is still pending: {0}")]
    StillPending(DecisionKey),

    /// Key already exists (or existed).
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The stored object failed validation.
    #[error("Invalid data: {0}")]
    Invalid(#[from] ValidationError),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

impl From<StorageError> for SimlinkError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ComponentNotFound(id) => ExecutionError::ComponentNotFound { id }.into(),
            StorageError::DecisionNotFound(key) => ExecutionError::DecisionNotFound { key }.into(),
            StorageError::StillPending(key) => ExecutionError::DecisionPending { key }.into(),
            StorageError::Invalid(e) => e.into(),
            other => ExecutionError::Storage {
                message: other.to_string(),
            }
            .into(),
        }
    }
}

/// Storage trait for components.
///
/// # Safety Considerations
/// - All mutations should be atomic where possible
/// - Implementations should handle concurrent access safely
pub trait ComponentStore: Send + Sync {
    /// Insert a new component. Returns error if the id already exists.
    fn insert(&self, component: Component) -> Result<(), StorageError>;

    /// Get a component by id.
    fn get(&self, id: &ComponentId) -> Result<Option<Component>, StorageError>;

    /// Replace an existing component. Returns error if not found.
    fn update(&self, component: Component) -> Result<(), StorageError>;

    /// Write one attribute, validating the name against the component kind.
    ///
    /// Returns the value it replaced.
    fn set_attribute(
        &self,
        id: &ComponentId,
        name: &str,
        value: Value,
    ) -> Result<Option<Value>, StorageError>;

    /// Put back what `set_attribute` replaced; `None` empties the slot.
    fn restore_attribute(
        &self,
        id: &ComponentId,
        name: &str,
        previous: Option<Value>,
    ) -> Result<(), StorageError>;

    /// Replace only the ports of a component, leaving attributes untouched.
    fn set_ports(&self, id: &ComponentId, ports: Vec<Port>) -> Result<(), StorageError>;

    /// All components, ordered by id.
    fn list(&self) -> Result<Vec<Component>, StorageError>;

    /// Number of stored components.
    fn count(&self) -> Result<usize, StorageError>;
}

/// Storage trait for decisions.
///
/// # Lifecycle
/// - `insert` only accepts keys never seen before, including removed ones
/// - `resolve` is the only `Pending -> Resolved` transition and happens once
/// - `remove` refuses pending decisions
pub trait DecisionStore: Send + Sync {
    /// Insert a new pending decision.
    fn insert(&self, decision: Decision) -> Result<(), StorageError>;

    /// Get a decision by key (pending or resolved).
    fn get(&self, key: &DecisionKey) -> Result<Option<Decision>, StorageError>;

    /// Atomically resolve a pending decision.
    ///
    /// Returns `Ok(false)` when the decision is already resolved.
    fn resolve(&self, key: &DecisionKey, value: Value, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Pending decisions in registration order, at most `limit` of them.
    fn find_pending(&self, limit: Option<usize>) -> Result<Vec<Decision>, StorageError>;

    /// Resolved decisions still retained, in registration order.
    fn find_resolved(&self) -> Result<Vec<Decision>, StorageError>;

    /// Number of pending decisions.
    fn count_pending(&self) -> Result<usize, StorageError>;

    /// Drop a resolved decision. Its key stays reserved.
    fn remove(&self, key: &DecisionKey) -> Result<Decision, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_component_store_object_safe(_: &dyn ComponentStore) {}
    fn _assert_decision_store_object_safe(_: &dyn DecisionStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::DecisionNotFound(DecisionKey::new("b1.rated_power"));
        assert!(err.to_string().contains("Decision not found"));

        let err = StorageError::BackendError("poisoned".to_string());
        assert!(err.to_string().contains("poisoned"));
    }

    #[test]
    fn test_storage_error_maps_to_execution_errors() {
        let err: SimlinkError = StorageError::StillPending(DecisionKey::new("k")).into();
        assert!(matches!(
            err,
            SimlinkError::Execution(ExecutionError::DecisionPending { .. })
        ));

        let err: SimlinkError = StorageError::Invalid(ValidationError::EmptyAttribute).into();
        assert!(err.is_validation());

        let err: SimlinkError = StorageError::DuplicateKey("k".into()).into();
        assert!(matches!(
            err,
            SimlinkError::Execution(ExecutionError::Storage { .. })
        ));
    }
}
