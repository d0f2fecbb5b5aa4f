//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It backs one project for the lifetime of a conversion run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::component::{Component, ComponentId, Port};
use crate::decision::{Decision, DecisionKey};
use crate::storage::traits::{ComponentStore, DecisionStore, StorageError};
use crate::value::Value;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory component store.
#[derive(Debug, Default)]
pub struct InMemoryComponentStore {
    state: RwLock<BTreeMap<ComponentId, Component>>,
}

impl InMemoryComponentStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComponentStore for InMemoryComponentStore {
    fn insert(&self, component: Component) -> Result<(), StorageError> {
        component.validate()?;
        let mut state = self.state.write().map_err(|_| lock_err("component.insert"))?;
        if state.contains_key(&component.id) {
            return Err(StorageError::DuplicateKey(component.id.to_string()));
        }
        state.insert(component.id.clone(), component);
        Ok(())
    }

    fn get(&self, id: &ComponentId) -> Result<Option<Component>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("component.get"))?;
        Ok(state.get(id).cloned())
    }

    fn update(&self, component: Component) -> Result<(), StorageError> {
        component.validate()?;
        let mut state = self.state.write().map_err(|_| lock_err("component.update"))?;
        let slot = state
            .get_mut(&component.id)
            .ok_or_else(|| StorageError::ComponentNotFound(component.id.clone()))?;
        *slot = component;
        Ok(())
    }

    fn set_attribute(
        &self,
        id: &ComponentId,
        name: &str,
        value: Value,
    ) -> Result<Option<Value>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("component.set_attribute"))?;
        let component = state
            .get_mut(id)
            .ok_or_else(|| StorageError::ComponentNotFound(id.clone()))?;
        Ok(component.set_attribute(name, value)?)
    }

    fn restore_attribute(
        &self,
        id: &ComponentId,
        name: &str,
        previous: Option<Value>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("component.restore_attribute"))?;
        let component = state
            .get_mut(id)
            .ok_or_else(|| StorageError::ComponentNotFound(id.clone()))?;
        match previous {
            Some(value) => {
                component.set_attribute(name, value)?;
            }
            None => {
                component.clear_attribute(name);
            }
        }
        Ok(())
    }

    fn set_ports(&self, id: &ComponentId, ports: Vec<Port>) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("component.set_ports"))?;
        let component = state
            .get_mut(id)
            .ok_or_else(|| StorageError::ComponentNotFound(id.clone()))?;
        component.ports = ports;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Component>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("component.list"))?;
        Ok(state.values().cloned().collect())
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("component.count"))?;
        Ok(state.len())
    }
}

#[derive(Debug, Default)]
struct DecisionState {
    by_key: HashMap<DecisionKey, (u64, Decision)>,
    pending: BTreeMap<u64, DecisionKey>,
    retired: HashSet<DecisionKey>,
    next_seq: u64,
}

/// Thread-safe in-memory decision store.
#[derive(Debug, Default)]
pub struct InMemoryDecisionStore {
    state: RwLock<DecisionState>,
}

impl InMemoryDecisionStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecisionStore for InMemoryDecisionStore {
    fn insert(&self, decision: Decision) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("decision.insert"))?;
        if state.by_key.contains_key(&decision.key) || state.retired.contains(&decision.key) {
            return Err(StorageError::DuplicateKey(decision.key.to_string()));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        if decision.is_pending() {
            state.pending.insert(seq, decision.key.clone());
        }
        state.by_key.insert(decision.key.clone(), (seq, decision));
        Ok(())
    }

    fn get(&self, key: &DecisionKey) -> Result<Option<Decision>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("decision.get"))?;
        Ok(state.by_key.get(key).map(|(_, d)| d.clone()))
    }

    fn resolve(&self, key: &DecisionKey, value: Value, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("decision.resolve"))?;
        let (seq, decision) = state
            .by_key
            .get_mut(key)
            .ok_or_else(|| StorageError::DecisionNotFound(key.clone()))?;
        let seq = *seq;
        if !decision.resolve(value, at) {
            return Ok(false);
        }
        state.pending.remove(&seq);
        Ok(true)
    }

    fn find_pending(&self, limit: Option<usize>) -> Result<Vec<Decision>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("decision.find_pending"))?;
        let limit = limit.unwrap_or(usize::MAX);
        Ok(state
            .pending
            .values()
            .filter_map(|key| state.by_key.get(key).map(|(_, d)| d.clone()))
            .take(limit)
            .collect())
    }

    fn find_resolved(&self) -> Result<Vec<Decision>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("decision.find_resolved"))?;
        let mut resolved: Vec<&(u64, Decision)> = state
            .by_key
            .values()
            .filter(|(_, d)| !d.is_pending())
            .collect();
        resolved.sort_by_key(|(seq, _)| *seq);
        Ok(resolved.into_iter().map(|(_, d)| d.clone()).collect())
    }

    fn count_pending(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("decision.count_pending"))?;
        Ok(state.pending.len())
    }

    fn remove(&self, key: &DecisionKey) -> Result<Decision, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("decision.remove"))?;
        match state.by_key.get(key) {
            None => return Err(StorageError::DecisionNotFound(key.clone())),
            Some((_, d)) if d.is_pending() => return Err(StorageError::StillPending(key.clone())),
            Some(_) => {}
        }
        let (_, decision) = state
            .by_key
            .remove(key)
            .ok_or_else(|| StorageError::DecisionNotFound(key.clone()))?;
        state.retired.insert(key.clone());
        Ok(decision)
    }
}
