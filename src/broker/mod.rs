//! Decision broker.
//!
//! The broker owns the registry of decisions for one project. It hands out
//! snapshots of pending decisions ("bunches"), validates proposed answers
//! against each decision's kind and condition, and writes accepted values back
//! into the component store. A decision resolves at most once: answers for the
//! same key are serialized, and the first passing answer wins.

mod watch;

pub use watch::{DecisionEvent, DecisionWatch};

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use crossbeam_channel::{Sender, TrySendError};

use crate::component::ComponentId;
use crate::condition;
use crate::decision::{Decision, DecisionBunch, DecisionKey};
use crate::error::{ExecutionError, SimlinkError, SimlinkResult, ValidationError};
use crate::storage::{ComponentStore, DecisionStore, InMemoryComponentStore, InMemoryDecisionStore, StorageError};
use crate::value::Value;

/// Mutexes that registrations, answers and guarded writes are serialized on.
const KEY_LOCK_STRIPES: usize = 64;

/// Broker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Upper bound on decisions per bunch. `None` offers everything pending.
    pub max_bunch_size: Option<usize>,
    /// Buffered events per watch before events are dropped.
    pub watch_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_bunch_size: None,
            watch_capacity: 256,
        }
    }
}

/// Registry and arbiter of decisions for one project.
pub struct DecisionBroker {
    config: BrokerConfig,
    decisions: Arc<dyn DecisionStore>,
    components: Arc<dyn ComponentStore>,
    key_locks: Box<[Mutex<()>]>,
    lock_hasher: RandomState,
    watchers: Mutex<Vec<Sender<DecisionEvent>>>,
    dropped_events: AtomicU64,
    next_sequence: AtomicU64,
}

impl std::fmt::Debug for DecisionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionBroker")
            .field("config", &self.config)
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DecisionBroker {
    /// Creates a broker over the given stores.
    #[must_use]
    pub fn new(
        decisions: Arc<dyn DecisionStore>,
        components: Arc<dyn ComponentStore>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            config,
            decisions,
            components,
            key_locks: (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            lock_hasher: RandomState::new(),
            watchers: Mutex::new(Vec::new()),
            dropped_events: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Creates a broker backed by fresh in-memory stores.
    #[must_use]
    pub fn in_memory(config: BrokerConfig) -> Self {
        Self::new(
            Arc::new(InMemoryDecisionStore::new()),
            Arc::new(InMemoryComponentStore::new()),
            config,
        )
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The component store answers are written back to.
    #[must_use]
    pub fn components(&self) -> &Arc<dyn ComponentStore> {
        &self.components
    }

    /// Registers a new pending decision.
    ///
    /// Targeted decisions must point at an existing component and an
    /// attribute its kind declares. Keys are unique for the broker's lifetime.
    pub fn register(&self, decision: Decision) -> SimlinkResult<DecisionKey> {
        if decision.key.is_blank() {
            return Err(ValidationError::EmptyDecisionKey.into());
        }
        if !decision.is_pending() {
            return Err(ValidationError::InvalidValue {
                reason: format!("decision '{}' must be registered pending", decision.key),
            }
            .into());
        }
        if let Some(target) = &decision.target {
            let component = self
                .components
                .get(&target.component)?
                .ok_or_else(|| ExecutionError::ComponentNotFound {
                    id: target.component.clone(),
                })?;
            component.check_attribute(&target.attribute)?;
        }

        let key = decision.key.clone();
        let _held = self.key_lock(&key)?;

        match self.decisions.insert(decision) {
            Ok(()) => {}
            Err(StorageError::DuplicateKey(_)) => {
                return Err(ExecutionError::DuplicateRegistration { key }.into());
            }
            Err(other) => return Err(other.into()),
        }

        tracing::info!(%key, "decision registered");
        self.emit(&DecisionEvent::Registered { key: key.clone() });
        Ok(key)
    }

    /// Proposes `value` for the decision `key`.
    ///
    /// Returns `Ok(true)` exactly once per key: when the decision was pending,
    /// the value matches the decision kind and passes its condition. The
    /// accepted value is written to the target attribute before the decision
    /// is marked resolved; if the store does not resolve it, the write is
    /// undone. Unknown keys, resolved decisions and rejected values all return
    /// `Ok(false)` and leave every store untouched.
    pub fn answer(&self, key: &DecisionKey, value: Value) -> SimlinkResult<bool> {
        let _held = self.key_lock(key)?;

        let Some(decision) = self.decisions.get(key)? else {
            tracing::debug!(%key, "answer for unknown decision");
            return Ok(false);
        };
        if !decision.is_pending() {
            tracing::debug!(%key, "answer for resolved decision");
            return Ok(false);
        }
        if !decision.kind.accepts(&value) {
            tracing::debug!(%key, %value, kind = %decision.kind, "answer has wrong kind");
            return Ok(false);
        }
        if !self.passes_condition(&decision, &value)? {
            tracing::debug!(%key, %value, "answer failed condition");
            return Ok(false);
        }

        let previous = match &decision.target {
            Some(target) => Some(self.components.set_attribute(
                &target.component,
                &target.attribute,
                value.clone(),
            )?),
            None => None,
        };
        let resolved = self.decisions.resolve(key, value.clone(), Utc::now());
        if !matches!(resolved, Ok(true)) {
            if let (Some(target), Some(previous)) = (&decision.target, previous) {
                tracing::warn!(%key, "decision not resolved; restoring attribute");
                self.components
                    .restore_attribute(&target.component, &target.attribute, previous)?;
            }
            return resolved.map_err(Into::into);
        }

        tracing::info!(%key, %value, "decision resolved");
        self.emit(&DecisionEvent::Resolved {
            key: key.clone(),
            value,
        });
        Ok(true)
    }

    fn passes_condition(&self, decision: &Decision, value: &Value) -> SimlinkResult<bool> {
        let Some(cond) = &decision.condition else {
            return Ok(true);
        };
        let Some(target) = &decision.target else {
            return Ok(cond.check(Some(value)));
        };

        // Evaluate against the component as it would look after the write, so
        // cross-attribute conditions see the neighbours too.
        let Some(mut candidate) = self.components.get(&target.component)? else {
            return Ok(false);
        };
        if candidate.set_attribute(&target.attribute, value.clone()).is_err() {
            return Ok(false);
        }
        Ok(condition::evaluate(&candidate, cond.as_ref()))
    }

    /// Snapshot of currently pending decisions, in registration order.
    ///
    /// Returns `None` when nothing is pending. Every call produces a new bunch
    /// with a higher sequence number.
    pub fn next_bunch(&self) -> SimlinkResult<Option<DecisionBunch>> {
        let pending = self.decisions.find_pending(self.config.max_bunch_size)?;
        if pending.is_empty() {
            return Ok(None);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let decisions: Vec<_> = pending.iter().map(Decision::descriptor).collect();
        tracing::debug!(sequence, size = decisions.len(), "decision bunch offered");
        Ok(Some(DecisionBunch { sequence, decisions }))
    }

    /// Iterator of bunches that ends once nothing is pending.
    ///
    /// The iterator is lazy: each `next` takes a fresh snapshot, so the caller
    /// is expected to answer between steps.
    #[must_use]
    pub fn bunches(&self) -> Bunches<'_> {
        Bunches {
            broker: self,
            failed: false,
        }
    }

    /// Looks up a decision (pending or resolved).
    pub fn get(&self, key: &DecisionKey) -> SimlinkResult<Option<Decision>> {
        Ok(self.decisions.get(key)?)
    }

    pub fn pending_count(&self) -> SimlinkResult<usize> {
        Ok(self.decisions.count_pending()?)
    }

    /// Resolved decisions still retained, in registration order.
    pub fn resolved(&self) -> SimlinkResult<Vec<Decision>> {
        Ok(self.decisions.find_resolved()?)
    }

    /// True when a pending decision targets `attribute` of `component`.
    pub fn is_open(&self, component: &ComponentId, attribute: &str) -> SimlinkResult<bool> {
        let key = DecisionKey::for_attribute(component, attribute);
        Ok(self.decisions.get(&key)?.is_some_and(|d| d.is_pending()))
    }

    /// Writes an attribute unless a pending decision targets it.
    ///
    /// The check and the write happen under the lock of the attribute's
    /// decision key, so a concurrent `register` lands either before the check
    /// or after the write. Returns the replaced value.
    pub fn write_unless_open(
        &self,
        component: &ComponentId,
        attribute: &str,
        value: Value,
    ) -> SimlinkResult<Option<Value>> {
        let key = DecisionKey::for_attribute(component, attribute);
        let _held = self.key_lock(&key)?;
        if self.decisions.get(&key)?.is_some_and(|d| d.is_pending()) {
            return Err(ExecutionError::AttributeLocked {
                component: component.clone(),
                attribute: attribute.to_string(),
            }
            .into());
        }
        Ok(self.components.set_attribute(component, attribute, value)?)
    }

    /// True when every key is known and resolved (or was retired).
    pub fn all_resolved<'a>(&self, keys: impl IntoIterator<Item = &'a DecisionKey>) -> SimlinkResult<bool> {
        for key in keys {
            if self.decisions.get(key)?.is_some_and(|d| d.is_pending()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drops one resolved decision once it has been consumed.
    ///
    /// Fails with `DecisionPending` while the decision is open. The key stays
    /// reserved, so it can never be registered again.
    pub fn remove_resolved(&self, key: &DecisionKey) -> SimlinkResult<Decision> {
        let removed = self.decisions.remove(key)?;
        tracing::debug!(%key, "resolved decision retired");
        Ok(removed)
    }

    /// Drops every resolved decision. Returns how many were removed.
    pub fn retire_resolved(&self) -> SimlinkResult<usize> {
        let resolved = self.decisions.find_resolved()?;
        let mut removed = 0;
        for decision in resolved {
            match self.decisions.remove(&decision.key) {
                Ok(_) => removed += 1,
                Err(StorageError::DecisionNotFound(_)) => {}
                Err(other) => return Err(other.into()),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "resolved decisions retired");
        }
        Ok(removed)
    }

    /// Subscribes to registration and resolution events.
    pub fn watch(&self) -> SimlinkResult<DecisionWatch> {
        let (tx, rx) = crossbeam_channel::bounded(self.config.watch_capacity.max(1));
        self.watchers
            .lock()
            .map_err(|_| SimlinkError::internal("watcher list lock poisoned"))?
            .push(tx);
        Ok(DecisionWatch::new(rx))
    }

    /// Events that did not fit a watcher's buffer.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn emit(&self, event: &DecisionEvent) {
        let Ok(mut watchers) = self.watchers.lock() else {
            tracing::warn!("watcher list lock poisoned; event not delivered");
            return;
        };
        watchers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    // Keys hash onto a fixed set of mutexes; unrelated keys may share one.
    // Never hold two at once.
    fn key_lock(&self, key: &DecisionKey) -> SimlinkResult<MutexGuard<'_, ()>> {
        let stripe = (self.lock_hasher.hash_one(key) % self.key_locks.len() as u64) as usize;
        self.key_locks[stripe]
            .lock()
            .map_err(|_| SimlinkError::internal("decision key lock poisoned"))
    }
}

/// Iterator returned by [`DecisionBroker::bunches`].
#[derive(Debug)]
pub struct Bunches<'a> {
    broker: &'a DecisionBroker,
    failed: bool,
}

impl Iterator for Bunches<'_> {
    type Item = SimlinkResult<DecisionBunch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.broker.next_bunch() {
            Ok(Some(bunch)) => Some(Ok(bunch)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
