//! Decisions: open questions the pipeline cannot answer on its own.
//!
//! A decision is raised when an attribute value is missing or fails its
//! condition. It stays `Pending` until an external actor supplies a value that
//! passes the decision's kind and condition, then becomes `Resolved` for good.
//! Resolved decisions are kept for audit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::component::ComponentId;
use crate::condition::SharedCondition;
use crate::value::Value;

/// Unique key of a decision within one project.
///
/// Targeted decisions use `"<component-id>.<attribute>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionKey(String);

impl DecisionKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the decision that fills `attribute` of `component`.
    #[must_use]
    pub fn for_attribute(component: &ComponentId, attribute: &str) -> Self {
        Self(format!("{component}.{attribute}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolution state. `Resolved` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Resolved,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// Kind of answer a decision expects; doubles as the client's type hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionKind {
    /// A yes/no answer.
    Bool,
    /// A number, optionally in a given unit.
    Real {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// One of a fixed set of strings.
    Choice { options: Vec<String> },
    /// Free text.
    Text,
    /// Any non-null value; the condition does the gating.
    Any,
}

impl DecisionKind {
    /// Returns true if `value` has the shape this kind expects.
    ///
    /// `Null` is never an answer.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Bool => value.is_bool(),
            Self::Real { .. } => value.is_numeric(),
            Self::Choice { options } => value
                .as_string()
                .map_or(false, |s| options.iter().any(|o| o == s)),
            Self::Text => value.is_string(),
            Self::Any => !value.is_null(),
        }
    }
}

impl Default for DecisionKind {
    fn default() -> Self {
        Self::Any
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Real { unit: Some(unit) } => write!(f, "real[{unit}]"),
            Self::Real { unit: None } => write!(f, "real"),
            Self::Choice { options } => write!(f, "choice({})", options.join("|")),
            Self::Text => write!(f, "text"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// The component attribute a decision fills once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeTarget {
    pub component: ComponentId,
    pub attribute: String,
}

/// An open (or answered) question.
#[derive(Debug, Clone)]
pub struct Decision {
    pub key: DecisionKey,
    pub prompt: String,
    pub kind: DecisionKind,
    pub target: Option<AttributeTarget>,
    pub condition: Option<SharedCondition>,
    /// Free-form context shown to the resolver.
    pub context: serde_json::Value,
    pub status: DecisionStatus,
    pub value: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Decision {
    /// Creates a pending decision that is not bound to a component.
    #[must_use]
    pub fn new(key: DecisionKey, prompt: impl Into<String>) -> Self {
        Self {
            key,
            prompt: prompt.into(),
            kind: DecisionKind::Any,
            target: None,
            condition: None,
            context: serde_json::Value::Null,
            status: DecisionStatus::Pending,
            value: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Creates a pending decision that fills `attribute` of `component`.
    #[must_use]
    pub fn for_attribute(
        component: ComponentId,
        attribute: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let attribute = attribute.into();
        let mut decision = Self::new(DecisionKey::for_attribute(&component, &attribute), prompt);
        decision.target = Some(AttributeTarget { component, attribute });
        decision
    }

    #[must_use]
    pub fn with_kind(mut self, kind: DecisionKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: SharedCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == DecisionStatus::Pending
    }

    /// Marks the decision resolved. Returns false if it already was.
    pub(crate) fn resolve(&mut self, value: Value, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = DecisionStatus::Resolved;
        self.value = Some(value);
        self.resolved_at = Some(at);
        true
    }

    /// What a resolver gets to see.
    #[must_use]
    pub fn descriptor(&self) -> DecisionDescriptor {
        DecisionDescriptor {
            key: self.key.clone(),
            prompt: self.prompt.clone(),
            kind: self.kind.clone(),
            condition: self.condition.as_ref().map(ToString::to_string),
            context: self.context.clone(),
        }
    }
}

/// Resolver-facing view of a pending decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionDescriptor {
    pub key: DecisionKey,
    pub prompt: String,
    pub kind: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Snapshot of pending decisions offered together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBunch {
    /// Monotonic per-broker sequence number.
    pub sequence: u64,
    pub decisions: Vec<DecisionDescriptor>,
}

impl DecisionBunch {
    pub fn keys(&self) -> impl Iterator<Item = &DecisionKey> {
        self.decisions.iter().map(|d| &d.key)
    }

    #[must_use]
    pub fn get(&self, key: &DecisionKey) -> Option<&DecisionDescriptor> {
        self.decisions.iter().find(|d| &d.key == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}
