//! Projects: one imported model with its components and decision broker.
//!
//! A project is the unit a resolver selects remotely. It runs the pipeline in
//! order: components are added, ports are matched, then enrichment raises a
//! decision for every required attribute that is missing or fails its
//! condition. The project owns exactly one broker; there is no global
//! registry of decisions.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{BrokerConfig, DecisionBroker};
use crate::component::{Component, ComponentId, ComponentKind};
use crate::condition::{self, ConditionSpec, SharedCondition};
use crate::decision::{Decision, DecisionKey, DecisionKind};
use crate::error::{ExecutionError, SimlinkError, SimlinkResult, ValidationError};
use crate::storage::{ComponentStore, DecisionStore, InMemoryComponentStore, InMemoryDecisionStore};
use crate::topology::{TopologyBuilder, TopologyConfig, TopologyGraph, TopologyReport};
use crate::value::Value;

/// Unique identifier for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Creates a new random project ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the textual form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ValidationError::InvalidValue {
                reason: format!("invalid project id '{s}': {e}"),
            })
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An attribute every matching component must carry.
///
/// Components of a kind that does not declare the attribute are ignored.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub kind: Option<ComponentKind>,
    pub attribute: String,
    /// `None` only requires the attribute to be present.
    pub condition: Option<SharedCondition>,
    /// Prompt template; `{component}`, `{kind}` and `{attribute}` are substituted.
    pub prompt: Option<String>,
    pub decision_kind: DecisionKind,
}

impl Requirement {
    /// Requires `attribute` on every component that declares it.
    #[must_use]
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            kind: None,
            attribute: attribute.into(),
            condition: None,
            prompt: None,
            decision_kind: DecisionKind::Any,
        }
    }

    #[must_use]
    pub fn for_kind(mut self, kind: ComponentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: SharedCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_decision_kind(mut self, kind: DecisionKind) -> Self {
        self.decision_kind = kind;
        self
    }

    /// True if the requirement covers `component`.
    #[must_use]
    pub fn applies_to(&self, component: &Component) -> bool {
        self.kind.map_or(true, |k| k == component.kind) && component.kind.recognizes(&self.attribute)
    }

    /// True if `component` already meets the requirement.
    #[must_use]
    pub fn satisfied_by(&self, component: &Component) -> bool {
        match &self.condition {
            Some(cond) => condition::evaluate(component, cond.as_ref()),
            None => component
                .attribute(&self.attribute)
                .is_some_and(|v| !v.is_null()),
        }
    }

    fn prompt_for(&self, component: &Component) -> String {
        match &self.prompt {
            Some(template) => template
                .replace("{component}", component.id.as_str())
                .replace("{kind}", &component.kind.to_string())
                .replace("{attribute}", &self.attribute),
            None => format!(
                "Enter {} for {} {}",
                self.attribute, component.kind, component.id
            ),
        }
    }

    /// The decision raised when `component` misses this requirement.
    #[must_use]
    pub fn decision_for(&self, component: &Component) -> Decision {
        let current = component
            .attribute(&self.attribute)
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or(serde_json::Value::Null);
        let context = serde_json::json!({
            "component": component.id.as_str(),
            "kind": component.kind.to_string(),
            "name": component.name,
            "current": current,
        });

        let mut decision =
            Decision::for_attribute(component.id.clone(), &self.attribute, self.prompt_for(component))
                .with_kind(self.decision_kind.clone())
                .with_context(context);
        if let Some(cond) = &self.condition {
            decision = decision.with_condition(Arc::clone(cond));
        }
        decision
    }
}

/// Serializable requirement, as found in model snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ComponentKind>,
    /// Defaults to the attribute the condition reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub decision_kind: DecisionKind,
}

impl RequirementSpec {
    pub fn build(&self) -> Result<Requirement, ValidationError> {
        let attribute = self
            .attribute
            .clone()
            .or_else(|| self.condition.as_ref().map(|c| c.attribute().to_string()))
            .filter(|a| !a.trim().is_empty())
            .ok_or(ValidationError::EmptyAttribute)?;

        Ok(Requirement {
            kind: self.kind,
            attribute,
            condition: self.condition.as_ref().map(ConditionSpec::build).transpose()?,
            prompt: self.prompt.clone(),
            decision_kind: self.decision_kind.clone(),
        })
    }
}

/// Outcome of [`Project::prepare`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub topology: TopologyReport,
    /// Decisions registered by the enrichment pass.
    pub raised: Vec<DecisionKey>,
}

/// An imported model and the decisions still open on it.
pub struct Project {
    id: ProjectId,
    name: String,
    components: Arc<dyn ComponentStore>,
    broker: Arc<DecisionBroker>,
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

impl Project {
    /// Creates an empty in-memory project.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, BrokerConfig::default())
    }

    #[must_use]
    pub fn with_config(name: impl Into<String>, config: BrokerConfig) -> Self {
        Self::with_stores(
            name,
            Arc::new(InMemoryComponentStore::new()),
            Arc::new(InMemoryDecisionStore::new()),
            config,
        )
    }

    /// Creates a project over caller-provided stores.
    #[must_use]
    pub fn with_stores(
        name: impl Into<String>,
        components: Arc<dyn ComponentStore>,
        decisions: Arc<dyn DecisionStore>,
        config: BrokerConfig,
    ) -> Self {
        let broker = DecisionBroker::new(decisions, Arc::clone(&components), config);
        Self {
            id: ProjectId::new(),
            name: name.into(),
            components,
            broker: Arc::new(broker),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ProjectId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<DecisionBroker> {
        &self.broker
    }

    pub fn add_component(&self, component: Component) -> SimlinkResult<()> {
        self.components.insert(component)?;
        Ok(())
    }

    pub fn component(&self, id: &ComponentId) -> SimlinkResult<Option<Component>> {
        Ok(self.components.get(id)?)
    }

    /// All components, ordered by id.
    pub fn components(&self) -> SimlinkResult<Vec<Component>> {
        Ok(self.components.list()?)
    }

    /// Runs one port matching pass and stores the new connections.
    pub fn connect_ports(&self, config: TopologyConfig) -> SimlinkResult<TopologyReport> {
        let builder = TopologyBuilder::new(config)?;
        let mut components = self.components.list()?;
        let report = builder.connect(&mut components);
        if report.new_connections > 0 {
            for component in components {
                self.components.set_ports(&component.id, component.ports)?;
            }
        }
        Ok(report)
    }

    /// Current connectivity.
    pub fn graph(&self) -> SimlinkResult<TopologyGraph> {
        let components = self.components.list()?;
        Ok(TopologyGraph::from_components(&components))
    }

    /// Writes an attribute outside the decision flow.
    ///
    /// Attributes with an open decision belong to the resolver until it
    /// answers, so writing them fails with `AttributeLocked`.
    pub fn set_attribute(
        &self,
        id: &ComponentId,
        attribute: &str,
        value: impl Into<Value>,
    ) -> SimlinkResult<()> {
        self.broker.write_unless_open(id, attribute, value.into())?;
        Ok(())
    }

    /// Raises a decision for every component that misses a requirement.
    ///
    /// A component/attribute pair is asked at most once per project: pairs
    /// that already have a decision (open, resolved or retired) are skipped.
    pub fn enrich(&self, requirements: &[Requirement]) -> SimlinkResult<Vec<DecisionKey>> {
        let mut raised = Vec::new();
        for component in self.components.list()? {
            for requirement in requirements {
                if !requirement.applies_to(&component) || requirement.satisfied_by(&component) {
                    continue;
                }
                match self.broker.register(requirement.decision_for(&component)) {
                    Ok(key) => raised.push(key),
                    Err(SimlinkError::Execution(ExecutionError::DuplicateRegistration { key })) => {
                        tracing::debug!(%key, "requirement already has a decision");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        tracing::info!(project = %self.name, raised = raised.len(), "enrichment pass finished");
        Ok(raised)
    }

    /// Matches ports, then enriches.
    pub fn prepare(
        &self,
        config: TopologyConfig,
        requirements: &[Requirement],
    ) -> SimlinkResult<PrepareReport> {
        let topology = self.connect_ports(config)?;
        let raised = self.enrich(requirements)?;
        Ok(PrepareReport { topology, raised })
    }

    pub fn pending_count(&self) -> SimlinkResult<usize> {
        self.broker.pending_count()
    }
}

/// Serialized model handed over by the importer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub name: String,
    /// Overrides the caller's matching distance for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub requirements: Vec<RequirementSpec>,
}

impl ModelSnapshot {
    pub fn from_json(json: &str) -> SimlinkResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ValidationError::InvalidValue {
                reason: format!("malformed model snapshot: {e}"),
            }
            .into()
        })
    }

    pub fn to_json(&self) -> SimlinkResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SimlinkError::internal(format!("failed to encode model snapshot: {e}")))
    }

    /// Reads a snapshot from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> SimlinkResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ExecutionError::Storage {
            message: format!("cannot read model '{}': {e}", path.display()),
        })?;
        Self::from_json(&json)
    }

    /// Matching configuration for this model.
    #[must_use]
    pub fn topology(&self, fallback: TopologyConfig) -> TopologyConfig {
        self.epsilon
            .map_or(fallback, |epsilon| TopologyConfig { epsilon })
    }

    pub fn requirements(&self) -> Result<Vec<Requirement>, ValidationError> {
        self.requirements.iter().map(RequirementSpec::build).collect()
    }

    /// Creates a project holding the snapshot's components.
    pub fn into_project(self, config: BrokerConfig) -> SimlinkResult<Project> {
        let project = Project::with_config(self.name, config);
        for component in self.components {
            project.add_component(component)?;
        }
        Ok(project)
    }
}

/// Projects a server exposes, by id.
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    projects: RwLock<HashMap<ProjectId, Arc<Project>>>,
}

impl ProjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: Project) -> SimlinkResult<Arc<Project>> {
        let project = Arc::new(project);
        self.projects
            .write()
            .map_err(|_| SimlinkError::internal("project registry lock poisoned"))?
            .insert(project.id(), Arc::clone(&project));
        tracing::info!(id = %project.id(), name = project.name(), "project registered");
        Ok(project)
    }

    pub fn get(&self, id: &ProjectId) -> SimlinkResult<Arc<Project>> {
        self.projects
            .read()
            .map_err(|_| SimlinkError::internal("project registry lock poisoned"))?
            .get(id)
            .cloned()
            .ok_or_else(|| {
                ExecutionError::ProjectNotFound { id: id.to_string() }.into()
            })
    }

    /// Looks a project up by its textual id.
    pub fn lookup(&self, id: &str) -> SimlinkResult<Arc<Project>> {
        let parsed = ProjectId::parse(id).map_err(|_| ExecutionError::ProjectNotFound {
            id: id.to_string(),
        })?;
        self.get(&parsed)
    }

    /// `(id, name)` of every project, ordered by name.
    pub fn list(&self) -> SimlinkResult<Vec<(ProjectId, String)>> {
        let projects = self
            .projects
            .read()
            .map_err(|_| SimlinkError::internal("project registry lock poisoned"))?;
        let mut listed: Vec<_> = projects
            .values()
            .map(|p| (p.id(), p.name().to_string()))
            .collect();
        listed.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::component::Port;
    use crate::condition::RangeCondition;

    fn id(s: &str) -> ComponentId {
        ComponentId::new(s).unwrap()
    }

    fn power_requirement() -> Requirement {
        Requirement::new("rated_power")
            .for_kind(ComponentKind::Boiler)
            .with_condition(Arc::new(RangeCondition::new("rated_power", 10.0, 100.0).unwrap()))
            .with_decision_kind(DecisionKind::Real { unit: Some("kW".into()) })
            .with_prompt("Rated power of {kind} {component}?")
    }

    fn project_with_boilers() -> Project {
        let project = Project::new("plant");
        project
            .add_component(Component::new(id("b1"), ComponentKind::Boiler))
            .unwrap();
        project
            .add_component(
                Component::new(id("b2"), ComponentKind::Boiler)
                    .with_attribute("rated_power", 50.0)
                    .unwrap(),
            )
            .unwrap();
        project
            .add_component(
                Component::new(id("b3"), ComponentKind::Boiler)
                    .with_attribute("rated_power", 500.0)
                    .unwrap(),
            )
            .unwrap();
        project
            .add_component(Component::new(id("p1"), ComponentKind::Pipe))
            .unwrap();
        project
    }

    #[test]
    fn enrich_raises_for_missing_and_invalid_values_only() {
        let project = project_with_boilers();
        let raised = project.enrich(&[power_requirement()]).unwrap();
        let keys: Vec<&str> = raised.iter().map(DecisionKey::as_str).collect();
        assert_eq!(keys, vec!["b1.rated_power", "b3.rated_power"]);

        let decision = project.broker().get(&raised[1]).unwrap().unwrap();
        assert_eq!(decision.prompt, "Rated power of boiler b3?");
        assert_eq!(decision.context["current"]["value"], 500.0);

        // A second pass does not ask again.
        assert!(project.enrich(&[power_requirement()]).unwrap().is_empty());
        assert_eq!(project.pending_count().unwrap(), 2);
    }

    #[test]
    fn requirement_without_condition_needs_presence() {
        let project = project_with_boilers();
        let raised = project.enrich(&[Requirement::new("length")]).unwrap();
        assert_eq!(raised, vec![DecisionKey::new("p1.length")]);
    }

    #[test]
    fn open_decision_locks_attribute() {
        let project = project_with_boilers();
        project.enrich(&[power_requirement()]).unwrap();

        let err = project.set_attribute(&id("b1"), "rated_power", 40.0).unwrap_err();
        assert!(matches!(
            err,
            SimlinkError::Execution(ExecutionError::AttributeLocked { .. })
        ));
        project.set_attribute(&id("b1"), "efficiency", 0.9).unwrap();

        let key = DecisionKey::new("b1.rated_power");
        assert!(project.broker().answer(&key, Value::Float(40.0)).unwrap());
        project.set_attribute(&id("b1"), "rated_power", 45.0).unwrap();
    }

    #[test]
    fn connect_ports_persists_connections() {
        let project = Project::new("loop");
        project
            .add_component(Component::new(id("a"), ComponentKind::Boiler).with_port(Port::at(0.0, 0.0, 0.0)))
            .unwrap();
        project
            .add_component(Component::new(id("b"), ComponentKind::Pipe).with_port(Port::at(0.5, 0.0, 0.0)))
            .unwrap();

        let report = project.connect_ports(TopologyConfig::default()).unwrap();
        assert_eq!(report.new_connections, 1);
        let stored = project.component(&id("a")).unwrap().unwrap();
        assert!(stored.ports[0].is_connected());
        assert_eq!(project.graph().unwrap().edge_count(), 1);

        let again = project.connect_ports(TopologyConfig::default()).unwrap();
        assert_eq!(again.new_connections, 0);

        assert!(project
            .connect_ports(TopologyConfig { epsilon: 0.0 })
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn snapshot_round_trip_through_file() {
        let json = r#"{
            "name": "demo",
            "epsilon": 0.5,
            "components": [
                {"id": "b1", "kind": "boiler", "ports": [{"position": [0.0, 0.0, 0.0]}]},
                {"id": "p1", "kind": "pipe", "ports": [{"position": [0.2, 0.0, 0.0]}]}
            ],
            "requirements": [
                {"kind": "boiler", "condition": {"type": "range", "attribute": "rated_power", "min": 10.0, "max": 100.0},
                 "decision_kind": {"type": "real", "unit": "kW"}}
            ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(&path, json).unwrap();

        let snapshot = ModelSnapshot::load(&path).unwrap();
        assert_eq!(snapshot.topology(TopologyConfig::default()).epsilon, 0.5);
        let requirements = snapshot.requirements().unwrap();
        assert_eq!(requirements[0].attribute, "rated_power");

        let topology = snapshot.topology(TopologyConfig::default());
        let project = snapshot.into_project(BrokerConfig::default()).unwrap();
        let report = project.prepare(topology, &requirements).unwrap();
        assert_eq!(report.topology.new_connections, 1);
        assert_eq!(report.raised, vec![DecisionKey::new("b1.rated_power")]);

        assert!(ModelSnapshot::load(dir.path().join("missing.json")).is_err());
        assert!(ModelSnapshot::from_json("{").unwrap_err().is_validation());
    }

    #[test]
    fn requirement_spec_needs_an_attribute() {
        let spec = RequirementSpec {
            kind: None,
            attribute: None,
            condition: None,
            prompt: None,
            decision_kind: DecisionKind::Any,
        };
        assert!(matches!(spec.build(), Err(ValidationError::EmptyAttribute)));
    }

    #[test]
    fn registry_lookup() {
        let registry = ProjectRegistry::new();
        let project = registry.insert(Project::new("alpha")).unwrap();
        let found = registry.lookup(&project.id().to_string()).unwrap();
        assert_eq!(found.name(), "alpha");

        let fresh = ProjectId::new().to_string();
        for unknown in ["not-a-uuid", fresh.as_str()] {
            let err = registry.lookup(unknown).unwrap_err();
            assert!(matches!(
                err,
                SimlinkError::Execution(ExecutionError::ProjectNotFound { .. })
            ));
        }
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
