//! Components, ports and their attribute slots.
//!
//! A component is one imported physical element (a boiler, a pipe, ...). Its
//! attributes are an explicit name to value mapping restricted to the names its
//! kind declares, and its ports carry the positions the topology builder
//! matches on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::value::Value;

/// Stable identifier of a component, typically the IFC `GlobalId`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    /// Creates an id, rejecting empty or blank strings.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyComponentId);
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of HVAC element, with the attribute names it recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Boiler,
    Pipe,
    PipeFitting,
    Pump,
    Valve,
    SpaceHeater,
    Storage,
    Junction,
    Chiller,
    /// Element without a dedicated kind; only carries a description.
    Generic,
}

impl ComponentKind {
    /// Attribute names a component of this kind may carry.
    #[must_use]
    pub const fn attributes(self) -> &'static [&'static str] {
        match self {
            Self::Boiler => &[
                "rated_power",
                "efficiency",
                "flow_temperature",
                "return_temperature",
                "min_part_load",
            ],
            Self::Pipe => &["diameter", "length", "roughness"],
            Self::PipeFitting => &["diameter", "length", "pressure_class"],
            Self::Pump => &["rated_power", "rated_height", "rated_volume_flow", "diameter"],
            Self::Valve => &["diameter", "nominal_pressure_difference", "kv_value"],
            Self::SpaceHeater => &[
                "rated_power",
                "flow_temperature",
                "return_temperature",
                "heater_type",
            ],
            Self::Storage => &["volume", "height", "diameter"],
            Self::Junction => &["volume"],
            Self::Chiller => &["rated_power", "nominal_cop", "flow_temperature"],
            Self::Generic => &["description"],
        }
    }

    /// Returns true if components of this kind carry `attribute`.
    #[must_use]
    pub fn recognizes(self, attribute: &str) -> bool {
        self.attributes().contains(&attribute)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boiler => "boiler",
            Self::Pipe => "pipe",
            Self::PipeFitting => "pipe_fitting",
            Self::Pump => "pump",
            Self::Valve => "valve",
            Self::SpaceHeater => "space_heater",
            Self::Storage => "storage",
            Self::Junction => "junction",
            Self::Chiller => "chiller",
            Self::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// A point in model coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub [f64; 3]);

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self([x, y, z])
    }

    /// True when every coordinate is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|c| c.is_finite())
    }

    /// Largest per-axis absolute difference (Chebyshev distance).
    #[must_use]
    pub fn max_axis_delta(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Reference to the `port`-th port of `component`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub component: ComponentId,
    pub port: usize,
}

impl PortRef {
    #[must_use]
    pub const fn new(component: ComponentId, port: usize) -> Self {
        Self { component, port }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.component, self.port)
    }
}

/// A connection point of a component.
///
/// `position` is `None` when the importer could not place the port; such
/// ports never take part in proximity matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub position: Option<Position>,
    #[serde(default)]
    pub connections: BTreeSet<PortRef>,
}

impl Port {
    /// Creates an unconnected port at `position`.
    #[must_use]
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            name: None,
            position: Some(Position::new(x, y, z)),
            connections: BTreeSet::new(),
        }
    }

    /// Creates a port without a position.
    #[must_use]
    pub fn unplaced() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }
}

/// A physical element with typed attributes and ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub kind: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub ports: Vec<Port>,
}

impl Component {
    /// Creates a component without attributes or ports.
    #[must_use]
    pub fn new(id: ComponentId, kind: ComponentKind) -> Self {
        Self {
            id,
            kind,
            name: None,
            attributes: BTreeMap::new(),
            ports: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: Port) -> Self {
        self.ports.push(port);
        self
    }

    /// Sets an attribute while building, validating the name.
    pub fn with_attribute(
        mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<Self, ValidationError> {
        self.set_attribute(name, value)?;
        Ok(self)
    }

    /// Reads an attribute. `None` when the slot was never filled.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Iterates over filled attributes in name order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Writes an attribute the component's kind recognizes.
    pub fn set_attribute(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, ValidationError> {
        self.check_attribute(name)?;
        Ok(self.attributes.insert(name.to_string(), value.into()))
    }

    /// Empties an attribute slot, returning what it held.
    pub fn clear_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Fails unless `name` is one of the kind's declared attributes.
    pub fn check_attribute(&self, name: &str) -> Result<(), ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyAttribute);
        }
        if !self.kind.recognizes(name) {
            return Err(ValidationError::UnknownAttribute {
                kind: self.kind.to_string(),
                attribute: name.to_string(),
            });
        }
        Ok(())
    }

    /// Checks a component that was built without the setters (e.g. deserialized).
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyComponentId);
        }
        for name in self.attributes.keys() {
            self.check_attribute(name)?;
        }
        Ok(())
    }

    /// Reference to this component's `index`-th port.
    pub fn port_ref(&self, index: usize) -> Result<PortRef, ValidationError> {
        if index >= self.ports.len() {
            return Err(ValidationError::UnknownPort {
                component: self.id.clone(),
                index,
            });
        }
        Ok(PortRef::new(self.id.clone(), index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ComponentId {
        ComponentId::new(s).unwrap()
    }

    #[test]
    fn test_component_id_rejects_blank() {
        assert!(matches!(
            ComponentId::new("   "),
            Err(ValidationError::EmptyComponentId)
        ));
        assert_eq!(id("3vB2YO$MX4xv5uCqZZG05x").as_str(), "3vB2YO$MX4xv5uCqZZG05x");
    }

    #[test]
    fn test_kind_declares_attributes() {
        assert!(ComponentKind::Boiler.recognizes("rated_power"));
        assert!(!ComponentKind::Pipe.recognizes("rated_power"));
        assert!(ComponentKind::Pipe.recognizes("diameter"));
    }

    #[test]
    fn test_set_attribute_checks_kind() {
        let mut boiler = Component::new(id("b1"), ComponentKind::Boiler);
        assert!(boiler.set_attribute("rated_power", 50.0).unwrap().is_none());
        assert_eq!(boiler.attribute("rated_power"), Some(&Value::Float(50.0)));

        let err = boiler.set_attribute("diameter", 0.1).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownAttribute { .. }));
        assert!(boiler.attribute("diameter").is_none());

        let previous = boiler.set_attribute("rated_power", 60.0).unwrap();
        assert_eq!(previous, Some(Value::Float(50.0)));
    }

    #[test]
    fn test_position_max_axis_delta() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(0.5, -0.7, 0.2);
        assert!((a.max_axis_delta(&b) - 0.7).abs() < 1e-12);
        assert!(!Position::new(f64::NAN, 0.0, 0.0).is_finite());
    }

    #[test]
    fn test_port_ref_bounds() {
        let pipe = Component::new(id("p1"), ComponentKind::Pipe).with_port(Port::at(0.0, 0.0, 0.0));
        assert_eq!(pipe.port_ref(0).unwrap().to_string(), "p1#0");
        assert!(matches!(
            pipe.port_ref(1),
            Err(ValidationError::UnknownPort { index: 1, .. })
        ));
    }

    #[test]
    fn test_component_deserializes_from_snapshot_shape() {
        let json = serde_json::json!({
            "id": "pump-7",
            "kind": "pump",
            "attributes": {"rated_power": {"type": "float", "value": 1.5}},
            "ports": [{"position": [0.0, 1.0, 2.0]}, {"position": null}]
        });
        let pump: Component = serde_json::from_value(json).unwrap();
        assert_eq!(pump.kind, ComponentKind::Pump);
        assert_eq!(pump.ports.len(), 2);
        assert_eq!(pump.ports[0].position, Some(Position::new(0.0, 1.0, 2.0)));
        assert!(pump.ports[1].position.is_none());
        assert_eq!(pump.attribute("rated_power"), Some(&Value::Float(1.5)));
        assert!(pump.validate().is_ok());

        let bad: Component = serde_json::from_value(serde_json::json!({
            "id": "pipe-1",
            "kind": "pipe",
            "attributes": {"rated_power": {"type": "int", "value": 3}}
        }))
        .unwrap();
        assert!(matches!(
            bad.validate(),
            Err(ValidationError::UnknownAttribute { .. })
        ));
    }
}
