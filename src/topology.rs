//! Geometric port matching and the resulting connectivity graph.
//!
//! Two ports connect when the largest per-axis difference of their positions
//! is strictly below `epsilon`. Every qualifying pair is connected; a port
//! may end up with several peers. Matching is quadratic in the number of
//! components and ports, which is fine for building models.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentId, PortRef, Position};
use crate::error::{SimlinkResult, ValidationError};

/// Topology builder configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopologyConfig {
    /// Exclusive per-axis distance under which two ports connect.
    pub epsilon: f64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self { epsilon: 1.0 }
    }
}

/// Outcome of one matching pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyReport {
    /// Connections established by this pass (existing ones are not counted).
    pub new_connections: usize,
    /// Ports skipped because their position is missing or not finite.
    pub degenerate_ports: BTreeSet<PortRef>,
}

/// Connects ports of distinct components by proximity.
#[derive(Debug, Clone, Copy)]
pub struct TopologyBuilder {
    epsilon: f64,
}

impl TopologyBuilder {
    /// Creates a builder; `epsilon` must be finite and positive.
    pub fn new(config: TopologyConfig) -> Result<Self, ValidationError> {
        let epsilon = config.epsilon;
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(ValidationError::InvalidEpsilon { value: epsilon });
        }
        Ok(Self { epsilon })
    }

    #[must_use]
    pub const fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Runs one matching pass over `components`, mutating their ports.
    pub fn connect(&self, components: &mut [Component]) -> TopologyReport {
        let mut report = TopologyReport::default();

        for component in components.iter() {
            for (p, port) in component.ports.iter().enumerate() {
                if !port.position.map_or(false, |pos| pos.is_finite()) {
                    tracing::warn!(
                        component = %component.id,
                        port = p,
                        "skipping port with missing or non-finite position"
                    );
                    report
                        .degenerate_ports
                        .insert(PortRef::new(component.id.clone(), p));
                }
            }
        }

        for i in 0..components.len() {
            let (head, tail) = components.split_at_mut(i + 1);
            let a = &mut head[i];
            if a.ports.is_empty() {
                continue;
            }
            for b in tail.iter_mut() {
                if b.ports.is_empty() {
                    continue;
                }
                report.new_connections += self.connect_pair(a, b);
            }
        }

        tracing::info!(
            components = components.len(),
            new_connections = report.new_connections,
            degenerate_ports = report.degenerate_ports.len(),
            epsilon = self.epsilon,
            "port matching pass finished"
        );
        report
    }

    fn connect_pair(&self, a: &mut Component, b: &mut Component) -> usize {
        let mut made = 0;
        for pa in 0..a.ports.len() {
            let Some(pos_a) = placed(a.ports[pa].position) else {
                continue;
            };
            for pb in 0..b.ports.len() {
                let Some(pos_b) = placed(b.ports[pb].position) else {
                    continue;
                };
                if pos_a.max_axis_delta(&pos_b) >= self.epsilon {
                    continue;
                }
                let ref_a = PortRef::new(a.id.clone(), pa);
                let ref_b = PortRef::new(b.id.clone(), pb);
                let added_ab = a.ports[pa].connections.insert(ref_b);
                let added_ba = b.ports[pb].connections.insert(ref_a);
                if added_ab || added_ba {
                    tracing::debug!(from = %a.id, from_port = pa, to = %b.id, to_port = pb, "ports connected");
                    made += 1;
                }
            }
        }
        made
    }
}

fn placed(position: Option<Position>) -> Option<Position> {
    position.filter(Position::is_finite)
}

/// Connects ports of `components` closer than `epsilon` on every axis.
///
/// Returns the number of newly established connections.
pub fn connect(components: &mut [Component], epsilon: f64) -> SimlinkResult<usize> {
    let builder = TopologyBuilder::new(TopologyConfig { epsilon })?;
    Ok(builder.connect(components).new_connections)
}

/// Component-level view of established port connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyGraph {
    nodes: BTreeSet<ComponentId>,
    edges: BTreeSet<(PortRef, PortRef)>,
    unconnected: BTreeSet<PortRef>,
}

impl TopologyGraph {
    /// Builds the graph from the ports' connection sets.
    ///
    /// Each edge is stored once with the smaller port reference first.
    #[must_use]
    pub fn from_components<'a>(components: impl IntoIterator<Item = &'a Component>) -> Self {
        let mut graph = Self::default();
        for component in components {
            graph.nodes.insert(component.id.clone());
            for (index, port) in component.ports.iter().enumerate() {
                let here = PortRef::new(component.id.clone(), index);
                if port.connections.is_empty() {
                    graph.unconnected.insert(here.clone());
                }
                for peer in &port.connections {
                    let edge = if here <= *peer {
                        (here.clone(), peer.clone())
                    } else {
                        (peer.clone(), here.clone())
                    };
                    graph.edges.insert(edge);
                }
            }
        }
        graph
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Port-level edges, each listed once.
    pub fn edges(&self) -> impl Iterator<Item = &(PortRef, PortRef)> {
        self.edges.iter()
    }

    /// Ports without any connection.
    pub fn unconnected_ports(&self) -> impl Iterator<Item = &PortRef> {
        self.unconnected.iter()
    }

    /// Components sharing at least one port connection with `id`.
    #[must_use]
    pub fn neighbors(&self, id: &ComponentId) -> BTreeSet<ComponentId> {
        self.edges
            .iter()
            .filter_map(|(a, b)| {
                if &a.component == id {
                    Some(b.component.clone())
                } else if &b.component == id {
                    Some(a.component.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Groups of components linked through port connections.
    ///
    /// Islands are ordered by their smallest component id.
    #[must_use]
    pub fn islands(&self) -> Vec<BTreeSet<ComponentId>> {
        let mut adjacency: BTreeMap<&ComponentId, BTreeSet<&ComponentId>> = BTreeMap::new();
        for id in &self.nodes {
            adjacency.entry(id).or_default();
        }
        for (a, b) in &self.edges {
            adjacency.entry(&a.component).or_default().insert(&b.component);
            adjacency.entry(&b.component).or_default().insert(&a.component);
        }

        let mut seen: BTreeSet<&ComponentId> = BTreeSet::new();
        let mut islands = Vec::new();
        for &start in adjacency.keys() {
            if !seen.insert(start) {
                continue;
            }
            let mut island = BTreeSet::new();
            let mut queue = VecDeque::from([start]);
            while let Some(id) = queue.pop_front() {
                island.insert(id.clone());
                if let Some(next) = adjacency.get(id) {
                    for &n in next {
                        if seen.insert(n) {
                            queue.push_back(n);
                        }
                    }
                }
            }
            islands.push(island);
        }
        islands
    }
}
