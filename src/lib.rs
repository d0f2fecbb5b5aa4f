//! # simlink - decision-driven topology construction
//!
//! simlink turns imported building-model components into a validated
//! connectivity graph for simulation tools. Ports are matched by proximity;
//! attribute values that are missing or fail their conditions are raised as
//! decisions and resolved by an external actor, locally or over gRPC.
//!
//! ## Core Concepts
//!
//! - **Component**: a physical element with typed attributes and positioned ports
//! - **Condition**: a pure predicate gating attribute values and answers
//! - **Decision**: an open question keyed by component and attribute, resolved once
//! - **Broker**: hands out bunches of pending decisions and validates answers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use simlink::{Component, ComponentId, ComponentKind, Port, Project, Requirement};
//! use simlink::client::{CyclingStrategy, DecisionClient, LocalSession, RetryPolicy};
//! use simlink::condition::RangeCondition;
//!
//! let project = Project::new("plant");
//! project.add_component(
//!     Component::new(ComponentId::new("boiler-1")?, ComponentKind::Boiler)
//!         .with_port(Port::at(0.0, 0.0, 0.0)),
//! )?;
//!
//! let power = Requirement::new("rated_power")
//!     .with_condition(Arc::new(RangeCondition::new("rated_power", 10.0, 100.0)?));
//! project.prepare(Default::default(), &[power])?;
//!
//! let mut session = LocalSession::new(Arc::clone(project.broker()));
//! let mut client = DecisionClient::new(CyclingStrategy::new(vec![40.0.into()]), RetryPolicy::default());
//! client.run(&mut session)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod component;
pub mod condition;
pub mod decision;
pub mod error;
pub mod value;

// Pipeline
pub mod broker;
pub mod client;
pub mod project;
pub mod storage;
pub mod topology;

/// gRPC transport layer (requires `transport-grpc` feature)
#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use broker::{BrokerConfig, DecisionBroker, DecisionEvent, DecisionWatch};
pub use client::{DecisionChannel, DecisionClient, LocalSession, RetryPolicy};
pub use component::{Component, ComponentId, ComponentKind, Port, PortRef, Position};
pub use condition::{Condition, ConditionSpec, SharedCondition};
pub use decision::{Decision, DecisionBunch, DecisionDescriptor, DecisionKey, DecisionKind, DecisionStatus};
pub use error::{SimlinkError, SimlinkResult, ValidationError};
pub use project::{ModelSnapshot, Project, ProjectId, ProjectRegistry, Requirement};
pub use storage::{ComponentStore, DecisionStore, StorageError};
pub use topology::{TopologyBuilder, TopologyConfig, TopologyGraph, TopologyReport};
pub use value::Value;
