use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use simlink::client::{CyclingStrategy, DecisionChannel, DecisionClient, LocalSession, RetryPolicy};
use simlink::condition::{OneOfCondition, RangeCondition};
use simlink::{
    Component, ComponentId, ComponentKind, Decision, DecisionBroker, DecisionBunch, DecisionKey,
    DecisionKind, Port, Project, Requirement, SimlinkResult, TopologyConfig, Value,
};

fn id(s: &str) -> ComponentId {
    ComponentId::new(s).unwrap()
}

/// Wraps a channel and records every answer with its outcome.
struct Recording<C> {
    inner: C,
    outcomes: Vec<(DecisionKey, Value, bool)>,
}

impl<C: DecisionChannel> DecisionChannel for Recording<C> {
    fn next_bunch(&mut self) -> SimlinkResult<Option<DecisionBunch>> {
        self.inner.next_bunch()
    }

    fn answer(&mut self, key: &DecisionKey, value: &Value) -> SimlinkResult<bool> {
        let accepted = self.inner.answer(key, value)?;
        self.outcomes.push((key.clone(), value.clone(), accepted));
        Ok(accepted)
    }
}

#[test]
fn pipeline_connects_enriches_and_resolves() {
    let project = Project::new("plant");
    project
        .add_component(Component::new(id("b1"), ComponentKind::Boiler).with_port(Port::at(0.0, 0.0, 0.0)))
        .unwrap();
    project
        .add_component(Component::new(id("p1"), ComponentKind::Pipe).with_port(Port::at(0.3, 0.0, 0.0)))
        .unwrap();

    let first = project.connect_ports(TopologyConfig::default()).unwrap();
    assert_eq!(first.new_connections, 1);

    // A distant component adds nothing.
    project
        .add_component(Component::new(id("j1"), ComponentKind::Junction).with_port(Port::at(5.0, 5.0, 5.0)))
        .unwrap();
    let second = project.connect_ports(TopologyConfig::default()).unwrap();
    assert_eq!(second.new_connections, 0);

    let graph = project.graph().unwrap();
    assert_eq!(graph.edge_count(), 1);
    let islands = graph.islands();
    assert_eq!(islands.len(), 2);
    assert!(islands.contains(&BTreeSet::from([id("b1"), id("p1")])));

    let power = Requirement::new("rated_power")
        .for_kind(ComponentKind::Boiler)
        .with_condition(Arc::new(RangeCondition::new("rated_power", 10.0, 100.0).unwrap()))
        .with_decision_kind(DecisionKind::Real { unit: Some("kW".into()) });
    let raised = project.enrich(&[power]).unwrap();
    assert_eq!(raised, vec![DecisionKey::new("b1.rated_power")]);

    let mut channel = Recording {
        inner: LocalSession::new(Arc::clone(project.broker())),
        outcomes: Vec::new(),
    };
    let strategy = CyclingStrategy::new(vec![Value::Int(5), Value::Float(150.0), Value::Int(50)]);
    let report = DecisionClient::new(strategy, RetryPolicy::default().with_max_attempts(10))
        .run(&mut channel)
        .unwrap();

    let accepted: Vec<bool> = channel.outcomes.iter().map(|(_, _, ok)| *ok).collect();
    assert_eq!(accepted, vec![false, false, true]);
    assert_eq!(report.resolved, vec![(DecisionKey::new("b1.rated_power"), Value::Int(50))]);

    let boiler = project.component(&id("b1")).unwrap().unwrap();
    assert_eq!(boiler.attribute("rated_power"), Some(&Value::Int(50)));
    assert_eq!(project.pending_count().unwrap(), 0);
}

#[test]
fn cycling_client_retry_scenario() {
    let project = Project::new("confirm");
    let key = project
        .broker()
        .register(
            Decision::new(DecisionKey::new("confirm"), "Continue with the export?")
                .with_condition(Arc::new(OneOfCondition::new("confirm", vec![Value::from("y")]).unwrap())),
        )
        .unwrap();

    let mut channel = Recording {
        inner: LocalSession::new(Arc::clone(project.broker())),
        outcomes: Vec::new(),
    };
    let strategy = CyclingStrategy::new(vec![Value::Int(1), Value::Bool(false), Value::from("y")]);
    DecisionClient::new(strategy, RetryPolicy::default())
        .run(&mut channel)
        .unwrap();

    let accepted: Vec<bool> = channel.outcomes.iter().map(|(_, _, ok)| *ok).collect();
    assert_eq!(accepted, vec![false, false, true]);
    assert!(!channel.answer(&key, &Value::from("y")).unwrap());

    let decision = project.broker().get(&key).unwrap().unwrap();
    assert_eq!(decision.value, Some(Value::from("y")));
    assert!(decision.resolved_at.is_some());
}

#[test]
fn resolved_keys_never_reappear() {
    let broker = DecisionBroker::in_memory(Default::default());
    for i in 0..6 {
        broker
            .register(Decision::new(DecisionKey::new(format!("q{i}")), "?"))
            .unwrap();
    }

    let mut answered = BTreeSet::new();
    let mut last_sequence = None;
    for bunch in broker.bunches() {
        let bunch = bunch.unwrap();
        if let Some(last) = last_sequence {
            assert!(bunch.sequence > last);
        }
        last_sequence = Some(bunch.sequence);

        for key in bunch.keys() {
            assert!(!answered.contains(key), "{key} offered again after resolution");
        }
        // Only answer half of each bunch so several bunches are needed.
        let take = (bunch.len() + 1) / 2;
        for key in bunch.keys().take(take) {
            assert!(broker.answer(key, Value::Bool(true)).unwrap());
            answered.insert(key.clone());
        }
    }
    assert_eq!(answered.len(), 6);
}

#[test]
fn concurrent_resolvers_resolve_each_key_once() {
    let project = Arc::new(Project::new("busy"));
    for i in 0..16 {
        project
            .add_component(Component::new(id(&format!("pump-{i}")), ComponentKind::Pump))
            .unwrap();
    }
    let requirement = Requirement::new("rated_power")
        .with_condition(Arc::new(RangeCondition::new("rated_power", 0.1, 10.0).unwrap()))
        .with_decision_kind(DecisionKind::Real { unit: None });
    let keys = project.enrich(&[requirement]).unwrap();
    assert_eq!(keys.len(), 16);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let broker = Arc::clone(project.broker());
            let keys = keys.clone();
            thread::spawn(move || {
                let mut won = Vec::new();
                for key in &keys {
                    let value = Value::Float(1.0 + f64::from(worker));
                    if broker.answer(key, value.clone()).unwrap() {
                        won.push((key.clone(), value));
                    }
                }
                won
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        winners.extend(handle.join().unwrap());
    }
    assert_eq!(winners.len(), 16);

    for (key, value) in winners {
        let decision = project.broker().get(&key).unwrap().unwrap();
        assert_eq!(decision.value.as_ref(), Some(&value));
        let pump = key.as_str().trim_end_matches(".rated_power");
        let stored = project.component(&id(pump)).unwrap().unwrap();
        assert_eq!(stored.attribute("rated_power"), Some(&value));
    }
    assert_eq!(project.pending_count().unwrap(), 0);
}
