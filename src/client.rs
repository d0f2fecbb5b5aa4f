//! Decision client loop.
//!
//! A resolver pulls bunches from a [`DecisionChannel`], proposes values from an
//! [`AnswerStrategy`] and retries each decision until the broker accepts an
//! answer or the [`RetryPolicy`] gives up. The same loop drives a local broker
//! and a remote server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broker::DecisionBroker;
use crate::decision::{DecisionBunch, DecisionDescriptor, DecisionKey};
use crate::error::{ExecutionError, SimlinkResult};
use crate::value::Value;

/// Where a resolver gets bunches from and sends answers to.
pub trait DecisionChannel {
    /// Next bunch of pending decisions; `None` once nothing is left.
    fn next_bunch(&mut self) -> SimlinkResult<Option<DecisionBunch>>;

    /// Proposes `value` for `key`. `Ok(false)` means rejected.
    fn answer(&mut self, key: &DecisionKey, value: &Value) -> SimlinkResult<bool>;
}

/// In-process channel calling a broker directly.
#[derive(Debug, Clone)]
pub struct LocalSession {
    broker: Arc<DecisionBroker>,
}

impl LocalSession {
    #[must_use]
    pub fn new(broker: Arc<DecisionBroker>) -> Self {
        Self { broker }
    }
}

impl DecisionChannel for LocalSession {
    fn next_bunch(&mut self) -> SimlinkResult<Option<DecisionBunch>> {
        self.broker.next_bunch()
    }

    fn answer(&mut self, key: &DecisionKey, value: &Value) -> SimlinkResult<bool> {
        self.broker.answer(key, value.clone())
    }
}

/// Source of candidate answers.
pub trait AnswerStrategy {
    /// Candidate for the `attempt`-th try (0-based) at `decision`.
    ///
    /// `None` means the strategy has nothing to offer.
    fn propose(&mut self, decision: &DecisionDescriptor, attempt: u32) -> Option<Value>;
}

impl<F> AnswerStrategy for F
where
    F: FnMut(&DecisionDescriptor, u32) -> Option<Value>,
{
    fn propose(&mut self, decision: &DecisionDescriptor, attempt: u32) -> Option<Value> {
        self(decision, attempt)
    }
}

/// Proposes a fixed list of values in order, wrapping around.
#[derive(Debug, Clone, PartialEq)]
pub struct CyclingStrategy {
    candidates: Vec<Value>,
}

impl CyclingStrategy {
    #[must_use]
    pub fn new(candidates: Vec<Value>) -> Self {
        Self { candidates }
    }
}

impl AnswerStrategy for CyclingStrategy {
    fn propose(&mut self, _decision: &DecisionDescriptor, attempt: u32) -> Option<Value> {
        if self.candidates.is_empty() {
            return None;
        }
        let index = attempt as usize % self.candidates.len();
        self.candidates.get(index).cloned()
    }
}

/// Delay between rejected attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `initial * factor^(attempt-1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
}

impl Backoff {
    /// Delay after the `attempt`-th rejection (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max, factor } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let scaled = (initial.as_nanos() as f64 * factor.max(1.0).powi(exponent)).round();
                if scaled.is_finite() && scaled < max.as_nanos() as f64 {
                    Duration::from_nanos(scaled as u64)
                } else {
                    max
                }
            }
        }
    }
}

/// How long the client keeps trying one decision.
///
/// The default never gives up but backs off exponentially from 10ms to 1s,
/// so a decision another resolver already closed is re-proposed slowly
/// instead of in a tight loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per decision; `None` is unbounded.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget per decision.
    pub deadline: Option<Duration>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            deadline: None,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(10),
                max: Duration::from_secs(1),
                factor: 2.0,
            },
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// What a client run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientReport {
    pub bunches: usize,
    /// Total answers sent, accepted or not.
    pub attempts: u64,
    /// Accepted answers in resolution order.
    pub resolved: Vec<(DecisionKey, Value)>,
}

/// Drives a channel until nothing is pending.
#[derive(Debug)]
pub struct DecisionClient<S> {
    strategy: S,
    policy: RetryPolicy,
}

impl<S: AnswerStrategy> DecisionClient<S> {
    #[must_use]
    pub fn new(strategy: S, policy: RetryPolicy) -> Self {
        Self { strategy, policy }
    }

    /// Resolves bunches until the channel has none left.
    ///
    /// Stops at the first decision the policy gives up on; that decision and
    /// the rest of its bunch stay pending on the broker.
    pub fn run<C>(&mut self, channel: &mut C) -> SimlinkResult<ClientReport>
    where
        C: DecisionChannel + ?Sized,
    {
        let mut report = ClientReport::default();
        while let Some(bunch) = channel.next_bunch()? {
            report.bunches += 1;
            tracing::debug!(sequence = bunch.sequence, size = bunch.len(), "resolving bunch");
            for decision in &bunch.decisions {
                self.resolve_one(channel, decision, &mut report)?;
            }
        }
        tracing::info!(
            bunches = report.bunches,
            resolved = report.resolved.len(),
            attempts = report.attempts,
            "decision client finished"
        );
        Ok(report)
    }

    fn resolve_one<C>(
        &mut self,
        channel: &mut C,
        decision: &DecisionDescriptor,
        report: &mut ClientReport,
    ) -> SimlinkResult<()>
    where
        C: DecisionChannel + ?Sized,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::warn!(key = %decision.key, attempts = attempt, "giving up on decision");
                return Err(ExecutionError::RetriesExhausted {
                    key: decision.key.clone(),
                    attempts: attempt,
                }
                .into());
            }
            if let Some(deadline) = self.policy.deadline {
                if started.elapsed() >= deadline {
                    tracing::warn!(key = %decision.key, attempts = attempt, "decision deadline passed");
                    return Err(ExecutionError::Timeout {
                        duration_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    }
                    .into());
                }
            }

            let Some(value) = self.strategy.propose(decision, attempt) else {
                return Err(ExecutionError::NoCandidate {
                    key: decision.key.clone(),
                }
                .into());
            };
            attempt += 1;
            report.attempts += 1;

            if channel.answer(&decision.key, &value)? {
                report.resolved.push((decision.key.clone(), value));
                return Ok(());
            }
            tracing::debug!(key = %decision.key, %value, attempt, "answer rejected");

            let delay = self.policy.backoff.delay(attempt);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::broker::BrokerConfig;
    use crate::decision::{Decision, DecisionKind};
    use crate::error::SimlinkError;

    fn broker_with(keys: &[&str]) -> Arc<DecisionBroker> {
        let broker = DecisionBroker::in_memory(BrokerConfig::default());
        for key in keys {
            broker
                .register(Decision::new(DecisionKey::new(*key), *key).with_kind(DecisionKind::Text))
                .unwrap();
        }
        Arc::new(broker)
    }

    /// Records every answer and its outcome.
    struct Recording<C> {
        inner: C,
        log: Vec<(Value, bool)>,
    }

    impl<C: DecisionChannel> DecisionChannel for Recording<C> {
        fn next_bunch(&mut self) -> SimlinkResult<Option<DecisionBunch>> {
            self.inner.next_bunch()
        }

        fn answer(&mut self, key: &DecisionKey, value: &Value) -> SimlinkResult<bool> {
            let accepted = self.inner.answer(key, value)?;
            self.log.push((value.clone(), accepted));
            Ok(accepted)
        }
    }

    #[test]
    fn cycling_client_retries_until_accepted() {
        let broker = broker_with(&["confirm"]);
        let mut channel = Recording {
            inner: LocalSession::new(Arc::clone(&broker)),
            log: Vec::new(),
        };
        let strategy = CyclingStrategy::new(vec![Value::Int(1), Value::Bool(false), Value::from("y")]);
        let mut client = DecisionClient::new(strategy, RetryPolicy::default());

        let report = client.run(&mut channel).unwrap();
        assert_eq!(report.bunches, 1);
        assert_eq!(report.attempts, 3);
        let outcomes: Vec<bool> = channel.log.iter().map(|(_, ok)| *ok).collect();
        assert_eq!(outcomes, vec![false, false, true]);

        // The decision is closed for good.
        assert!(!channel.answer(&DecisionKey::new("confirm"), &Value::from("z")).unwrap());
    }

    #[test]
    fn max_attempts_stops_the_loop() {
        let broker = broker_with(&["confirm"]);
        let mut session = LocalSession::new(Arc::clone(&broker));
        let mut client = DecisionClient::new(
            CyclingStrategy::new(vec![Value::Int(1)]),
            RetryPolicy::default().with_max_attempts(3),
        );

        let err = client.run(&mut session).unwrap_err();
        assert!(matches!(
            err,
            SimlinkError::Execution(ExecutionError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(broker.pending_count().unwrap(), 1);
    }

    #[test]
    fn deadline_stops_the_loop() {
        let broker = broker_with(&["confirm"]);
        let mut session = LocalSession::new(broker);
        let mut client = DecisionClient::new(
            CyclingStrategy::new(vec![Value::Int(1)]),
            RetryPolicy::default()
                .with_deadline(Duration::from_millis(20))
                .with_backoff(Backoff::Fixed(Duration::from_millis(5))),
        );
        let err = client.run(&mut session).unwrap_err();
        assert!(matches!(err, SimlinkError::Execution(ExecutionError::Timeout { .. })));
    }

    #[test]
    fn empty_strategy_reports_no_candidate() {
        let mut session = LocalSession::new(broker_with(&["confirm"]));
        let mut client = DecisionClient::new(CyclingStrategy::new(Vec::new()), RetryPolicy::default());
        let err = client.run(&mut session).unwrap_err();
        assert!(matches!(err, SimlinkError::Execution(ExecutionError::NoCandidate { .. })));
    }

    #[test]
    fn closure_strategy_resolves_every_bunch() {
        let broker = broker_with(&["a", "b", "c"]);
        let mut session = LocalSession::new(Arc::clone(&broker));
        let strategy = |d: &DecisionDescriptor, _attempt: u32| Some(Value::from(d.key.as_str()));
        let mut client = DecisionClient::new(strategy, RetryPolicy::default());

        let report = client.run(&mut session).unwrap();
        assert_eq!(report.resolved.len(), 3);
        assert_eq!(broker.pending_count().unwrap(), 0);
        assert!(session.next_bunch().unwrap().is_none());
    }

    #[test]
    fn default_policy_paces_a_decision_closed_elsewhere() {
        let broker = broker_with(&["confirm"]);
        let mut session = LocalSession::new(Arc::clone(&broker));
        let bunch = session.next_bunch().unwrap().unwrap();
        // Another resolver wins before this one answers.
        assert!(broker.answer(&DecisionKey::new("confirm"), Value::from("theirs")).unwrap());

        let mut client = DecisionClient::new(
            CyclingStrategy::new(vec![Value::from("mine")]),
            RetryPolicy::default().with_deadline(Duration::from_millis(100)),
        );
        let mut report = ClientReport::default();
        let err = client
            .resolve_one(&mut session, &bunch.decisions[0], &mut report)
            .unwrap_err();
        assert!(matches!(err, SimlinkError::Execution(ExecutionError::Timeout { .. })));
        assert!(report.attempts < 20, "{} answers in 100ms", report.attempts);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 2.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(200), Duration::from_millis(50));
        assert_eq!(Backoff::None.delay(3), Duration::ZERO);
    }
}
