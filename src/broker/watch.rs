use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::decision::DecisionKey;
use crate::error::{ExecutionError, SimlinkError, SimlinkResult};
use crate::value::Value;

/// Change notification emitted by a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DecisionEvent {
    Registered { key: DecisionKey },
    Resolved { key: DecisionKey, value: Value },
}

impl DecisionEvent {
    #[must_use]
    pub fn key(&self) -> &DecisionKey {
        match self {
            Self::Registered { key } | Self::Resolved { key, .. } => key,
        }
    }
}

/// A subscription to broker events.
///
/// Dropping the watch disconnects it; the broker prunes it on the next event.
/// Events that do not fit the bounded buffer are dropped, never blocking the
/// broker.
#[derive(Debug)]
pub struct DecisionWatch {
    rx: Receiver<DecisionEvent>,
}

impl DecisionWatch {
    pub(crate) fn new(rx: Receiver<DecisionEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> SimlinkResult<DecisionEvent> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> SimlinkResult<DecisionEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SimlinkError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Drains events already buffered without blocking.
    pub fn drain(&self) -> Vec<DecisionEvent> {
        self.rx.try_iter().collect()
    }
}

fn disconnected() -> SimlinkError {
    SimlinkError::Execution(ExecutionError::Disconnected {
        path: "decision_watch".to_string(),
    })
}
