use tonic::transport::Channel;
use tonic::{Code, Status, Streaming};

use super::proto;
use super::DecisionServiceClient;
use crate::client::DecisionChannel;
use crate::decision::{DecisionBunch, DecisionDescriptor, DecisionKey, DecisionKind};
use crate::error::{SimlinkError, SimlinkResult, TransportError};
use crate::value::Value;

/// Blocking client of a remote decision service.
///
/// Owns a small runtime so the synchronous [`DecisionChannel`] loop can drive
/// it. Do not use it from inside another tokio runtime.
pub struct RemoteSession {
    runtime: tokio::runtime::Runtime,
    client: DecisionServiceClient<Channel>,
    session_id: Option<String>,
    stream: Option<Streaming<proto::DecisionBunch>>,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("session_id", &self.session_id)
            .field("streaming", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    /// Connects to `addr`, e.g. `http://127.0.0.1:50051`.
    pub fn connect(addr: impl Into<String>) -> SimlinkResult<Self> {
        let addr = addr.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("failed to start client runtime: {e}"),
            })?;
        let client = runtime
            .block_on(DecisionServiceClient::connect(addr.clone()))
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("{addr}: {e}"),
            })?;

        Ok(Self {
            runtime,
            client,
            session_id: None,
            stream: None,
        })
    }

    /// Selects the project to resolve. Returns its name.
    pub fn set_project(&mut self, project_id: &str) -> SimlinkResult<String> {
        let response = self
            .runtime
            .block_on(self.client.set_project(proto::SetProjectRequest {
                project_id: project_id.to_string(),
            }))
            .map_err(error_from_status)?
            .into_inner();
        tracing::info!(session_id = %response.session_id, project = %response.project_name, "project selected");
        self.session_id = Some(response.session_id);
        self.stream = None;
        Ok(response.project_name)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn require_session(&self) -> Result<String, TransportError> {
        self.session_id.clone().ok_or(TransportError::NoProject)
    }
}

impl DecisionChannel for RemoteSession {
    fn next_bunch(&mut self) -> SimlinkResult<Option<DecisionBunch>> {
        let session_id = self.require_session()?;
        if self.stream.is_none() {
            let response = self
                .runtime
                .block_on(self.client.iter_decisions(proto::IterDecisionsRequest { session_id }))
                .map_err(error_from_status)?;
            self.stream = Some(response.into_inner());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        match self.runtime.block_on(stream.message()) {
            Ok(Some(message)) => decode_bunch(message).map(Some),
            Ok(None) => {
                self.stream = None;
                Ok(None)
            }
            Err(status) => {
                self.stream = None;
                Err(error_from_status(status))
            }
        }
    }

    fn answer(&mut self, key: &DecisionKey, value: &Value) -> SimlinkResult<bool> {
        let session_id = self.require_session()?;
        let value_json = serde_json::to_vec(value).map_err(|e| TransportError::SerializationFailed {
            message: e.to_string(),
        })?;
        let response = self
            .runtime
            .block_on(self.client.answer(proto::AnswerRequest {
                session_id,
                key: key.as_str().to_string(),
                value_json,
            }))
            .map_err(error_from_status)?;
        Ok(response.into_inner().accepted)
    }
}

fn error_from_status(status: Status) -> SimlinkError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unavailable => TransportError::ConnectionFailed { message }.into(),
        Code::Cancelled | Code::Aborted => TransportError::StreamClosed { message }.into(),
        code => TransportError::ServerError {
            code: format!("{code:?}"),
            message,
        }
        .into(),
    }
}

fn decode_bunch(message: proto::DecisionBunch) -> SimlinkResult<DecisionBunch> {
    let decisions = message
        .decisions
        .into_iter()
        .map(decode_descriptor)
        .collect::<SimlinkResult<Vec<_>>>()?;
    Ok(DecisionBunch {
        sequence: message.sequence,
        decisions,
    })
}

fn decode_descriptor(message: proto::DecisionDescriptor) -> SimlinkResult<DecisionDescriptor> {
    let malformed = |what: &str, e: serde_json::Error| TransportError::DeserializationFailed {
        message: format!("{what} of '{}': {e}", message.key),
    };
    let kind: DecisionKind =
        serde_json::from_slice(&message.kind_json).map_err(|e| malformed("kind", e))?;
    let context = if message.context_json.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&message.context_json).map_err(|e| malformed("context", e))?
    };

    Ok(DecisionDescriptor {
        key: DecisionKey::new(message.key),
        prompt: message.prompt,
        kind,
        condition: Some(message.condition).filter(|c| !c.is_empty()),
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_transport_errors() {
        let err = error_from_status(Status::unavailable("down"));
        assert!(err.is_retryable());

        let err = error_from_status(Status::not_found("unknown session"));
        match err {
            SimlinkError::Transport(TransportError::ServerError { code, message }) => {
                assert_eq!(code, "NotFound");
                assert_eq!(message, "unknown session");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn descriptor_decoding() {
        let message = proto::DecisionDescriptor {
            key: "b1.rated_power".into(),
            prompt: "Rated power?".into(),
            kind_json: br#"{"type":"real","unit":"kW"}"#.to_vec(),
            condition: String::new(),
            context_json: Vec::new(),
        };
        let descriptor = decode_descriptor(message).unwrap();
        assert_eq!(descriptor.kind, DecisionKind::Real { unit: Some("kW".into()) });
        assert!(descriptor.condition.is_none());
        assert!(descriptor.context.is_null());

        let broken = proto::DecisionDescriptor {
            key: "k".into(),
            prompt: String::new(),
            kind_json: b"{".to_vec(),
            condition: String::new(),
            context_json: Vec::new(),
        };
        assert!(decode_descriptor(broken).unwrap_err().is_transport());
    }
}
