//! gRPC transport for remote decision resolution.
//!
//! Decision kinds, context payloads and answer values travel as JSON bytes
//! inside the protobuf messages, so the wire schema stays small while the
//! Rust types keep their serde representation.

mod remote;

pub use remote::RemoteSession;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::broker::{DecisionBroker, DecisionWatch};
use crate::decision::{DecisionBunch, DecisionKey};
use crate::error::{ExecutionError, SimlinkError};
use crate::project::{Project, ProjectRegistry};
use crate::value::Value;

pub mod proto {
    tonic::include_proto!("simlink.v1");
}

pub use proto::decision_service_client::DecisionServiceClient;
use proto::decision_service_server::{DecisionService, DecisionServiceServer};

// ----------------------------------------------------------------------------
// Limits (DoS protection)
// ----------------------------------------------------------------------------

/// Maximum size of an answer value payload.
const MAX_VALUE_JSON_BYTES: usize = 64 * 1024; // 64 KiB

/// Maximum size of an encoded decision context.
const MAX_CONTEXT_JSON_BYTES: usize = 1024 * 1024; // 1 MiB

/// Maximum length of a decision key.
const MAX_KEY_LEN: usize = 1024;

/// Service tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// How often a waiting stream re-checks its bunch and the client.
    pub poll_interval: Duration,
    /// Open sessions the server keeps at once. When full, the least recently
    /// used session makes room for a new one.
    pub max_sessions: usize,
    /// Sessions unused for this long are dropped.
    pub session_ttl: Duration,
    /// Bunches buffered per stream.
    pub stream_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_sessions: 1024,
            session_ttl: Duration::from_secs(15 * 60),
            stream_buffer: 4,
        }
    }
}

/// Count of `IterDecisions` streams still being fed.
#[derive(Debug, Clone, Default)]
pub struct StreamGauge(Arc<AtomicUsize>);

impl StreamGauge {
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> StreamSlot {
        self.0.fetch_add(1, Ordering::SeqCst);
        StreamSlot(self.clone())
    }
}

/// Held by a stream task; leaving the task releases it.
struct StreamSlot(StreamGauge);

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Session {
    project: Arc<Project>,
    last_seen: Instant,
    /// Use order, for least-recently-used eviction.
    tick: u64,
}

/// gRPC service implementation for remote resolvers.
pub struct DecisionServiceImpl {
    projects: Arc<ProjectRegistry>,
    sessions: RwLock<HashMap<Uuid, Session>>,
    clock: AtomicU64,
    streams: StreamGauge,
    config: ServiceConfig,
}

impl DecisionServiceImpl {
    #[must_use]
    pub fn new(projects: Arc<ProjectRegistry>) -> Self {
        Self::with_config(projects, ServiceConfig::default())
    }

    #[must_use]
    pub fn with_config(projects: Arc<ProjectRegistry>, config: ServiceConfig) -> Self {
        Self {
            projects,
            sessions: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            streams: StreamGauge::default(),
            config,
        }
    }

    /// Gauge of live decision streams, readable after the service is moved
    /// into a server.
    #[must_use]
    pub fn streams(&self) -> StreamGauge {
        self.streams.clone()
    }

    #[must_use]
    pub fn into_server(self) -> DecisionServiceServer<Self> {
        DecisionServiceServer::new(self)
    }

    async fn session(&self, session_id: &str) -> Result<Arc<Project>, Status> {
        let id = parse_uuid(session_id)?;
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .filter(|s| s.last_seen.elapsed() < self.config.session_ttl)
            .ok_or_else(|| Status::not_found("unknown or expired session; call SetProject again"))?;
        session.last_seen = Instant::now();
        session.tick = tick;
        Ok(Arc::clone(&session.project))
    }
}

/// Drops expired sessions, then the least recently used ones until a new
/// session fits under `capacity`.
fn evict_sessions(sessions: &mut HashMap<Uuid, Session>, ttl: Duration, capacity: usize) {
    sessions.retain(|_, s| s.last_seen.elapsed() < ttl);
    while sessions.len() >= capacity.max(1) {
        let Some(oldest) = sessions.iter().min_by_key(|(_, s)| s.tick).map(|(id, _)| *id) else {
            break;
        };
        sessions.remove(&oldest);
        tracing::info!(session_id = %oldest, "least recently used session evicted");
    }
}

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn parse_uuid(s: &str) -> Result<Uuid, Status> {
    if s.len() > 64 {
        return Err(invalid_argument("uuid string too long"));
    }
    s.parse().map_err(|_| invalid_argument("invalid UUID format"))
}

fn parse_value(bytes: &[u8]) -> Result<Value, Status> {
    if bytes.is_empty() {
        return Err(invalid_argument("value_json is required"));
    }
    if bytes.len() > MAX_VALUE_JSON_BYTES {
        return Err(invalid_argument("value_json exceeds maximum size"));
    }
    serde_json::from_slice(bytes).map_err(|e| invalid_argument(format!("invalid value JSON: {e}")))
}

fn encode_json<T: serde::Serialize>(value: &T, max: usize) -> Result<Vec<u8>, Status> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize JSON: {e}")))?;
    if bytes.len() > max {
        return Err(Status::resource_exhausted("serialized JSON exceeds size limit"));
    }
    Ok(bytes)
}

fn encode_bunch(bunch: &DecisionBunch) -> Result<proto::DecisionBunch, Status> {
    let decisions = bunch
        .decisions
        .iter()
        .map(|d| {
            Ok(proto::DecisionDescriptor {
                key: d.key.as_str().to_string(),
                prompt: d.prompt.clone(),
                kind_json: encode_json(&d.kind, MAX_VALUE_JSON_BYTES)?,
                condition: d.condition.clone().unwrap_or_default(),
                context_json: encode_json(&d.context, MAX_CONTEXT_JSON_BYTES)?,
            })
        })
        .collect::<Result<Vec<_>, Status>>()?;
    Ok(proto::DecisionBunch {
        sequence: bunch.sequence,
        decisions,
    })
}

fn status_from_error(err: SimlinkError) -> Status {
    match err {
        SimlinkError::Validation(v) => Status::invalid_argument(v.to_string()),
        SimlinkError::Transport(t) => Status::unavailable(t.to_string()),
        SimlinkError::Internal { message } => Status::internal(message),
        SimlinkError::Execution(e) => match e {
            ExecutionError::ProjectNotFound { .. }
            | ExecutionError::DecisionNotFound { .. }
            | ExecutionError::ComponentNotFound { .. } => Status::not_found(e.to_string()),

            ExecutionError::DuplicateRegistration { .. } => Status::already_exists(e.to_string()),
            ExecutionError::Timeout { .. } => Status::deadline_exceeded(e.to_string()),

            ExecutionError::DecisionPending { .. }
            | ExecutionError::AttributeLocked { .. }
            | ExecutionError::RetriesExhausted { .. }
            | ExecutionError::NoCandidate { .. } => Status::failed_precondition(e.to_string()),

            ExecutionError::Storage { .. } | ExecutionError::Disconnected { .. } => {
                Status::internal(e.to_string())
            }
        },
    }
}

type BunchSender = mpsc::Sender<Result<proto::DecisionBunch, Status>>;

/// Feeds one `IterDecisions` stream.
///
/// Sends a bunch, then waits until every decision in it is resolved before
/// taking the next snapshot. Returns when nothing is pending or the client
/// went away; pending decisions are left as they are.
fn stream_bunches(broker: &DecisionBroker, watch: &DecisionWatch, tx: &BunchSender, poll: Duration) {
    loop {
        let bunch = match broker.next_bunch() {
            Ok(Some(bunch)) => bunch,
            Ok(None) => break,
            Err(err) => {
                let _ = tx.blocking_send(Err(status_from_error(err)));
                return;
            }
        };
        let keys: Vec<DecisionKey> = bunch.keys().cloned().collect();
        let message = match encode_bunch(&bunch) {
            Ok(message) => message,
            Err(status) => {
                let _ = tx.blocking_send(Err(status));
                return;
            }
        };
        if tx.blocking_send(Ok(message)).is_err() {
            return;
        }

        loop {
            match broker.all_resolved(&keys) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    let _ = tx.blocking_send(Err(status_from_error(err)));
                    return;
                }
            }
            if tx.is_closed() {
                tracing::debug!(sequence = bunch.sequence, "resolver left with bunch open");
                return;
            }
            // Any event may close the bunch; timeouts only re-check the client.
            match watch.recv_timeout(poll) {
                Ok(_) | Err(SimlinkError::Execution(ExecutionError::Timeout { .. })) => {}
                Err(err) => {
                    let _ = tx.blocking_send(Err(status_from_error(err)));
                    return;
                }
            }
        }
    }
    tracing::debug!("no pending decisions left; stream finished");
}

#[tonic::async_trait]
impl DecisionService for DecisionServiceImpl {
    async fn set_project(
        &self,
        request: Request<proto::SetProjectRequest>,
    ) -> Result<Response<proto::SetProjectResponse>, Status> {
        let req = request.into_inner();
        if req.project_id.len() > 64 {
            return Err(invalid_argument("project_id too long"));
        }
        let project = self
            .projects
            .lookup(&req.project_id)
            .map_err(status_from_error)?;

        let session_id = Uuid::new_v4();
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.config.max_sessions {
                evict_sessions(&mut sessions, self.config.session_ttl, self.config.max_sessions);
            }
            sessions.insert(
                session_id,
                Session {
                    project: Arc::clone(&project),
                    last_seen: Instant::now(),
                    tick,
                },
            );
        }
        tracing::info!(%session_id, project = project.name(), "session opened");

        Ok(Response::new(proto::SetProjectResponse {
            session_id: session_id.to_string(),
            project_name: project.name().to_string(),
        }))
    }

    type IterDecisionsStream = ReceiverStream<Result<proto::DecisionBunch, Status>>;

    async fn iter_decisions(
        &self,
        request: Request<proto::IterDecisionsRequest>,
    ) -> Result<Response<Self::IterDecisionsStream>, Status> {
        let req = request.into_inner();
        let project = self.session(&req.session_id).await?;
        let broker = Arc::clone(project.broker());
        let watch = broker.watch().map_err(status_from_error)?;
        let poll = self.config.poll_interval;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let slot = self.streams.enter();
        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            stream_bunches(&broker, &watch, &tx, poll);
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn answer(
        &self,
        request: Request<proto::AnswerRequest>,
    ) -> Result<Response<proto::AnswerResponse>, Status> {
        let req = request.into_inner();
        let project = self.session(&req.session_id).await?;
        if req.key.trim().is_empty() {
            return Err(invalid_argument("key is required"));
        }
        if req.key.len() > MAX_KEY_LEN {
            return Err(invalid_argument("key too long"));
        }
        let value = parse_value(&req.value_json)?;

        let accepted = project
            .broker()
            .answer(&DecisionKey::new(req.key), value)
            .map_err(status_from_error)?;
        Ok(Response::new(proto::AnswerResponse { accepted }))
    }
}
