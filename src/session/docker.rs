//! Docker stream manager: multiplexed container operations
//!
//! Same shape as the terminal manager with a typed wire protocol: both
//! sides exchange `Init` frames, then `Data`/`Error`/`Close` frames flow.
//! Session requests reference an agent connection record UUID, so the
//! manager resolves connection -> host node -> host UUID before queueing
//! the task (the registry keys on host UUID).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::ClientRegistry;
use crate::config::SessionConfig;
use crate::error::{AppError, AppResult};
use crate::repository::HostRepository;
use crate::transport::{
    DockerChannel, DockerFrame, DockerInit, DockerOperation, TaskType, AgentTask,
};

/// Docker session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerSessionState {
    /// Task queued, waiting for the agent to dial back
    Pending,
    /// Init handshake completed
    Ready,
    /// Data frames observed
    Flowing,
    Closed,
}

/// Parameters of a requested container operation
#[derive(Debug, Clone)]
pub struct DockerSessionRequest {
    /// UUID of the durable agent connection record
    pub connection_id: Uuid,
    pub operation: DockerOperation,
    pub instance_id: Option<String>,
    pub container_id: Option<String>,
    pub image_name: Option<String>,
    pub params: HashMap<String, String>,
}

/// One container operation session
#[derive(Debug)]
pub struct DockerSession {
    pub session_id: String,
    pub host_id: Uuid,
    pub operation: DockerOperation,
    pub created_at: DateTime<Utc>,
    request: DockerSessionRequest,
    state: Mutex<DockerSessionState>,
    to_agent_tx: Mutex<Option<mpsc::Sender<DockerFrame>>>,
    to_agent_rx: tokio::sync::Mutex<Option<mpsc::Receiver<DockerFrame>>>,
    from_agent_tx: mpsc::Sender<DockerFrame>,
    from_agent_rx: tokio::sync::Mutex<mpsc::Receiver<DockerFrame>>,
    cancel: CancellationToken,
    closed: Mutex<bool>,
}

impl DockerSession {
    pub fn state(&self) -> DockerSessionState {
        *self.state.lock()
    }
}

/// Owns docker sessions and wires agent streams to them
pub struct DockerStreamManager {
    sessions: DashMap<String, Arc<DockerSession>>,
    registry: Arc<ClientRegistry>,
    hosts: Arc<dyn HostRepository>,
    config: SessionConfig,
}

impl DockerStreamManager {
    pub fn new(
        registry: Arc<ClientRegistry>,
        hosts: Arc<dyn HostRepository>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            registry,
            hosts,
            config,
        })
    }

    /// Allocate a session, resolve the target host through the connection
    /// record, and queue the `docker_stream` task on its agent.
    pub async fn create_session(
        self: &Arc<Self>,
        request: DockerSessionRequest,
    ) -> AppResult<Arc<DockerSession>> {
        let record = self
            .hosts
            .get_connection(request.connection_id)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!("agent connection {}", request.connection_id))
            })?;
        let host = self
            .hosts
            .get_host(record.host_id)
            .await?
            .filter(|h| !h.deleted)
            .ok_or_else(|| AppError::not_found(format!("host {}", record.host_id)))?;

        let session_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let (to_agent_tx, to_agent_rx) = mpsc::channel(self.config.channel_capacity);
        let (from_agent_tx, from_agent_rx) = mpsc::channel(self.config.channel_capacity);
        let session = Arc::new(DockerSession {
            session_id: session_id.clone(),
            host_id: host.id,
            operation: request.operation,
            created_at: Utc::now(),
            request: request.clone(),
            state: Mutex::new(DockerSessionState::Pending),
            to_agent_tx: Mutex::new(Some(to_agent_tx)),
            to_agent_rx: tokio::sync::Mutex::new(Some(to_agent_rx)),
            from_agent_tx,
            from_agent_rx: tokio::sync::Mutex::new(from_agent_rx),
            cancel: CancellationToken::new(),
            closed: Mutex::new(false),
        });
        self.sessions
            .insert(session_id.clone(), Arc::clone(&session));

        if let Err(e) = self
            .registry
            .queue_task(host.id, stream_task(&session_id, &request))
        {
            self.sessions.remove(&session_id);
            return Err(e);
        }

        // hard ceiling on session lifetime
        let manager = Arc::clone(self);
        let timeout_id = session_id.clone();
        let ceiling = Duration::from_secs(self.config.docker_session_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            if manager.close_session(&timeout_id) {
                warn!("Docker session {} hit its lifetime ceiling", timeout_id);
            }
        });

        info!(
            "Docker session {} ({}) created for host {}",
            session_id,
            request.operation.as_str(),
            host.id
        );
        Ok(session)
    }

    /// Drive an agent-opened docker stream: expect the agent's `Init`,
    /// reply ready plus operation parameters, then pump typed frames.
    pub async fn handle_stream<S: DockerChannel>(&self, mut stream: S) -> AppResult<()> {
        let init = match stream.recv().await {
            Ok(Some(DockerFrame::Init(init))) => init,
            Ok(Some(_)) => return Err(AppError::validation("first frame must be init")),
            Ok(None) => return Err(AppError::transport("stream closed before init")),
            Err(e) => return Err(AppError::transport(format!("init recv failed: {e}"))),
        };

        let session = self
            .sessions
            .get(&init.session_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| AppError::not_found(format!("docker session {}", init.session_id)))?;

        stream
            .send(DockerFrame::Init(DockerInit {
                session_id: session.session_id.clone(),
                ready: Some(true),
                operation: None,
                instance_id: None,
                container_id: None,
                image_name: None,
                params: None,
            }))
            .await
            .map_err(|e| AppError::transport(format!("ready reply failed: {e}")))?;
        stream
            .send(DockerFrame::Init(DockerInit {
                session_id: session.session_id.clone(),
                ready: None,
                operation: Some(session.operation),
                instance_id: session.request.instance_id.clone(),
                container_id: session.request.container_id.clone(),
                image_name: session.request.image_name.clone(),
                params: Some(session.request.params.clone()),
            }))
            .await
            .map_err(|e| AppError::transport(format!("operation init failed: {e}")))?;

        let mut to_agent_rx = session.to_agent_rx.lock().await.take().ok_or_else(|| {
            AppError::validation(format!("session {} already attached", session.session_id))
        })?;
        *session.state.lock() = DockerSessionState::Ready;
        info!("Docker session {} ready", session.session_id);

        enum PumpEvent {
            Outbound(DockerFrame),
            Inbound(Result<Option<DockerFrame>, crate::transport::StreamError>),
            Stop,
        }

        let cancel = session.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => PumpEvent::Stop,
                outbound = to_agent_rx.recv() => match outbound {
                    Some(frame) => PumpEvent::Outbound(frame),
                    None => PumpEvent::Stop,
                },
                inbound = stream.recv() => PumpEvent::Inbound(inbound),
            };
            match event {
                PumpEvent::Stop => break,
                PumpEvent::Outbound(frame) => {
                    if let Err(e) = stream.send(frame).await {
                        debug!("Docker session {} send failed: {}", session.session_id, e);
                        break;
                    }
                }
                PumpEvent::Inbound(Ok(Some(frame))) => {
                    let closing = matches!(frame, DockerFrame::Close(_));
                    if matches!(frame, DockerFrame::Data(_)) {
                        let mut state = session.state.lock();
                        if *state == DockerSessionState::Ready {
                            *state = DockerSessionState::Flowing;
                        }
                    }
                    if session.from_agent_tx.try_send(frame).is_err() {
                        debug!(
                            "Docker session {} from_agent channel full, frame dropped",
                            session.session_id
                        );
                    }
                    if closing {
                        break;
                    }
                }
                PumpEvent::Inbound(Ok(None)) => break,
                PumpEvent::Inbound(Err(e)) => {
                    debug!("Docker session {} stream error: {}", session.session_id, e);
                    break;
                }
            }
        }

        self.close_session(&session.session_id);
        Ok(())
    }

    /// Poll until the agent completes the init handshake
    pub async fn wait_for_ready(&self, session_id: &str, timeout: Duration) -> AppResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.ready_poll_interval_ms);
        loop {
            match self.sessions.get(session_id).map(|s| s.state()) {
                Some(DockerSessionState::Ready) | Some(DockerSessionState::Flowing) => {
                    return Ok(())
                }
                Some(DockerSessionState::Closed) | None => {
                    return Err(AppError::transport(format!("session {session_id} closed")))
                }
                Some(DockerSessionState::Pending) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::transport(format!(
                    "timed out waiting for session {session_id}"
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn send_to_agent(&self, session_id: &str, frame: DockerFrame) -> AppResult<()> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| AppError::not_found(format!("docker session {session_id}")))?;
        let tx = session
            .to_agent_tx
            .lock()
            .clone()
            .ok_or_else(|| AppError::transport("session closed"))?;

        let timeout = Duration::from_secs(self.config.terminal_send_timeout_secs);
        tokio::time::timeout(timeout, tx.send(frame))
            .await
            .map_err(|_| AppError::transport("send to agent timed out"))?
            .map_err(|_| AppError::transport("session channel closed"))
    }

    /// Next frame from the agent; `None` once the session is closed
    pub async fn receive_from_agent(&self, session_id: &str) -> AppResult<Option<DockerFrame>> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| AppError::not_found(format!("docker session {session_id}")))?;

        let mut rx = session.from_agent_rx.lock().await;
        tokio::select! {
            _ = session.cancel.cancelled() => Ok(None),
            frame = rx.recv() => Ok(frame),
        }
    }

    pub fn close_session(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        {
            let mut closed = session.closed.lock();
            if *closed {
                return true;
            }
            *closed = true;
        }
        *session.state.lock() = DockerSessionState::Closed;
        session.cancel.cancel();
        *session.to_agent_tx.lock() = None;
        info!("Docker session {} closed", session_id);
        true
    }

    /// Cascading close when a host is deleted or force-disconnected
    pub fn close_sessions_for_host(&self, host_id: Uuid) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.host_id == host_id)
            .map(|s| s.session_id.clone())
            .collect();
        let count = ids.len();
        for id in ids {
            self.close_session(&id);
        }
        count
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<DockerSession>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Build the docker_stream task queued to the agent
fn stream_task(session_id: &str, request: &DockerSessionRequest) -> AgentTask {
    let mut task = AgentTask::new(TaskType::DockerStream)
        .with_param("session_id", session_id)
        .with_param("operation", request.operation.as_str());
    if let Some(instance_id) = &request.instance_id {
        task = task.with_param("instance_id", instance_id.clone());
    }
    if let Some(container_id) = &request.container_id {
        task = task.with_param("container_id", container_id.clone());
    }
    if let Some(image_name) = &request.image_name {
        task = task.with_param("image_name", image_name.clone());
    }
    for (key, value) in &request.params {
        task = task.with_param(key, value.clone());
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_task_carries_operation_params() {
        let request = DockerSessionRequest {
            connection_id: Uuid::new_v4(),
            operation: DockerOperation::GetLogs,
            instance_id: Some("inst-1".to_string()),
            container_id: Some("c-1".to_string()),
            image_name: None,
            params: HashMap::from([("tail".to_string(), "100".to_string())]),
        };
        let task = stream_task("sess-1", &request);
        assert_eq!(task.task_type, TaskType::DockerStream);
        assert_eq!(
            task.params.get("operation").map(String::as_str),
            Some("get_logs")
        );
        assert_eq!(
            task.params.get("session_id").map(String::as_str),
            Some("sess-1")
        );
        assert_eq!(task.params.get("tail").map(String::as_str), Some("100"));
        assert!(task.params.get("image_name").is_none());
    }
}
