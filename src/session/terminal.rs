//! Terminal manager: multiplexed interactive shells
//!
//! The agent opens an IOStream whose first frame must begin with the
//! magic prefix followed by the server-allocated session id in ASCII.
//! After attachment, bytes are pumped both ways until either side closes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{AppError, AppResult};
use crate::transport::{classify, ErrorClass, ShellStream};

/// First-frame magic prefix tying a stream to a session
pub const STREAM_MAGIC: [u8; 4] = [0xff, 0x05, 0xff, 0x05];

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created on behalf of a UI client, no agent attached yet
    Pending,
    /// Magic and id received, two-way pumping
    Attached,
    Closed,
}

/// Classified stream failure surfaced to the UI side
#[derive(Debug, Clone)]
pub struct SessionError {
    pub class: ErrorClass,
    pub message: String,
}

impl SessionError {
    /// Whether the UI layer should offer reconnect
    pub fn is_recoverable(&self) -> bool {
        self.class.is_recoverable()
    }
}

/// One interactive shell session
pub struct TerminalSession {
    pub stream_id: String,
    pub host_id: Uuid,
    pub agent_uuid: Uuid,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    to_agent_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    to_agent_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    from_agent_tx: mpsc::Sender<Vec<u8>>,
    from_agent_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    err_tx: mpsc::Sender<SessionError>,
    err_rx: Mutex<mpsc::Receiver<SessionError>>,
    cancel: CancellationToken,
    closed: Mutex<bool>,
}

impl TerminalSession {
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }
}

/// Owns the terminal session map and wires streams to sessions
pub struct TerminalManager {
    sessions: DashMap<String, Arc<TerminalSession>>,
    config: SessionConfig,
}

impl TerminalManager {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            config,
        })
    }

    /// Allocate a pending session awaiting agent attachment
    pub fn create_session(
        &self,
        stream_id: &str,
        host_id: Uuid,
        agent_uuid: Uuid,
    ) -> AppResult<Arc<TerminalSession>> {
        if self.sessions.contains_key(stream_id) {
            return Err(AppError::validation(format!(
                "session {stream_id} already exists"
            )));
        }

        let (to_agent_tx, to_agent_rx) = mpsc::channel(self.config.channel_capacity);
        let (from_agent_tx, from_agent_rx) = mpsc::channel(self.config.channel_capacity);
        let (err_tx, err_rx) = mpsc::channel(10);

        let session = Arc::new(TerminalSession {
            stream_id: stream_id.to_string(),
            host_id,
            agent_uuid,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::Pending),
            to_agent_tx: Mutex::new(Some(to_agent_tx)),
            to_agent_rx: tokio::sync::Mutex::new(Some(to_agent_rx)),
            from_agent_tx,
            from_agent_rx: tokio::sync::Mutex::new(from_agent_rx),
            err_tx,
            err_rx: Mutex::new(err_rx),
            cancel: CancellationToken::new(),
            closed: Mutex::new(false),
        });
        self.sessions
            .insert(stream_id.to_string(), Arc::clone(&session));
        info!("Terminal session {} created for host {}", stream_id, host_id);
        Ok(session)
    }

    /// Drive an agent-opened IOStream: validate the magic prefix, attach
    /// to the session, then pump both directions until close.
    pub async fn handle_io_stream<S: ShellStream>(&self, mut stream: S) -> AppResult<()> {
        let first = match stream.recv().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(AppError::transport("stream closed before handshake")),
            Err(e) => return Err(AppError::transport(format!("handshake recv failed: {e}"))),
        };

        if first.len() <= STREAM_MAGIC.len() || first[..STREAM_MAGIC.len()] != STREAM_MAGIC {
            return Err(AppError::validation("first frame missing magic prefix"));
        }
        let stream_id = String::from_utf8_lossy(&first[STREAM_MAGIC.len()..]).to_string();

        let session = self
            .sessions
            .get(&stream_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| AppError::not_found(format!("terminal session {stream_id}")))?;

        let mut to_agent_rx = session
            .to_agent_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::validation(format!("session {stream_id} already attached")))?;
        *session.state.lock() = SessionState::Attached;
        info!("Terminal session {} attached", stream_id);

        enum PumpEvent {
            Outbound(Vec<u8>),
            Inbound(Result<Option<Vec<u8>>, crate::transport::StreamError>),
            Stop,
        }

        let cancel = session.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => PumpEvent::Stop,
                outbound = to_agent_rx.recv() => match outbound {
                    Some(bytes) => PumpEvent::Outbound(bytes),
                    // to_agent closed by close_session
                    None => PumpEvent::Stop,
                },
                inbound = stream.recv() => PumpEvent::Inbound(inbound),
            };
            match event {
                PumpEvent::Stop => break,
                PumpEvent::Outbound(bytes) => {
                    if let Err(e) = stream.send(bytes).await {
                        push_error(&session, &e);
                        break;
                    }
                }
                PumpEvent::Inbound(Ok(Some(bytes))) => {
                    if session.from_agent_tx.try_send(bytes).is_err() {
                        debug!("Session {} from_agent channel full, frame dropped", stream_id);
                    }
                }
                PumpEvent::Inbound(Ok(None)) => {
                    let _ = session.err_tx.try_send(SessionError {
                        class: ErrorClass::Eof,
                        message: "agent closed the stream".to_string(),
                    });
                    break;
                }
                PumpEvent::Inbound(Err(e)) => {
                    push_error(&session, &e);
                    break;
                }
            }
        }

        self.close_session(&stream_id);
        Ok(())
    }

    /// Forward UI bytes to the agent; fails once the channel stays full
    /// past the configured timeout.
    pub async fn send_to_agent(&self, stream_id: &str, bytes: Vec<u8>) -> AppResult<()> {
        let session = self
            .sessions
            .get(stream_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| AppError::not_found(format!("terminal session {stream_id}")))?;
        let tx = session
            .to_agent_tx
            .lock()
            .clone()
            .ok_or_else(|| AppError::transport("session closed"))?;

        let timeout = Duration::from_secs(self.config.terminal_send_timeout_secs);
        tokio::time::timeout(timeout, tx.send(bytes))
            .await
            .map_err(|_| AppError::transport("send to agent timed out"))?
            .map_err(|_| AppError::transport("session channel closed"))
    }

    /// Next chunk of agent output; `None` once the session is closed
    pub async fn receive_from_agent(&self, stream_id: &str) -> AppResult<Option<Vec<u8>>> {
        let session = self
            .sessions
            .get(stream_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| AppError::not_found(format!("terminal session {stream_id}")))?;

        let mut rx = session.from_agent_rx.lock().await;
        tokio::select! {
            _ = session.cancel.cancelled() => Ok(None),
            chunk = rx.recv() => Ok(chunk),
        }
    }

    /// Non-blocking read of the next classified stream error, if any
    pub fn take_error(&self, stream_id: &str) -> Option<SessionError> {
        let session = self.sessions.get(stream_id)?;
        let err = session.err_rx.lock().try_recv().ok();
        err
    }

    /// Cancel, close the outbound channel and drop the session from the
    /// map. Idempotent: repeated calls on a live handle are harmless.
    pub fn close_session(&self, stream_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(stream_id) else {
            return false;
        };
        {
            let mut closed = session.closed.lock();
            if *closed {
                return true;
            }
            *closed = true;
        }
        *session.state.lock() = SessionState::Closed;
        session.cancel.cancel();
        *session.to_agent_tx.lock() = None;
        info!("Terminal session {} closed", stream_id);
        true
    }

    /// Cascading close when a host is deleted or force-disconnected
    pub fn close_sessions_for_host(&self, host_id: Uuid) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.host_id == host_id)
            .map(|s| s.stream_id.clone())
            .collect();
        let count = ids.len();
        for id in ids {
            self.close_session(&id);
        }
        count
    }

    pub fn session(&self, stream_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(stream_id).map(|s| Arc::clone(&s))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn push_error(session: &TerminalSession, err: &crate::transport::StreamError) {
    let class = classify(err);
    debug!(
        "Session {} stream error ({}): {}",
        session.stream_id,
        class.as_str(),
        err
    );
    let _ = session.err_tx.try_send(SessionError {
        class,
        message: err.to_string(),
    });
}
