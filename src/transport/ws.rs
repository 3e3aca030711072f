//! WebSocket carrier for the agent transport
//!
//! Agents connect to one of four endpoints:
//! - `/agent/rpc`    unary RPCs (register, heartbeat, probe result batches)
//! - `/agent/state`  the ReportState bidirectional stream
//! - `/agent/io`     raw shell byte stream
//! - `/agent/docker` typed docker stream
//!
//! Typed frames travel as JSON text messages; shell traffic travels as
//! binary messages. Transport encryption is the carrier's concern.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::{
    CarrierCode, DockerChannel, DockerFrame, HeartbeatResponse, ProbeBatchResponse,
    ProbeReportEntry, RegisterRequest, RegisterResponse, ShellStream, StateAck, StateFrame,
    StateStream, StreamError,
};

/// Unary request on the `/agent/rpc` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rpc")]
pub enum RpcRequest {
    Register(RegisterRequest),
    Heartbeat { uuid: Uuid },
    ProbeResults { uuid: Uuid, results: Vec<ProbeReportEntry> },
}

/// Unary response on the `/agent/rpc` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rpc")]
pub enum RpcResponse {
    Register(RegisterResponse),
    Heartbeat(HeartbeatResponse),
    ProbeResults(ProbeBatchResponse),
    Error { message: String },
}

/// Server-side hooks for accepted agent connections
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_state_stream(&self, stream: WsStateStream);
    async fn on_shell_stream(&self, stream: WsShellStream);
    async fn on_docker_stream(&self, stream: WsDockerChannel);
    async fn on_rpc(&self, request: RpcRequest) -> RpcResponse;
}

/// Accept loop for the agent transport listener
pub async fn serve(
    bind_addr: &str,
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
) -> AppResult<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Agent transport listening on {}", bind_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept agent connection: {}", e);
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, handler).await {
                        debug!("Connection from {} ended: {}", peer, e);
                    }
                });
            }
        }
    }

    info!("Agent transport listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn ConnectionHandler>,
) -> AppResult<()> {
    let mut path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    .map_err(|e| AppError::transport(format!("handshake with {peer} failed: {e}")))?;

    debug!("Agent connection from {} on {}", peer, path);
    let conn = WsConnection { inner: ws };

    match path.as_str() {
        "/agent/state" => handler.on_state_stream(WsStateStream { conn }).await,
        "/agent/io" => handler.on_shell_stream(WsShellStream { conn }).await,
        "/agent/docker" => handler.on_docker_stream(WsDockerChannel { conn }).await,
        "/agent/rpc" => run_rpc_loop(conn, handler).await?,
        other => {
            return Err(AppError::transport(format!("unknown endpoint: {other}")));
        }
    }
    Ok(())
}

async fn run_rpc_loop(mut conn: WsConnection, handler: Arc<dyn ConnectionHandler>) -> AppResult<()> {
    while let Some(text) = conn
        .recv_text()
        .await
        .map_err(|e| AppError::transport(e.to_string()))?
    {
        let response = match serde_json::from_str::<RpcRequest>(&text) {
            Ok(request) => handler.on_rpc(request).await,
            Err(e) => RpcResponse::Error {
                message: format!("malformed rpc request: {e}"),
            },
        };
        let body = serde_json::to_string(&response)?;
        conn.send_text(body)
            .await
            .map_err(|e| AppError::transport(e.to_string()))?;
    }
    Ok(())
}

/// Thin wrapper translating tungstenite messages and errors
struct WsConnection {
    inner: WebSocketStream<TcpStream>,
}

impl WsConnection {
    async fn recv_text(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(map_ws_error(e)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map(Some)
                        .map_err(|_| StreamError::Protocol("non-utf8 text frame".to_string()))
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn recv_binary(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(map_ws_error(e)),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), StreamError> {
        self.inner
            .send(Message::Binary(bytes))
            .await
            .map_err(map_ws_error)
    }
}

fn map_ws_error(err: tokio_tungstenite::tungstenite::Error) -> StreamError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => StreamError::Closed,
        WsError::Io(io) => StreamError::Io(io),
        WsError::Capacity(e) => StreamError::Carrier {
            code: CarrierCode::ResourceExhausted,
            message: e.to_string(),
        },
        WsError::Protocol(e) => StreamError::Protocol(e.to_string()),
        other => StreamError::Carrier {
            code: CarrierCode::Unknown,
            message: other.to_string(),
        },
    }
}

/// ReportState stream over the WebSocket carrier
pub struct WsStateStream {
    conn: WsConnection,
}

#[async_trait]
impl StateStream for WsStateStream {
    async fn recv(&mut self) -> Result<Option<StateFrame>, StreamError> {
        match self.conn.recv_text().await? {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StreamError::Protocol(format!("bad state frame: {e}"))),
        }
    }

    async fn send(&mut self, ack: StateAck) -> Result<(), StreamError> {
        let body = serde_json::to_string(&ack)
            .map_err(|e| StreamError::Protocol(format!("encode ack: {e}")))?;
        self.conn.send_text(body).await
    }
}

/// Shell byte stream over the WebSocket carrier
pub struct WsShellStream {
    conn: WsConnection,
}

#[async_trait]
impl ShellStream for WsShellStream {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        self.conn.recv_binary().await
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), StreamError> {
        self.conn.send_binary(bytes).await
    }
}

/// Docker typed stream over the WebSocket carrier
pub struct WsDockerChannel {
    conn: WsConnection,
}

#[async_trait]
impl DockerChannel for WsDockerChannel {
    async fn recv(&mut self) -> Result<Option<DockerFrame>, StreamError> {
        match self.conn.recv_text().await? {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StreamError::Protocol(format!("bad docker frame: {e}"))),
        }
    }

    async fn send(&mut self, frame: DockerFrame) -> Result<(), StreamError> {
        let body = serde_json::to_string(&frame)
            .map_err(|e| StreamError::Protocol(format!("encode docker frame: {e}")))?;
        self.conn.send_text(body).await
    }
}
