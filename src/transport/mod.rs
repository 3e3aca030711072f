//! Agent transport layer
//!
//! Wire frames for the logical RPCs, the stream traits the core is written
//! against, and the carriers that implement them:
//! - `ws`: the WebSocket carrier used in production
//! - `duplex`: in-memory endpoints used by tests
//!
//! The protocol is strictly client-initiated; outbound work rides on the
//! acks of state reports as [`AgentTask`] envelopes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{HostInfo, HostState};

pub mod classify;
pub mod duplex;
pub mod ws;

pub use classify::{classify, CarrierCode, ErrorClass, StreamError};

/// Outbound task envelope, server to agent, piggybacked on state acks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: String,
    pub task_type: TaskType,
    pub params: HashMap<String, String>,
}

impl AgentTask {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type,
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Task discriminator understood by agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Probe,
    DockerStream,
}

/// Register RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub uuid: Uuid,
    pub secret: String,
    pub info: HostInfo,
}

/// Register RPC response; `server_time` enables clock-skew tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    pub server_time: chrono::DateTime<chrono::Utc>,
}

/// Heartbeat RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub server_time: chrono::DateTime<chrono::Utc>,
}

/// One frame on the agent-to-server leg of the ReportState stream
///
/// The first frame must carry `uuid`; later frames may omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HostState>,
}

/// Ack on the server-to-agent leg; carries piggybacked tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<AgentTask>,
}

impl StateAck {
    pub fn ok(tasks: Vec<AgentTask>) -> Self {
        Self {
            success: true,
            message: None,
            tasks,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            tasks: Vec::new(),
        }
    }
}

/// One row of a batched probe report
///
/// The monitor id stays a string so malformed rows can be counted as
/// failures instead of poisoning batch deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReportEntry {
    pub service_monitor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ProbeReportPayload>,
}

/// Per-execution payload inside a batched probe report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReportPayload {
    pub success: bool,
    pub latency_ms: f64,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_response_body: Option<String>,
}

/// Batch probe report response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeBatchResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub processed: u32,
    pub failed: u32,
}

/// Container operation requested through a docker stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockerOperation {
    ExecContainer,
    GetLogs,
    GetStats,
    PullImage,
    GetEvents,
}

impl DockerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DockerOperation::ExecContainer => "exec_container",
            DockerOperation::GetLogs => "get_logs",
            DockerOperation::GetStats => "get_stats",
            DockerOperation::PullImage => "pull_image",
            DockerOperation::GetEvents => "get_events",
        }
    }
}

/// Typed frames on a docker stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DockerFrame {
    Init(DockerInit),
    Data(DockerData),
    Error(DockerError),
    Close(DockerClose),
}

impl DockerFrame {
    pub fn session_id(&self) -> &str {
        match self {
            DockerFrame::Init(f) => &f.session_id,
            DockerFrame::Data(f) => &f.session_id,
            DockerFrame::Error(f) => &f.session_id,
            DockerFrame::Close(f) => &f.session_id,
        }
    }
}

/// Init handshake frame, sent by both sides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerInit {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DockerOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,
}

/// Payload frame; `channel` distinguishes stdout/stderr style substreams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerData {
    pub session_id: String,
    pub payload: Vec<u8>,
    pub channel: u8,
}

/// Error frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerError {
    pub session_id: String,
    pub error: String,
}

/// Close frame with optional exit code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerClose {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// Server side of a ReportState stream
#[async_trait]
pub trait StateStream: Send {
    /// Next frame from the agent; `Ok(None)` is a clean end of stream
    async fn recv(&mut self) -> Result<Option<StateFrame>, StreamError>;
    async fn send(&mut self, ack: StateAck) -> Result<(), StreamError>;
}

/// Server side of an IOStream: opaque byte frames
#[async_trait]
pub trait ShellStream: Send {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, StreamError>;
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), StreamError>;
}

/// Server side of a DockerStream: typed frames
#[async_trait]
pub trait DockerChannel: Send {
    async fn recv(&mut self) -> Result<Option<DockerFrame>, StreamError>;
    async fn send(&mut self, frame: DockerFrame) -> Result<(), StreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_envelope_serializes_snake_case_type() {
        let task = AgentTask::new(TaskType::DockerStream).with_param("session_id", "s-1");
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"docker_stream\""));
        assert!(json.contains("\"session_id\":\"s-1\""));
    }

    #[test]
    fn state_frame_uuid_is_optional_after_first() {
        let frame: StateFrame = serde_json::from_str("{\"state\":null}").unwrap();
        assert!(frame.uuid.is_none());
        assert!(frame.state.is_none());
    }

    #[test]
    fn docker_frame_tags_by_type() {
        let frame = DockerFrame::Close(DockerClose {
            session_id: "abc".to_string(),
            code: Some(0),
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"close\""));
        let parsed: DockerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id(), "abc");
    }
}
