//! Domain model for the monitoring core
//!
//! Durable entities held by the repositories plus the enums shared across
//! subsystems. Identifiers are UUIDs end-to-end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Durable record of a managed host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostNode {
    pub id: Uuid,
    /// Agent-facing pairing secret
    pub secret_key: String,
    pub name: String,
    /// Grouping tags used by the group probe strategy
    pub groups: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Cumulative bytes transferred; updated by atomic increments only
    pub traffic_used: u64,
    pub last_active: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

impl HostNode {
    pub fn new(name: String, secret_key: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            secret_key,
            name,
            groups: Vec::new(),
            expires_at: None,
            traffic_used: 0,
            last_active: None,
            created_at: Utc::now(),
            deleted: false,
        }
    }
}

/// Static host facts, exactly one per host, replaced on each registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_id: Uuid,
    pub platform: String,
    pub platform_version: String,
    pub cpu_model: String,
    pub cpu_cores: u32,
    pub mem_total: u64,
    pub swap_total: u64,
    pub disk_total: u64,
    pub agent_version: String,
    pub boot_time: Option<DateTime<Utc>>,
    pub ssh_port: Option<u16>,
}

/// Liveness status of a durable agent connection record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Durable mirror of an agent's live connection, at most one per host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConnectionRecord {
    pub id: Uuid,
    pub host_id: Uuid,
    pub status: ConnectionStatus,
    pub agent_version: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub disconnect_reason: Option<String>,
}

impl AgentConnectionRecord {
    pub fn new(host_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id,
            status: ConnectionStatus::Offline,
            agent_version: String::new(),
            connected_at: None,
            last_heartbeat: None,
            disconnected_at: None,
            disconnect_reason: None,
        }
    }
}

/// Per-sensor temperature reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorTemperature {
    pub sensor: String,
    pub celsius: f64,
}

/// Time-series host state sample
///
/// `delta_sent`/`delta_recv` are bytes since the prior sample and must be
/// non-negative; the server applies their sum to `HostNode.traffic_used`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub host_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_used: u64,
    pub mem_used_percent: f64,
    pub swap_used: u64,
    pub disk_used: u64,
    pub disk_used_percent: f64,
    pub net_rx_transfer: u64,
    pub net_tx_transfer: u64,
    pub net_rx_speed: u64,
    pub net_tx_speed: u64,
    pub tcp_connections: u32,
    pub udp_connections: u32,
    pub process_count: u32,
    pub uptime_seconds: u64,
    pub gpu_percent: f64,
    pub traffic_sent: u64,
    pub traffic_recv: u64,
    pub delta_sent: u64,
    pub delta_recv: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperatures: Option<Vec<SensorTemperature>>,
}

impl HostState {
    /// Traffic delta applied to the host's cumulative counter
    pub fn traffic_delta(&self) -> u64 {
        self.delta_sent.saturating_add(self.delta_recv)
    }
}

/// Probe type of a service monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Tcp,
    Icmp,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Http => "http",
            ProbeKind::Tcp => "tcp",
            ProbeKind::Icmp => "icmp",
        }
    }
}

impl FromStr for ProbeKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ProbeKind::Http),
            "tcp" => Ok(ProbeKind::Tcp),
            "icmp" => Ok(ProbeKind::Icmp),
            other => Err(AppError::validation(format!("unknown probe type: {other}"))),
        }
    }
}

/// How a monitor picks its executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    /// Execute in-process on the server
    Server,
    /// Strategy data is a JSON array of agent UUIDs to include
    Include,
    /// All active agents minus a JSON array of UUIDs
    Exclude,
    /// Resolve agents by host group name
    Group,
}

/// Durable probe definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMonitor {
    pub id: Uuid,
    pub name: String,
    pub kind: ProbeKind,
    pub target: String,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub strategy: ProbeStrategy,
    /// JSON array of agent UUIDs, or a group name, depending on strategy
    pub strategy_data: Option<String>,
    pub http_method: Option<String>,
    pub http_headers: Option<HashMap<String, String>>,
    pub expect_status: Option<u16>,
    pub expect_body: Option<String>,
    pub tcp_send: Option<String>,
    pub tcp_expect: Option<String>,
    pub notify_on_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceMonitor {
    /// Minimal monitor with required fields; type-specific fields default off
    pub fn new(name: String, kind: ProbeKind, target: String, interval_seconds: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            kind,
            target,
            interval_seconds,
            timeout_seconds: 0,
            enabled: true,
            strategy: ProbeStrategy::Server,
            strategy_data: None,
            http_method: None,
            http_headers: None,
            expect_status: None,
            expect_body: None,
            tcp_send: None,
            tcp_expect: None,
            notify_on_failure: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Monitor-level invariants: interval >= 1, strategy data iff non-server
    pub fn validate(&self) -> AppResult<()> {
        if self.interval_seconds < 1 {
            return Err(AppError::validation("interval_seconds must be >= 1"));
        }
        if self.name.is_empty() {
            return Err(AppError::validation("monitor name is required"));
        }
        if self.target.is_empty() {
            return Err(AppError::validation("monitor target is required"));
        }
        let needs_data = self.strategy != ProbeStrategy::Server;
        let has_data = self
            .strategy_data
            .as_ref()
            .map(|d| !d.is_empty())
            .unwrap_or(false);
        if needs_data && !has_data {
            return Err(AppError::validation(
                "strategy_data is required for non-server strategies",
            ));
        }
        if !needs_data && has_data {
            return Err(AppError::validation(
                "strategy_data must be empty for the server strategy",
            ));
        }
        Ok(())
    }
}

/// Per-execution probe outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub monitor_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: f64,
    pub http_status: Option<u16>,
    /// Truncated response body, at most 1KB
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    /// None means the server executed the probe
    pub executor: Option<Uuid>,
}

/// Rolled-up batch record, one per (monitor, executor, flush)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHistory {
    pub monitor_id: Uuid,
    pub executor: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub avg_delay: f64,
    pub up: u64,
    pub down: u64,
    /// Opaque metadata, e.g. TLS certificate info for HTTPS targets
    pub metadata: Option<serde_json::Value>,
}

/// TLS certificate facts attached to HTTPS probe reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_to_expiry: i64,
    pub dns_names: Vec<String>,
}

/// Alert severity shared by cert and expiry alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// A firing (or resolved) alert occurrence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorAlertEvent {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub host_id: Option<Uuid>,
    pub monitor_id: Option<Uuid>,
    pub severity: AlertSeverity,
    pub message: String,
    pub firing: bool,
    pub created_at: DateTime<Utc>,
}

/// Who performed an audited action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum Principal {
    User(Uuid),
    System,
}

/// Durable audit envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub subsystem: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub principal: Principal,
    pub timestamp: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub data: HashMap<String, serde_json::Value>,
}

impl AuditEvent {
    /// System-generated event for the host subsystem
    pub fn host_system_event(host_id: Uuid, action: &str) -> Self {
        Self {
            subsystem: "host".to_string(),
            action: action.to_string(),
            resource_type: "host".to_string(),
            resource_id: Some(host_id.to_string()),
            principal: Principal::System,
            timestamp: Utc::now(),
            client_ip: None,
            user_agent: None,
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_validation_enforces_interval_floor() {
        let mut monitor = ServiceMonitor::new(
            "web".to_string(),
            ProbeKind::Http,
            "http://example.com".to_string(),
            0,
        );
        assert!(monitor.validate().is_err());
        monitor.interval_seconds = 1;
        assert!(monitor.validate().is_ok());
    }

    #[test]
    fn monitor_validation_ties_strategy_to_data() {
        let mut monitor = ServiceMonitor::new(
            "web".to_string(),
            ProbeKind::Tcp,
            "example.com:443".to_string(),
            30,
        );
        monitor.strategy = ProbeStrategy::Include;
        assert!(monitor.validate().is_err());

        monitor.strategy_data = Some(format!("[\"{}\"]", Uuid::new_v4()));
        assert!(monitor.validate().is_ok());

        monitor.strategy = ProbeStrategy::Server;
        assert!(monitor.validate().is_err());
    }

    #[test]
    fn traffic_delta_saturates() {
        let mut state = sample_state(Uuid::new_v4());
        state.delta_sent = u64::MAX;
        state.delta_recv = 10;
        assert_eq!(state.traffic_delta(), u64::MAX);
    }

    #[test]
    fn probe_kind_round_trips_through_str() {
        for kind in [ProbeKind::Http, ProbeKind::Tcp, ProbeKind::Icmp] {
            assert_eq!(kind.as_str().parse::<ProbeKind>().unwrap(), kind);
        }
        assert!("gopher".parse::<ProbeKind>().is_err());
    }

    pub(crate) fn sample_state(host_id: Uuid) -> HostState {
        HostState {
            host_id,
            timestamp: Utc::now(),
            cpu_percent: 10.0,
            load1: 0.5,
            load5: 0.4,
            load15: 0.3,
            mem_used: 1024,
            mem_used_percent: 25.0,
            swap_used: 0,
            disk_used: 2048,
            disk_used_percent: 40.0,
            net_rx_transfer: 100,
            net_tx_transfer: 200,
            net_rx_speed: 10,
            net_tx_speed: 20,
            tcp_connections: 5,
            udp_connections: 2,
            process_count: 80,
            uptime_seconds: 3600,
            gpu_percent: 0.0,
            traffic_sent: 200,
            traffic_recv: 100,
            delta_sent: 50,
            delta_recv: 25,
            temperatures: None,
        }
    }
}
