//! Repository contracts for durable storage
//!
//! The core never talks to a database directly; everything durable is
//! behind these traits. The relational implementations live with the
//! persistence layer; `memory` provides DashMap-backed implementations
//! used by tests and the default wiring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::{
    AgentConnectionRecord, AuditEvent, HostInfo, HostNode, HostState, ProbeResult, ServiceHistory,
    ServiceMonitor,
};

pub mod memory;

/// Durable storage for host metadata, connection records and state samples
#[async_trait]
pub trait HostRepository: Send + Sync {
    async fn create_host(&self, host: HostNode) -> AppResult<()>;
    async fn get_host(&self, id: Uuid) -> AppResult<Option<HostNode>>;
    async fn list_hosts(&self) -> AppResult<Vec<HostNode>>;
    async fn update_host(&self, host: HostNode) -> AppResult<()>;
    /// Soft delete; the host stays queryable by id for history purposes
    async fn soft_delete_host(&self, id: Uuid) -> AppResult<()>;
    async fn update_last_active(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()>;
    /// Atomic column increment of `traffic_used`; no read-modify-write
    async fn increment_traffic(&self, id: Uuid, delta: u64) -> AppResult<()>;
    async fn list_host_ids_in_group(&self, group: &str) -> AppResult<Vec<Uuid>>;
    /// Hosts with a non-null expiry date, soft-deleted excluded
    async fn list_hosts_with_expiry(&self) -> AppResult<Vec<HostNode>>;

    async fn upsert_host_info(&self, info: HostInfo) -> AppResult<()>;
    async fn get_host_info(&self, host_id: Uuid) -> AppResult<Option<HostInfo>>;

    /// Create-or-update keyed by host; at most one record per host
    async fn mark_connection_online(&self, host_id: Uuid, agent_version: &str) -> AppResult<()>;
    async fn mark_connection_offline(&self, host_id: Uuid, reason: &str) -> AppResult<()>;
    async fn touch_connection_heartbeat(&self, host_id: Uuid, at: DateTime<Utc>) -> AppResult<()>;
    async fn get_connection_by_host(&self, host_id: Uuid)
        -> AppResult<Option<AgentConnectionRecord>>;
    /// Lookup by the connection record's own UUID (docker session requests)
    async fn get_connection(&self, id: Uuid) -> AppResult<Option<AgentConnectionRecord>>;

    async fn insert_state(&self, state: HostState) -> AppResult<()>;
    async fn list_states(
        &self,
        host_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<HostState>>;
}

/// Durable storage for monitors, probe outcomes and rolled-up history
#[async_trait]
pub trait ServiceRepository: Send + Sync {
    async fn create_monitor(&self, monitor: ServiceMonitor) -> AppResult<()>;
    async fn update_monitor(&self, monitor: ServiceMonitor) -> AppResult<()>;
    async fn delete_monitor(&self, id: Uuid) -> AppResult<()>;
    async fn get_monitor(&self, id: Uuid) -> AppResult<Option<ServiceMonitor>>;
    async fn list_monitors(&self) -> AppResult<Vec<ServiceMonitor>>;
    async fn list_enabled_monitors(&self) -> AppResult<Vec<ServiceMonitor>>;

    async fn insert_probe_result(&self, result: ProbeResult) -> AppResult<()>;
    async fn list_probe_results(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<ProbeResult>>;
    /// All probe results since the cutoff, across monitors and executors
    async fn list_probe_results_since(&self, since: DateTime<Utc>) -> AppResult<Vec<ProbeResult>>;
    async fn latest_probe_result(&self, monitor_id: Uuid) -> AppResult<Option<ProbeResult>>;

    async fn insert_history_batch(&self, rows: Vec<ServiceHistory>) -> AppResult<()>;
    async fn list_history_since(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<ServiceHistory>>;
}

/// Durable sink for audit events
#[async_trait]
pub trait AuditEventRepository: Send + Sync {
    async fn insert_events(&self, events: Vec<AuditEvent>) -> AppResult<()>;
    async fn list_events(&self, subsystem: Option<&str>) -> AppResult<Vec<AuditEvent>>;
}
