//! In-memory repository implementations
//!
//! DashMap-backed implementations of the repository traits. They honor the
//! same contracts as the relational layer, including the atomic traffic
//! increment, and back every test in the crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{
    AgentConnectionRecord, AuditEvent, ConnectionStatus, HostInfo, HostNode, HostState,
    ProbeResult, ServiceHistory, ServiceMonitor,
};

use super::{AuditEventRepository, HostRepository, ServiceRepository};

/// In-memory host storage
#[derive(Default)]
pub struct MemoryHostRepository {
    hosts: DashMap<Uuid, HostNode>,
    infos: DashMap<Uuid, HostInfo>,
    connections: DashMap<Uuid, AgentConnectionRecord>,
    states: RwLock<Vec<HostState>>,
}

impl MemoryHostRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostRepository for MemoryHostRepository {
    async fn create_host(&self, host: HostNode) -> AppResult<()> {
        self.hosts.insert(host.id, host);
        Ok(())
    }

    async fn get_host(&self, id: Uuid) -> AppResult<Option<HostNode>> {
        Ok(self.hosts.get(&id).map(|h| h.clone()))
    }

    async fn list_hosts(&self) -> AppResult<Vec<HostNode>> {
        Ok(self
            .hosts
            .iter()
            .filter(|h| !h.deleted)
            .map(|h| h.clone())
            .collect())
    }

    async fn update_host(&self, host: HostNode) -> AppResult<()> {
        if !self.hosts.contains_key(&host.id) {
            return Err(AppError::not_found(format!("host {}", host.id)));
        }
        self.hosts.insert(host.id, host);
        Ok(())
    }

    async fn soft_delete_host(&self, id: Uuid) -> AppResult<()> {
        match self.hosts.get_mut(&id) {
            Some(mut host) => {
                host.deleted = true;
                Ok(())
            }
            None => Err(AppError::not_found(format!("host {id}"))),
        }
    }

    async fn update_last_active(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(mut host) = self.hosts.get_mut(&id) {
            host.last_active = Some(at);
        }
        Ok(())
    }

    async fn increment_traffic(&self, id: Uuid, delta: u64) -> AppResult<()> {
        match self.hosts.get_mut(&id) {
            Some(mut host) => {
                host.traffic_used = host.traffic_used.saturating_add(delta);
                Ok(())
            }
            None => Err(AppError::not_found(format!("host {id}"))),
        }
    }

    async fn list_host_ids_in_group(&self, group: &str) -> AppResult<Vec<Uuid>> {
        Ok(self
            .hosts
            .iter()
            .filter(|h| !h.deleted && h.groups.iter().any(|g| g == group))
            .map(|h| h.id)
            .collect())
    }

    async fn list_hosts_with_expiry(&self) -> AppResult<Vec<HostNode>> {
        Ok(self
            .hosts
            .iter()
            .filter(|h| !h.deleted && h.expires_at.is_some())
            .map(|h| h.clone())
            .collect())
    }

    async fn upsert_host_info(&self, info: HostInfo) -> AppResult<()> {
        self.infos.insert(info.host_id, info);
        Ok(())
    }

    async fn get_host_info(&self, host_id: Uuid) -> AppResult<Option<HostInfo>> {
        Ok(self.infos.get(&host_id).map(|i| i.clone()))
    }

    async fn mark_connection_online(&self, host_id: Uuid, agent_version: &str) -> AppResult<()> {
        let mut record = self
            .connections
            .get(&host_id)
            .map(|r| r.clone())
            .unwrap_or_else(|| AgentConnectionRecord::new(host_id));
        record.status = ConnectionStatus::Online;
        record.connected_at = Some(Utc::now());
        record.last_heartbeat = Some(Utc::now());
        record.disconnect_reason = None;
        if !agent_version.is_empty() {
            record.agent_version = agent_version.to_string();
        }
        self.connections.insert(host_id, record);
        Ok(())
    }

    async fn mark_connection_offline(&self, host_id: Uuid, reason: &str) -> AppResult<()> {
        if let Some(mut record) = self.connections.get_mut(&host_id) {
            record.status = ConnectionStatus::Offline;
            record.disconnected_at = Some(Utc::now());
            record.disconnect_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn touch_connection_heartbeat(&self, host_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(mut record) = self.connections.get_mut(&host_id) {
            record.last_heartbeat = Some(at);
        }
        Ok(())
    }

    async fn get_connection_by_host(
        &self,
        host_id: Uuid,
    ) -> AppResult<Option<AgentConnectionRecord>> {
        Ok(self.connections.get(&host_id).map(|r| r.clone()))
    }

    async fn get_connection(&self, id: Uuid) -> AppResult<Option<AgentConnectionRecord>> {
        Ok(self
            .connections
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.clone()))
    }

    async fn insert_state(&self, state: HostState) -> AppResult<()> {
        self.states.write().push(state);
        Ok(())
    }

    async fn list_states(
        &self,
        host_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<HostState>> {
        Ok(self
            .states
            .read()
            .iter()
            .filter(|s| s.host_id == host_id && s.timestamp >= start && s.timestamp < end)
            .cloned()
            .collect())
    }
}

/// In-memory monitor and probe-history storage
#[derive(Default)]
pub struct MemoryServiceRepository {
    monitors: DashMap<Uuid, ServiceMonitor>,
    results: RwLock<Vec<ProbeResult>>,
    history: RwLock<Vec<ServiceHistory>>,
}

impl MemoryServiceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRepository for MemoryServiceRepository {
    async fn create_monitor(&self, monitor: ServiceMonitor) -> AppResult<()> {
        self.monitors.insert(monitor.id, monitor);
        Ok(())
    }

    async fn update_monitor(&self, monitor: ServiceMonitor) -> AppResult<()> {
        if !self.monitors.contains_key(&monitor.id) {
            return Err(AppError::not_found(format!("monitor {}", monitor.id)));
        }
        self.monitors.insert(monitor.id, monitor);
        Ok(())
    }

    async fn delete_monitor(&self, id: Uuid) -> AppResult<()> {
        self.monitors
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::not_found(format!("monitor {id}")))
    }

    async fn get_monitor(&self, id: Uuid) -> AppResult<Option<ServiceMonitor>> {
        Ok(self.monitors.get(&id).map(|m| m.clone()))
    }

    async fn list_monitors(&self) -> AppResult<Vec<ServiceMonitor>> {
        Ok(self.monitors.iter().map(|m| m.clone()).collect())
    }

    async fn list_enabled_monitors(&self) -> AppResult<Vec<ServiceMonitor>> {
        Ok(self
            .monitors
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.clone())
            .collect())
    }

    async fn insert_probe_result(&self, result: ProbeResult) -> AppResult<()> {
        self.results.write().push(result);
        Ok(())
    }

    async fn list_probe_results(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<ProbeResult>> {
        Ok(self
            .results
            .read()
            .iter()
            .filter(|r| r.monitor_id == monitor_id && r.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn list_probe_results_since(&self, since: DateTime<Utc>) -> AppResult<Vec<ProbeResult>> {
        Ok(self
            .results
            .read()
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn latest_probe_result(&self, monitor_id: Uuid) -> AppResult<Option<ProbeResult>> {
        Ok(self
            .results
            .read()
            .iter()
            .filter(|r| r.monitor_id == monitor_id)
            .max_by_key(|r| r.timestamp)
            .cloned())
    }

    async fn insert_history_batch(&self, rows: Vec<ServiceHistory>) -> AppResult<()> {
        self.history.write().extend(rows);
        Ok(())
    }

    async fn list_history_since(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<ServiceHistory>> {
        Ok(self
            .history
            .read()
            .iter()
            .filter(|h| h.created_at >= cutoff)
            .cloned()
            .collect())
    }
}

/// In-memory audit sink
#[derive(Default)]
pub struct MemoryAuditRepository {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditEventRepository for MemoryAuditRepository {
    async fn insert_events(&self, events: Vec<AuditEvent>) -> AppResult<()> {
        self.events.write().extend(events);
        Ok(())
    }

    async fn list_events(&self, subsystem: Option<&str>) -> AppResult<Vec<AuditEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| subsystem.map(|s| e.subsystem == s).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeKind;

    #[tokio::test]
    async fn traffic_increment_accumulates() {
        let repo = MemoryHostRepository::new();
        let host = HostNode::new("web-1".to_string(), "secret".to_string());
        let id = host.id;
        repo.create_host(host).await.unwrap();

        repo.increment_traffic(id, 100).await.unwrap();
        repo.increment_traffic(id, 50).await.unwrap();

        let host = repo.get_host(id).await.unwrap().unwrap();
        assert_eq!(host.traffic_used, 150);
    }

    #[tokio::test]
    async fn connection_record_is_single_per_host() {
        let repo = MemoryHostRepository::new();
        let host_id = Uuid::new_v4();

        repo.mark_connection_online(host_id, "1.0.0").await.unwrap();
        let first = repo.get_connection_by_host(host_id).await.unwrap().unwrap();

        repo.mark_connection_online(host_id, "1.0.1").await.unwrap();
        let second = repo.get_connection_by_host(host_id).await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.agent_version, "1.0.1");
        assert_eq!(second.status, ConnectionStatus::Online);
    }

    #[tokio::test]
    async fn offline_records_reason() {
        let repo = MemoryHostRepository::new();
        let host_id = Uuid::new_v4();
        repo.mark_connection_online(host_id, "1.0.0").await.unwrap();
        repo.mark_connection_offline(host_id, "Connection lost")
            .await
            .unwrap();

        let record = repo.get_connection_by_host(host_id).await.unwrap().unwrap();
        assert_eq!(record.status, ConnectionStatus::Offline);
        assert_eq!(record.disconnect_reason.as_deref(), Some("Connection lost"));
    }

    #[tokio::test]
    async fn latest_probe_result_picks_newest() {
        let repo = MemoryServiceRepository::new();
        let monitor = ServiceMonitor::new(
            "api".to_string(),
            ProbeKind::Http,
            "http://api".to_string(),
            5,
        );
        let id = monitor.id;
        repo.create_monitor(monitor).await.unwrap();

        for (offset, success) in [(60i64, false), (5, true)] {
            repo.insert_probe_result(ProbeResult {
                monitor_id: id,
                timestamp: Utc::now() - chrono::Duration::seconds(offset),
                success,
                latency_ms: 12.0,
                http_status: Some(200),
                response_body: None,
                error_message: None,
                executor: None,
            })
            .await
            .unwrap();
        }

        let latest = repo.latest_probe_result(id).await.unwrap().unwrap();
        assert!(latest.success);
    }
}
