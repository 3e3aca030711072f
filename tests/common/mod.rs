//! Shared fixtures for integration tests
#![allow(dead_code)]

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use fleetwatch::agent::{AgentManager, ClientRegistry};
use fleetwatch::alert::LogAlertEngine;
use fleetwatch::config::{AgentConfig, CollectorConfig, SentinelConfig};
use fleetwatch::model::{HostInfo, HostNode, HostState};
use fleetwatch::repository::memory::{MemoryHostRepository, MemoryServiceRepository};
use fleetwatch::repository::HostRepository;
use fleetwatch::sentinel::ServiceSentinel;
use fleetwatch::state::StateCollector;

/// Fully wired agent-side core over in-memory repositories
pub struct TestCore {
    pub hosts: Arc<MemoryHostRepository>,
    pub services: Arc<MemoryServiceRepository>,
    pub alerts: Arc<LogAlertEngine>,
    pub registry: Arc<ClientRegistry>,
    pub collector: Arc<StateCollector>,
    pub sentinel: Arc<ServiceSentinel>,
    pub manager: Arc<AgentManager>,
}

pub fn build_core(agent_config: AgentConfig) -> TestCore {
    let hosts = Arc::new(MemoryHostRepository::new());
    let services = Arc::new(MemoryServiceRepository::new());
    let alerts = Arc::new(LogAlertEngine::new());

    let registry = ClientRegistry::new(hosts.clone(), agent_config);
    let collector = StateCollector::new(hosts.clone(), CollectorConfig::default());
    collector.set_registry(registry.clone());
    let sentinel = ServiceSentinel::new(
        services.clone(),
        alerts.clone(),
        SentinelConfig::default(),
    );
    let manager = AgentManager::new(
        registry.clone(),
        hosts.clone(),
        collector.clone(),
        sentinel.clone(),
    );

    TestCore {
        hosts,
        services,
        alerts,
        registry,
        collector,
        sentinel,
        manager,
    }
}

pub async fn seed_host(hosts: &MemoryHostRepository, name: &str, secret: &str) -> HostNode {
    let host = HostNode::new(name.to_string(), secret.to_string());
    hosts.create_host(host.clone()).await.unwrap();
    host
}

pub fn host_state(cpu: f64, delta_sent: u64, delta_recv: u64) -> HostState {
    HostState {
        host_id: Uuid::nil(),
        timestamp: Utc::now(),
        cpu_percent: cpu,
        load1: 0.4,
        load5: 0.3,
        load15: 0.2,
        mem_used: 2048,
        mem_used_percent: 35.0,
        swap_used: 0,
        disk_used: 4096,
        disk_used_percent: 55.0,
        net_rx_transfer: 1000,
        net_tx_transfer: 2000,
        net_rx_speed: 100,
        net_tx_speed: 200,
        tcp_connections: 12,
        udp_connections: 3,
        process_count: 120,
        uptime_seconds: 7200,
        gpu_percent: 0.0,
        traffic_sent: 2000,
        traffic_recv: 1000,
        delta_sent,
        delta_recv,
        temperatures: None,
    }
}

pub fn host_info(host_id: Uuid, version: &str) -> HostInfo {
    HostInfo {
        host_id,
        platform: "linux".to_string(),
        platform_version: "6.8".to_string(),
        cpu_model: "EPYC 7543".to_string(),
        cpu_cores: 32,
        mem_total: 64 * 1024 * 1024 * 1024,
        swap_total: 0,
        disk_total: 1024 * 1024 * 1024 * 1024,
        agent_version: version.to_string(),
        boot_time: Some(Utc::now()),
        ssh_port: Some(22),
    }
}
