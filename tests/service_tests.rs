//! Service layer: host management and monitor management facades

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use fleetwatch::audit::AuditLogger;
use fleetwatch::config::{AgentConfig, AuditConfig, ProbeConfig, SentinelConfig, SessionConfig};
use fleetwatch::error::AppError;
use fleetwatch::model::{ProbeKind, ProbeResult, ServiceMonitor};
use fleetwatch::probe::{ProbeExecutor, ProbeScheduler};
use fleetwatch::repository::memory::MemoryAuditRepository;
use fleetwatch::repository::{AuditEventRepository, ServiceRepository};
use fleetwatch::sentinel::ServiceSentinel;
use fleetwatch::service::{HostService, ServiceProbeService};
use fleetwatch::session::{DockerStreamManager, TerminalManager};
use tokio_util::sync::CancellationToken;

use common::build_core;

struct ServiceHarness {
    core: common::TestCore,
    host_service: Arc<HostService>,
    probe_service: Arc<ServiceProbeService>,
    scheduler: Arc<ProbeScheduler>,
    audit_repo: Arc<MemoryAuditRepository>,
    cancel: CancellationToken,
}

fn harness() -> ServiceHarness {
    let core = build_core(AgentConfig::default());
    let cancel = CancellationToken::new();

    let audit_repo = Arc::new(MemoryAuditRepository::new());
    let audit = AuditLogger::new(
        audit_repo.clone(),
        AuditConfig {
            buffer_capacity: 64,
            batch_size: 1,
            flush_interval_secs: 1,
        },
        cancel.clone(),
    );

    let terminals = TerminalManager::new(SessionConfig::default());
    let docker = DockerStreamManager::new(
        core.registry.clone(),
        core.hosts.clone(),
        SessionConfig::default(),
    );
    let host_service = HostService::new(
        core.hosts.clone(),
        core.registry.clone(),
        core.collector.clone(),
        terminals.clone(),
        docker,
        audit.clone(),
        "https://fleet.example.com".to_string(),
    );

    let sentinel = ServiceSentinel::new(
        core.services.clone(),
        core.alerts.clone(),
        SentinelConfig::default(),
    );
    let executor = ProbeExecutor::new(ProbeConfig::default()).unwrap();
    let scheduler = ProbeScheduler::new(
        core.registry.clone(),
        core.hosts.clone(),
        core.services.clone(),
        sentinel.clone(),
        core.alerts.clone(),
        executor,
    );
    let probe_service = ServiceProbeService::new(
        core.services.clone(),
        scheduler.clone(),
        sentinel,
        audit,
    );

    ServiceHarness {
        core,
        host_service,
        probe_service,
        scheduler,
        audit_repo,
        cancel,
    }
}

#[tokio::test]
async fn host_crud_round_trip() {
    let h = harness();

    let host = h
        .host_service
        .create_host("web-1", vec!["prod".to_string()], None)
        .await
        .unwrap();

    let details = h.host_service.get_host(host.id).await.unwrap();
    assert_eq!(details.node.name, "web-1");
    assert!(!details.online);

    let listed = h.host_service.list_hosts(Some("prod")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(h.host_service.list_hosts(Some("staging")).await.unwrap().is_empty());

    h.host_service.delete_host(host.id).await.unwrap();
    let err = h.host_service.get_host(host.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));

    h.cancel.cancel();
}

#[tokio::test]
async fn install_command_carries_identity_and_secret() {
    let h = harness();
    let host = h.host_service.create_host("web-1", vec![], None).await.unwrap();

    let command = h
        .host_service
        .get_agent_install_command(host.id)
        .await
        .unwrap();
    assert!(command.contains("https://fleet.example.com"));
    assert!(command.contains(&host.id.to_string()));
    assert!(command.contains(&host.secret_key));
    h.cancel.cancel();
}

#[tokio::test]
async fn secret_regeneration_rotates_and_update_preserves() {
    let h = harness();
    let host = h.host_service.create_host("web-1", vec![], None).await.unwrap();
    let original = host.secret_key.clone();

    // plain updates cannot change the secret
    let mut tampered = host.clone();
    tampered.secret_key = "attacker".to_string();
    tampered.name = "renamed".to_string();
    h.host_service.update_host(tampered).await.unwrap();
    let details = h.host_service.get_host(host.id).await.unwrap();
    assert_eq!(details.node.name, "renamed");
    assert_eq!(details.node.secret_key, original);

    let rotated = h.host_service.regenerate_secret_key(host.id).await.unwrap();
    assert_ne!(rotated, original);
    let details = h.host_service.get_host(host.id).await.unwrap();
    assert_eq!(details.node.secret_key, rotated);
    h.cancel.cancel();
}

#[tokio::test]
async fn host_mutations_are_audited() {
    let h = harness();
    let host = h.host_service.create_host("web-1", vec![], None).await.unwrap();
    h.host_service.delete_host(host.id).await.unwrap();

    // the audit worker flushes on its interval
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let events = h.audit_repo.list_events(Some("host")).await.unwrap();
    let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"create"));
    assert!(actions.contains(&"delete"));
    assert!(events
        .iter()
        .all(|e| e.resource_id.as_deref() == Some(host.id.to_string().as_str())));
    h.cancel.cancel();
}

#[tokio::test]
async fn monitor_crud_synchronizes_the_schedule() {
    let h = harness();
    let mut monitor = ServiceMonitor::new(
        "api".to_string(),
        ProbeKind::Http,
        "http://api.example.com".to_string(),
        3600,
    );

    monitor = h.probe_service.create_monitor(monitor).await.unwrap();
    assert!(h.scheduler.get_task_status(monitor.id).is_some());

    monitor.interval_seconds = 7200;
    let updated = h.probe_service.update_monitor(monitor.clone()).await.unwrap();
    assert_eq!(
        h.scheduler.get_task_status(updated.id).unwrap().expression,
        "0 0 */2 * * *"
    );

    h.probe_service.delete_monitor(updated.id).await.unwrap();
    assert!(h.scheduler.get_task_status(updated.id).is_none());
    let err = h.probe_service.get_monitor(updated.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
    h.cancel.cancel();
}

#[tokio::test]
async fn invalid_monitor_is_rejected() {
    let h = harness();
    let monitor = ServiceMonitor::new(
        "bad".to_string(),
        ProbeKind::Http,
        "http://x".to_string(),
        0,
    );
    let err = h.probe_service.create_monitor(monitor).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }));
    h.cancel.cancel();
}

#[tokio::test]
async fn availability_stats_over_named_periods() {
    let h = harness();
    let monitor = h
        .probe_service
        .create_monitor(ServiceMonitor::new(
            "api".to_string(),
            ProbeKind::Http,
            "http://api".to_string(),
            3600,
        ))
        .await
        .unwrap();

    for (minutes_ago, success, latency) in [(10i64, true, 20.0), (20, true, 40.0), (30, false, 0.0)]
    {
        h.core
            .services
            .insert_probe_result(ProbeResult {
                monitor_id: monitor.id,
                timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
                success,
                latency_ms: latency,
                http_status: Some(if success { 200 } else { 500 }),
                response_body: None,
                error_message: None,
                executor: None,
            })
            .await
            .unwrap();
    }

    let stats = h
        .probe_service
        .get_availability_stats(monitor.id, "1h")
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.up, 2);
    assert_eq!(stats.down, 1);
    assert!((stats.uptime_percent - 66.666).abs() < 0.01);
    assert!((stats.avg_latency_ms - 30.0).abs() < 1e-9);

    let err = h
        .probe_service
        .get_availability_stats(monitor.id, "2h")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }));
    h.cancel.cancel();
}

#[tokio::test]
async fn monitor_details_include_latest_result() {
    let h = harness();
    let monitor = h
        .probe_service
        .create_monitor(ServiceMonitor::new(
            "api".to_string(),
            ProbeKind::Tcp,
            "api:443".to_string(),
            3600,
        ))
        .await
        .unwrap();

    let details = h.probe_service.get_monitor(monitor.id).await.unwrap();
    assert!(details.latest_result.is_none());

    h.core
        .services
        .insert_probe_result(ProbeResult {
            monitor_id: monitor.id,
            timestamp: Utc::now(),
            success: true,
            latency_ms: 5.0,
            http_status: None,
            response_body: None,
            error_message: None,
            executor: None,
        })
        .await
        .unwrap();

    let details = h.probe_service.get_monitor(monitor.id).await.unwrap();
    assert!(details.latest_result.unwrap().success);
    h.cancel.cancel();
}

#[tokio::test]
async fn network_topology_builds_host_monitor_edges() {
    let h = harness();
    let monitor_id = Uuid::new_v4();
    let agent = Uuid::new_v4();

    for (executor, success, latency) in [
        (None, true, 10.0),
        (None, true, 30.0),
        (Some(agent), true, 50.0),
        (Some(agent), false, 0.0),
    ] {
        h.core
            .services
            .insert_probe_result(ProbeResult {
                monitor_id,
                timestamp: Utc::now() - ChronoDuration::minutes(5),
                success,
                latency_ms: latency,
                http_status: None,
                response_body: None,
                error_message: None,
                executor,
            })
            .await
            .unwrap();
    }

    let edges = h.probe_service.get_network_topology(24).await.unwrap();
    assert_eq!(edges.len(), 2);

    let server_edge = edges.iter().find(|e| e.host_id.is_none()).unwrap();
    assert_eq!(server_edge.samples, 2);
    assert!((server_edge.avg_latency_ms - 20.0).abs() < 1e-9);
    assert!((server_edge.min_latency_ms - 10.0).abs() < 1e-9);
    assert!((server_edge.max_latency_ms - 30.0).abs() < 1e-9);
    assert!((server_edge.loss_percent - 0.0).abs() < 1e-9);

    let agent_edge = edges.iter().find(|e| e.host_id == Some(agent)).unwrap();
    assert_eq!(agent_edge.samples, 2);
    assert!((agent_edge.success_rate - 0.5).abs() < 1e-9);
    assert!((agent_edge.loss_percent - 50.0).abs() < 1e-9);
    h.cancel.cancel();
}

#[tokio::test]
async fn host_probe_history_groups_by_monitor() {
    let h = harness();
    let agent = Uuid::new_v4();
    let monitor_a = Uuid::new_v4();
    let monitor_b = Uuid::new_v4();

    for monitor_id in [monitor_a, monitor_a, monitor_b] {
        h.core
            .services
            .insert_probe_result(ProbeResult {
                monitor_id,
                timestamp: Utc::now(),
                success: true,
                latency_ms: 1.0,
                http_status: None,
                response_body: None,
                error_message: None,
                executor: Some(agent),
            })
            .await
            .unwrap();
    }

    let grouped = h
        .probe_service
        .get_host_probe_history(agent, Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(grouped.len(), 2);
    assert_eq!(grouped.get(&monitor_a).unwrap().len(), 2);
    assert_eq!(grouped.get(&monitor_b).unwrap().len(), 1);
    h.cancel.cancel();
}
