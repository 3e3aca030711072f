//! Agent lifecycle: registration, state streaming, traffic accounting,
//! heartbeat expiry and batched probe reports

mod common;

use std::time::Duration;
use uuid::Uuid;

use fleetwatch::config::AgentConfig;
use fleetwatch::model::ConnectionStatus;
use fleetwatch::repository::{HostRepository, ServiceRepository};
use fleetwatch::transport::duplex::pair;
use fleetwatch::transport::{
    AgentTask, ProbeReportEntry, ProbeReportPayload, RegisterRequest, StateAck, StateFrame,
    TaskType,
};
use tokio_util::sync::CancellationToken;

use common::{build_core, host_info, host_state, seed_host};

#[tokio::test]
async fn register_validates_pairing_secret() {
    let core = build_core(AgentConfig::default());
    let host = seed_host(&core.hosts, "web-1", "good-secret").await;

    let rejected = core
        .manager
        .register(RegisterRequest {
            uuid: host.id,
            secret: "wrong".to_string(),
            info: host_info(host.id, "1.0.0"),
        })
        .await;
    assert!(!rejected.success);
    assert_eq!(rejected.message, "Invalid credentials");

    let unknown = core
        .manager
        .register(RegisterRequest {
            uuid: Uuid::new_v4(),
            secret: "good-secret".to_string(),
            info: host_info(host.id, "1.0.0"),
        })
        .await;
    assert!(!unknown.success);
    assert_eq!(unknown.message, "Invalid credentials");

    let accepted = core
        .manager
        .register(RegisterRequest {
            uuid: host.id,
            secret: "good-secret".to_string(),
            info: host_info(host.id, "1.0.0"),
        })
        .await;
    assert!(accepted.success);
}

#[tokio::test]
async fn repeated_register_updates_a_single_connection_record() {
    let core = build_core(AgentConfig::default());
    let host = seed_host(&core.hosts, "web-1", "s").await;

    for version in ["1.0.0", "1.0.1"] {
        let response = core
            .manager
            .register(RegisterRequest {
                uuid: host.id,
                secret: "s".to_string(),
                info: host_info(host.id, version),
            })
            .await;
        assert!(response.success);
    }

    let record = core
        .hosts
        .get_connection_by_host(host.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.agent_version, "1.0.1");

    let info = core.hosts.get_host_info(host.id).await.unwrap().unwrap();
    assert_eq!(info.agent_version, "1.0.1");
}

#[tokio::test]
async fn state_stream_ingests_samples_and_accumulates_traffic() {
    let core = build_core(AgentConfig::default());
    let host = seed_host(&core.hosts, "web-1", "s").await;

    let (server_end, mut agent) = pair::<StateFrame, StateAck>(16);
    let manager = core.manager.clone();
    let stream_task = tokio::spawn(async move { manager.report_state(server_end).await });

    agent
        .send(StateFrame {
            uuid: Some(host.id),
            state: None,
        })
        .await
        .unwrap();
    let ack = agent.recv().await.unwrap();
    assert!(ack.success);
    assert!(core.registry.is_online(host.id));

    for cpu in [10.0, 20.0, 30.0] {
        agent
            .send(StateFrame {
                uuid: None,
                state: Some(host_state(cpu, 50, 25)),
            })
            .await
            .unwrap();
        let ack = agent.recv().await.unwrap();
        assert!(ack.success);
    }

    // latest-state cache reflects the last sample
    assert_eq!(
        core.collector.latest_state(host.id).unwrap().cpu_percent,
        30.0
    );

    // all samples persisted
    let start = chrono::Utc::now() - chrono::Duration::minutes(5);
    let end = chrono::Utc::now() + chrono::Duration::minutes(5);
    let history = core.hosts.list_states(host.id, start, end).await.unwrap();
    assert_eq!(history.len(), 3);

    // traffic accumulated by exactly the sum of deltas
    let node = core.hosts.get_host(host.id).await.unwrap().unwrap();
    assert_eq!(node.traffic_used, 3 * 75);

    // agent hangs up: the manager unregisters with the standard reason
    agent.close();
    stream_task.await.unwrap();
    assert!(!core.registry.is_online(host.id));
    let record = core
        .hosts
        .get_connection_by_host(host.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ConnectionStatus::Offline);
    assert_eq!(record.disconnect_reason.as_deref(), Some("Connection lost"));
}

#[tokio::test]
async fn acks_piggyback_queued_tasks() {
    let core = build_core(AgentConfig::default());
    let host = seed_host(&core.hosts, "web-1", "s").await;

    let (server_end, mut agent) = pair::<StateFrame, StateAck>(16);
    let manager = core.manager.clone();
    tokio::spawn(async move { manager.report_state(server_end).await });

    agent
        .send(StateFrame {
            uuid: Some(host.id),
            state: None,
        })
        .await
        .unwrap();
    assert!(agent.recv().await.unwrap().tasks.is_empty());

    core.registry
        .queue_task(
            host.id,
            AgentTask::new(TaskType::Probe).with_param("target", "http://x"),
        )
        .unwrap();

    agent
        .send(StateFrame {
            uuid: None,
            state: Some(host_state(5.0, 0, 0)),
        })
        .await
        .unwrap();
    let ack = agent.recv().await.unwrap();
    assert_eq!(ack.tasks.len(), 1);
    assert_eq!(ack.tasks[0].task_type, TaskType::Probe);

    // queue drained: the next ack is empty again
    agent
        .send(StateFrame {
            uuid: None,
            state: Some(host_state(6.0, 0, 0)),
        })
        .await
        .unwrap();
    assert!(agent.recv().await.unwrap().tasks.is_empty());
}

#[tokio::test]
async fn first_frame_without_uuid_is_rejected() {
    let core = build_core(AgentConfig::default());

    let (server_end, mut agent) = pair::<StateFrame, StateAck>(4);
    let manager = core.manager.clone();
    let task = tokio::spawn(async move { manager.report_state(server_end).await });

    agent
        .send(StateFrame {
            uuid: None,
            state: Some(host_state(1.0, 0, 0)),
        })
        .await
        .unwrap();
    let ack = agent.recv().await.unwrap();
    assert!(!ack.success);
    task.await.unwrap();
}

#[tokio::test]
async fn watchdog_unregisters_silent_agents() {
    let config = AgentConfig {
        heartbeat_interval_secs: 1,
        heartbeat_timeout_secs: 2,
        task_queue_capacity: 100,
    };
    let core = build_core(config);
    let host = seed_host(&core.hosts, "web-1", "s").await;

    core.registry.register(host.id, "1.0.0").await;
    assert!(core.registry.is_online(host.id));

    // no touches: the watchdog must expire the agent within
    // timeout + one interval
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    while core.registry.is_online(host.id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "watchdog did not fire in time"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let record = core
        .hosts
        .get_connection_by_host(host.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ConnectionStatus::Offline);
    assert_eq!(record.disconnect_reason.as_deref(), Some("Connection lost"));
}

#[tokio::test]
async fn heartbeat_refreshes_liveness() {
    let core = build_core(AgentConfig::default());
    let host = seed_host(&core.hosts, "web-1", "s").await;

    let missing = core.manager.heartbeat(host.id).await;
    assert!(!missing.success);

    core.registry.register(host.id, "1.0.0").await;
    let response = core.manager.heartbeat(host.id).await;
    assert!(response.success);
}

#[tokio::test]
async fn probe_report_batch_skips_bad_rows() {
    let core = build_core(AgentConfig::default());
    let host = seed_host(&core.hosts, "web-1", "s").await;
    let monitor_id = Uuid::new_v4();

    let cancel = CancellationToken::new();
    core.sentinel.start(cancel.clone());

    let payload = ProbeReportPayload {
        success: true,
        latency_ms: 12.5,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        error_message: None,
        http_response_body: None,
    };
    let entries = vec![
        ProbeReportEntry {
            service_monitor_id: monitor_id.to_string(),
            result: Some(payload.clone()),
        },
        ProbeReportEntry {
            service_monitor_id: String::new(),
            result: Some(payload.clone()),
        },
        ProbeReportEntry {
            service_monitor_id: monitor_id.to_string(),
            result: Some(payload.clone()),
        },
    ];

    let response = core.manager.report_probe_results(host.id, entries).await;
    assert!(response.success);
    assert_eq!(response.processed, 2);
    assert_eq!(response.failed, 1);

    // exactly the two valid reports reach the sentinel
    tokio::time::sleep(Duration::from_millis(200)).await;
    core.sentinel.flush_all().await;
    let stats = core.sentinel.copy_stats();
    let monitor_stats = stats.get(&monitor_id).expect("monitor stats present");
    assert_eq!(monitor_stats.today_up, 2);

    // nil payload rows are counted as failed too
    let response = core
        .manager
        .report_probe_results(
            host.id,
            vec![ProbeReportEntry {
                service_monitor_id: monitor_id.to_string(),
                result: None,
            }],
        )
        .await;
    assert_eq!(response.processed, 0);
    assert_eq!(response.failed, 1);

    let history = core
        .services
        .list_history_since(chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].up, 2);
    assert_eq!(history[0].executor, Some(host.id));

    cancel.cancel();
}
