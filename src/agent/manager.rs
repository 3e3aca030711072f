//! Agent manager: the agent-facing RPC surface
//!
//! Owns the four logical RPCs of the agent transport: register, the
//! bidirectional state-report stream, out-of-band heartbeat, and batched
//! probe result reports. Outbound tasks ride on state-report acks.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::agent::registry::{ClientRegistry, DISCONNECT_REASON_LOST};
use crate::model::HostState;
use crate::repository::HostRepository;
use crate::sentinel::{ProbeReport, ServiceSentinel};
use crate::state::StateCollector;
use crate::transport::{
    HeartbeatResponse, ProbeBatchResponse, ProbeReportEntry, RegisterRequest, RegisterResponse,
    StateAck, StateStream,
};

/// Agent-facing RPC handler
pub struct AgentManager {
    registry: Arc<ClientRegistry>,
    hosts: Arc<dyn HostRepository>,
    collector: Arc<StateCollector>,
    sentinel: Arc<ServiceSentinel>,
}

impl AgentManager {
    pub fn new(
        registry: Arc<ClientRegistry>,
        hosts: Arc<dyn HostRepository>,
        collector: Arc<StateCollector>,
        sentinel: Arc<ServiceSentinel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            hosts,
            collector,
            sentinel,
        })
    }

    /// Validate the pairing secret and refresh the host's static facts
    ///
    /// Persistence failures reject the registration; this is the one
    /// telemetry-adjacent path that must fail fast.
    pub async fn register(&self, req: RegisterRequest) -> RegisterResponse {
        let host = match self.hosts.get_host(req.uuid).await {
            Ok(Some(host)) if !host.deleted => host,
            Ok(_) => return RegisterResponse::rejected(),
            Err(e) => {
                error!("Registration lookup failed for {}: {}", req.uuid, e);
                return RegisterResponse::failed("registration temporarily unavailable");
            }
        };

        if host.secret_key != req.secret {
            return RegisterResponse::rejected();
        }

        let mut info = req.info;
        info.host_id = host.id;
        let agent_version = info.agent_version.clone();

        if let Err(e) = self.hosts.upsert_host_info(info).await {
            error!("Failed to upsert host info for {}: {}", host.id, e);
            return RegisterResponse::failed("registration temporarily unavailable");
        }
        if let Err(e) = self
            .hosts
            .mark_connection_online(host.id, &agent_version)
            .await
        {
            error!("Failed to record connection for {}: {}", host.id, e);
            return RegisterResponse::failed("registration temporarily unavailable");
        }

        RegisterResponse {
            success: true,
            message: "registered".to_string(),
            server_time: Utc::now(),
        }
    }

    /// Drive one agent's ReportState stream to completion
    ///
    /// The first frame must carry the agent UUID. Every frame is acked;
    /// acks piggyback any queued outbound tasks. On stream end, error or
    /// cancellation the agent is unregistered.
    pub async fn report_state<S: StateStream>(&self, mut stream: S) {
        let first = match stream.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!("State stream failed before identification: {}", e);
                return;
            }
        };

        let Some(host_id) = first.uuid else {
            let _ = stream
                .send(StateAck::rejected("first frame must carry the agent uuid"))
                .await;
            return;
        };

        match self.hosts.get_host(host_id).await {
            Ok(Some(host)) if !host.deleted => {}
            _ => {
                let _ = stream.send(StateAck::rejected("unknown agent")).await;
                return;
            }
        }

        let handle = self.registry.register(host_id, "").await;
        let cancel = handle.cancel_token();

        if let Some(state) = first.state {
            self.process_sample(host_id, state).await;
        }
        if stream
            .send(StateAck::ok(self.registry.drain_pending(host_id)))
            .await
            .is_err()
        {
            self.registry
                .unregister(host_id, DISCONNECT_REASON_LOST)
                .await;
            return;
        }

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.recv() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    match frame.state {
                        Some(state) => self.process_sample(host_id, state).await,
                        None => {
                            self.registry.touch(host_id);
                        }
                    }
                    let ack = StateAck::ok(self.registry.drain_pending(host_id));
                    if stream.send(ack).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("State stream error for {}: {}", host_id, e);
                    break;
                }
            }
        }

        self.registry
            .unregister(host_id, DISCONNECT_REASON_LOST)
            .await;
    }

    /// Persist, broadcast and account one state sample
    ///
    /// Nothing on this path propagates back to the agent; persistence
    /// hiccups are logged and swallowed.
    async fn process_sample(&self, host_id: Uuid, mut state: HostState) {
        state.host_id = host_id;
        let delta = state.traffic_delta();

        self.registry.touch(host_id);
        if let Err(e) = self
            .hosts
            .touch_connection_heartbeat(host_id, Utc::now())
            .await
        {
            warn!("Failed to refresh heartbeat record for {}: {}", host_id, e);
        }
        if let Err(e) = self.hosts.increment_traffic(host_id, delta).await {
            warn!("Traffic accumulation failed for {}: {}", host_id, e);
        }

        self.collector.ingest(state).await;
    }

    /// Out-of-band liveness ping
    pub async fn heartbeat(&self, uuid: Uuid) -> HeartbeatResponse {
        let success = self.registry.touch(uuid);
        if success {
            if let Err(e) = self.hosts.touch_connection_heartbeat(uuid, Utc::now()).await {
                warn!("Failed to refresh heartbeat record for {}: {}", uuid, e);
            }
        }
        HeartbeatResponse {
            success,
            server_time: Utc::now(),
        }
    }

    /// Ingest a batch of probe results executed by an agent
    ///
    /// Invalid rows are counted as failed and skipped; one bad row never
    /// aborts the batch.
    pub async fn report_probe_results(
        &self,
        executor: Uuid,
        entries: Vec<ProbeReportEntry>,
    ) -> ProbeBatchResponse {
        let mut processed = 0u32;
        let mut failed = 0u32;

        for entry in entries {
            if entry.service_monitor_id.is_empty() {
                failed += 1;
                continue;
            }
            let monitor_id = match entry.service_monitor_id.parse::<Uuid>() {
                Ok(id) => id,
                Err(_) => {
                    failed += 1;
                    continue;
                }
            };
            let Some(payload) = entry.result else {
                failed += 1;
                continue;
            };

            let timestamp = Utc
                .timestamp_millis_opt(payload.timestamp_ms)
                .single()
                .unwrap_or_else(Utc::now);
            self.sentinel.dispatch_report(ProbeReport {
                monitor_id,
                executor: Some(executor),
                success: payload.success,
                latency_ms: payload.latency_ms,
                timestamp,
                error_message: payload.error_message,
                metadata: None,
            });
            processed += 1;
        }

        ProbeBatchResponse {
            success: true,
            message: None,
            processed,
            failed,
        }
    }
}

impl RegisterResponse {
    /// Secret mismatch or unknown host; message carries no detail
    fn rejected() -> Self {
        Self {
            success: false,
            message: "Invalid credentials".to_string(),
            server_time: Utc::now(),
        }
    }

    fn failed(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            server_time: Utc::now(),
        }
    }
}
