//! Host management service

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::agent::registry::ClientRegistry;
use crate::audit::AuditLogger;
use crate::error::{AppError, AppResult};
use crate::model::{AgentConnectionRecord, AuditEvent, HostInfo, HostNode, HostState};
use crate::repository::HostRepository;
use crate::session::{DockerStreamManager, TerminalManager};
use crate::state::{StateCollector, StateSummary};

/// Host view enriched with liveness and static facts
#[derive(Debug, Clone)]
pub struct HostDetails {
    pub node: HostNode,
    pub info: Option<HostInfo>,
    pub connection: Option<AgentConnectionRecord>,
    pub online: bool,
}

/// Facade over host CRUD, liveness and state queries
pub struct HostService {
    hosts: Arc<dyn HostRepository>,
    registry: Arc<ClientRegistry>,
    collector: Arc<StateCollector>,
    terminals: Arc<TerminalManager>,
    docker: Arc<DockerStreamManager>,
    audit: Arc<AuditLogger>,
    public_url: String,
}

impl HostService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Arc<dyn HostRepository>,
        registry: Arc<ClientRegistry>,
        collector: Arc<StateCollector>,
        terminals: Arc<TerminalManager>,
        docker: Arc<DockerStreamManager>,
        audit: Arc<AuditLogger>,
        public_url: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            registry,
            collector,
            terminals,
            docker,
            audit,
            public_url,
        })
    }

    /// Create a host with a generated UUID and pairing secret
    pub async fn create_host(
        &self,
        name: &str,
        groups: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<HostNode> {
        if name.is_empty() {
            return Err(AppError::validation("host name is required"));
        }
        let mut host = HostNode::new(name.to_string(), generate_secret());
        host.groups = groups;
        host.expires_at = expires_at;
        self.hosts.create_host(host.clone()).await?;

        self.audit.enqueue(
            AuditEvent::host_system_event(host.id, "create").with_data("name", json!(host.name)),
        );
        info!("Host {} created ({})", host.id, host.name);
        Ok(host)
    }

    pub async fn get_host(&self, id: Uuid) -> AppResult<HostDetails> {
        let node = self
            .hosts
            .get_host(id)
            .await?
            .filter(|h| !h.deleted)
            .ok_or_else(|| AppError::not_found(format!("host {id}")))?;
        let info = self.hosts.get_host_info(id).await?;
        let connection = self.hosts.get_connection_by_host(id).await?;
        Ok(HostDetails {
            online: self.registry.is_online(node.id),
            node,
            info,
            connection,
        })
    }

    /// List hosts, optionally filtered by a name or group substring
    pub async fn list_hosts(&self, filter: Option<&str>) -> AppResult<Vec<HostDetails>> {
        let nodes = self.hosts.list_hosts().await?;
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(filter) = filter {
                let matches = node.name.contains(filter)
                    || node.groups.iter().any(|g| g.contains(filter));
                if !matches {
                    continue;
                }
            }
            let info = self.hosts.get_host_info(node.id).await?;
            let connection = self.hosts.get_connection_by_host(node.id).await?;
            out.push(HostDetails {
                online: self.registry.is_online(node.id),
                node,
                info,
                connection,
            });
        }
        Ok(out)
    }

    pub async fn update_host(&self, host: HostNode) -> AppResult<()> {
        let existing = self
            .hosts
            .get_host(host.id)
            .await?
            .filter(|h| !h.deleted)
            .ok_or_else(|| AppError::not_found(format!("host {}", host.id)))?;
        // the pairing secret only changes through regeneration
        let mut host = host;
        host.secret_key = existing.secret_key;
        self.hosts.update_host(host.clone()).await?;
        self.audit
            .enqueue(AuditEvent::host_system_event(host.id, "update"));
        Ok(())
    }

    /// Soft delete with cascading close of any open streams and sessions
    pub async fn delete_host(&self, id: Uuid) -> AppResult<()> {
        self.hosts
            .get_host(id)
            .await?
            .filter(|h| !h.deleted)
            .ok_or_else(|| AppError::not_found(format!("host {id}")))?;

        self.hosts.soft_delete_host(id).await?;
        self.registry.unregister(id, "Host deleted").await;
        let terminals = self.terminals.close_sessions_for_host(id);
        let docker = self.docker.close_sessions_for_host(id);

        self.audit.enqueue(
            AuditEvent::host_system_event(id, "delete")
                .with_data("closed_sessions", json!(terminals + docker)),
        );
        info!("Host {} deleted", id);
        Ok(())
    }

    /// Shell one-liner the operator runs on the managed host
    pub async fn get_agent_install_command(&self, id: Uuid) -> AppResult<String> {
        let host = self
            .hosts
            .get_host(id)
            .await?
            .filter(|h| !h.deleted)
            .ok_or_else(|| AppError::not_found(format!("host {id}")))?;
        Ok(format!(
            "fleetwatch-agent install --server {} --uuid {} --secret {}",
            self.public_url, host.id, host.secret_key
        ))
    }

    /// Rotate the pairing secret; the old secret stops working immediately
    pub async fn regenerate_secret_key(&self, id: Uuid) -> AppResult<String> {
        let mut host = self
            .hosts
            .get_host(id)
            .await?
            .filter(|h| !h.deleted)
            .ok_or_else(|| AppError::not_found(format!("host {id}")))?;
        host.secret_key = generate_secret();
        self.hosts.update_host(host.clone()).await?;
        self.audit
            .enqueue(AuditEvent::host_system_event(id, "regenerate_secret"));
        Ok(host.secret_key)
    }

    /// Latest state sample from the in-memory cache
    pub fn get_host_state(&self, id: Uuid) -> Option<HostState> {
        self.collector.latest_state(id)
    }

    pub async fn get_host_state_history(
        &self,
        id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Option<&str>,
    ) -> AppResult<Vec<HostState>> {
        self.collector.history(id, start, end, interval).await
    }

    pub async fn get_host_metrics_summary(
        &self,
        id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Option<StateSummary>> {
        self.collector.summary(id, start, end).await
    }
}

fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
