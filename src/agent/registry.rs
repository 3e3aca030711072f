//! Agent connection registry
//!
//! Maps a host UUID to its live connection record: cancellation handle,
//! last-seen time and bounded outbound task queue. The durable
//! `AgentConnectionRecord` is a shadow kept in storage; this registry is
//! authoritative for liveness.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{AppError, AppResult};
use crate::repository::HostRepository;
use crate::transport::AgentTask;

/// Disconnect reason recorded when liveness is lost
pub const DISCONNECT_REASON_LOST: &str = "Connection lost";

/// Live connection record for one agent
pub struct AgentHandle {
    pub host_id: Uuid,
    pub connected_at: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,
    cancel: CancellationToken,
    task_tx: mpsc::Sender<AgentTask>,
    task_rx: Mutex<mpsc::Receiver<AgentTask>>,
}

impl AgentHandle {
    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Utc::now();
    }

    /// Cancellation handle shared with the stream loop and forwarders
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Registry of currently connected agents with their task queues
pub struct ClientRegistry {
    clients: DashMap<Uuid, Arc<AgentHandle>>,
    hosts: Arc<dyn HostRepository>,
    config: AgentConfig,
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    dropped_tasks: AtomicU64,
}

impl ClientRegistry {
    pub fn new(hosts: Arc<dyn HostRepository>, config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            hosts,
            config,
            registrations: AtomicU64::new(0),
            deregistrations: AtomicU64::new(0),
            dropped_tasks: AtomicU64::new(0),
        })
    }

    /// Create a live record for the agent and start its heartbeat watchdog
    ///
    /// A prior connection for the same host is cancelled and replaced.
    pub async fn register(self: &Arc<Self>, host_id: Uuid, agent_version: &str) -> Arc<AgentHandle> {
        if let Some((_, prior)) = self.clients.remove(&host_id) {
            prior.cancel.cancel();
        }

        let (task_tx, task_rx) = mpsc::channel(self.config.task_queue_capacity);
        let handle = Arc::new(AgentHandle {
            host_id,
            connected_at: Utc::now(),
            last_seen: Mutex::new(Utc::now()),
            cancel: CancellationToken::new(),
            task_tx,
            task_rx: Mutex::new(task_rx),
        });
        self.clients.insert(host_id, Arc::clone(&handle));
        self.registrations.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.hosts.mark_connection_online(host_id, agent_version).await {
            warn!("Failed to mark connection online for {}: {}", host_id, e);
        }

        self.spawn_watchdog(host_id, Arc::clone(&handle));
        info!("Agent registered: {}", host_id);
        handle
    }

    fn spawn_watchdog(self: &Arc<Self>, host_id: Uuid, handle: Arc<AgentHandle>) {
        let registry = Arc::clone(self);
        let interval = self.config.heartbeat_interval();
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(90));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = handle.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if Utc::now() - handle.last_seen() > timeout {
                            warn!("Agent {} missed heartbeat deadline", host_id);
                            registry.unregister(host_id, DISCONNECT_REASON_LOST).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Atomic load-and-delete; cancels the record and updates the durable
    /// shadow. Returns false when the agent was not registered.
    pub async fn unregister(&self, host_id: Uuid, reason: &str) -> bool {
        match self.clients.remove(&host_id) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                self.deregistrations.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.hosts.mark_connection_offline(host_id, reason).await {
                    warn!("Failed to mark connection offline for {}: {}", host_id, e);
                }
                if let Err(e) = self.hosts.update_last_active(host_id, Utc::now()).await {
                    warn!("Failed to update last-active for {}: {}", host_id, e);
                }
                info!("Agent unregistered: {} ({})", host_id, reason);
                true
            }
            None => false,
        }
    }

    /// Non-blocking enqueue of an outbound task; never blocks ingress
    pub fn queue_task(&self, host_id: Uuid, task: AgentTask) -> AppResult<()> {
        let handle = self
            .clients
            .get(&host_id)
            .ok_or_else(|| AppError::not_found(format!("agent {host_id}")))?;
        handle.task_tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.dropped_tasks.fetch_add(1, Ordering::Relaxed);
                warn!("Task queue full for agent {}", host_id);
                AppError::saturated("agent task queue")
            }
            mpsc::error::TrySendError::Closed(_) => AppError::transport("agent task queue closed"),
        })
    }

    /// Pull all currently queued tasks without blocking
    pub fn drain_pending(&self, host_id: Uuid) -> Vec<AgentTask> {
        let Some(handle) = self.clients.get(&host_id) else {
            return Vec::new();
        };
        let mut rx = handle.task_rx.lock();
        let mut tasks = Vec::new();
        while let Ok(task) = rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    /// Refresh last-seen; returns false for unknown agents
    pub fn touch(&self, host_id: Uuid) -> bool {
        match self.clients.get(&host_id) {
            Some(handle) => {
                handle.touch();
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, host_id: Uuid) -> bool {
        self.clients.contains_key(&host_id)
    }

    pub fn get(&self, host_id: Uuid) -> Option<Arc<AgentHandle>> {
        self.clients.get(&host_id).map(|h| Arc::clone(&h))
    }

    /// Lookup by host-node id; the registry keys on host UUID
    pub fn get_by_host_id(&self, host_id: Uuid) -> Option<Arc<AgentHandle>> {
        self.get(host_id)
    }

    pub fn active_count(&self) -> usize {
        self.clients.len()
    }

    pub fn list_all(&self) -> Vec<Arc<AgentHandle>> {
        self.clients.iter().map(|h| Arc::clone(&h)).collect()
    }

    /// Host ids of all currently connected agents
    pub fn active_host_ids(&self) -> Vec<Uuid> {
        self.clients.iter().map(|h| h.host_id).collect()
    }

    pub fn dropped_tasks(&self) -> u64 {
        self.dropped_tasks.load(Ordering::Relaxed)
    }
}
