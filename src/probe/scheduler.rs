//! Probe scheduler
//!
//! Each enabled monitor becomes a cron entry with second resolution.
//! Firings route to the right executor per the monitor's strategy:
//! in-process for the server strategy, queued tasks for agent strategies,
//! with fallback to the server when no agent is reachable.

use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::ClientRegistry;
use crate::alert::{cert_severity, AlertEngine, AvailabilitySnapshot};
use crate::error::{AppError, AppResult};
use crate::model::{ProbeKind, ProbeStrategy, ServiceMonitor};
use crate::probe::executor::ProbeExecutor;
use crate::repository::{HostRepository, ServiceRepository};
use crate::sentinel::{ProbeReport, ServiceSentinel};
use crate::transport::{AgentTask, TaskType};

/// Map an interval in seconds onto a six-field cron expression
pub fn cron_expression(interval_seconds: u64) -> String {
    if interval_seconds < 60 {
        format!("*/{} * * * * *", interval_seconds)
    } else if interval_seconds < 3600 {
        format!("0 */{} * * * *", interval_seconds / 60)
    } else {
        format!("0 0 */{} * * *", interval_seconds / 3600)
    }
}

/// Public view of one scheduled entry
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskInfo {
    pub monitor_id: Uuid,
    pub name: String,
    pub expression: String,
    pub next_run: Option<DateTime<Local>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
}

struct ScheduledEntry {
    monitor: ServiceMonitor,
    expression: String,
    cancel: CancellationToken,
    next_run: Mutex<Option<DateTime<Local>>>,
    last_run: Mutex<Option<(DateTime<Utc>, bool)>>,
}

/// Cron-driven probe dispatcher
pub struct ProbeScheduler {
    entries: DashMap<Uuid, Arc<ScheduledEntry>>,
    registry: Arc<ClientRegistry>,
    hosts: Arc<dyn HostRepository>,
    services: Arc<dyn ServiceRepository>,
    sentinel: Arc<ServiceSentinel>,
    alerts: Arc<dyn AlertEngine>,
    executor: ProbeExecutor,
}

impl ProbeScheduler {
    pub fn new(
        registry: Arc<ClientRegistry>,
        hosts: Arc<dyn HostRepository>,
        services: Arc<dyn ServiceRepository>,
        sentinel: Arc<ServiceSentinel>,
        alerts: Arc<dyn AlertEngine>,
        executor: ProbeExecutor,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            registry,
            hosts,
            services,
            sentinel,
            alerts,
            executor,
        })
    }

    /// Install cron entries for every enabled monitor
    pub async fn schedule_all(self: &Arc<Self>) -> AppResult<usize> {
        let monitors = self.services.list_enabled_monitors().await?;
        let count = monitors.len();
        for monitor in monitors {
            if let Err(e) = self.schedule_monitor(monitor) {
                warn!("Failed to schedule monitor: {}", e);
            }
        }
        info!("Scheduled {} monitors", count);
        Ok(count)
    }

    /// Replace any prior entry for the monitor and install a new one
    pub fn schedule_monitor(self: &Arc<Self>, monitor: ServiceMonitor) -> AppResult<()> {
        monitor.validate()?;
        self.unschedule_monitor(monitor.id);
        if !monitor.enabled {
            return Ok(());
        }

        let expression = cron_expression(monitor.interval_seconds);
        let schedule = cron::Schedule::from_str(&expression)
            .map_err(|e| AppError::validation(format!("bad cron expression {expression}: {e}")))?;

        let entry = Arc::new(ScheduledEntry {
            monitor,
            expression,
            cancel: CancellationToken::new(),
            next_run: Mutex::new(schedule.upcoming(Local).next()),
            last_run: Mutex::new(None),
        });
        self.entries.insert(entry.monitor.id, Arc::clone(&entry));

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Local).next() else {
                    break;
                };
                *entry.next_run.lock() = Some(next);
                let wait = (next - Local::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        let success = scheduler.run_probe(&entry.monitor).await;
                        *entry.last_run.lock() = Some((Utc::now(), success));
                    }
                }
            }
        });
        Ok(())
    }

    /// Remove an entry; unknown ids are a no-op
    pub fn unschedule_monitor(&self, id: Uuid) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!("Unscheduled monitor {}", id);
                true
            }
            None => false,
        }
    }

    /// Re-install the entry after a monitor update
    pub fn update_monitor_schedule(self: &Arc<Self>, monitor: ServiceMonitor) -> AppResult<()> {
        self.schedule_monitor(monitor)
    }

    /// Fire one probe immediately, outside the cron cadence
    pub async fn trigger_manual_probe(&self, id: Uuid) -> AppResult<()> {
        let monitor = self
            .services
            .get_monitor(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("monitor {id}")))?;
        self.run_probe(&monitor).await;
        Ok(())
    }

    pub fn get_scheduled_tasks(&self) -> Vec<TaskInfo> {
        self.entries.iter().map(|e| entry_info(&e)).collect()
    }

    pub fn get_task_status(&self, id: Uuid) -> Option<TaskInfo> {
        self.entries.get(&id).map(|e| entry_info(&e))
    }

    /// Route one firing to its executors; returns overall success for
    /// status bookkeeping (agent dispatch counts as success when queued).
    pub async fn run_probe(&self, monitor: &ServiceMonitor) -> bool {
        match monitor.strategy {
            ProbeStrategy::Server => self.run_server_probe(monitor).await,
            _ => {
                let targets = self.resolve_agents(monitor).await;
                if targets.is_empty() {
                    warn!(
                        "No agents available for monitor {} ({}), falling back to server probe",
                        monitor.id, monitor.name
                    );
                    self.run_server_probe(monitor).await
                } else {
                    let mut queued = 0usize;
                    for host_id in targets {
                        match self.registry.queue_task(host_id, probe_task(monitor)) {
                            Ok(()) => queued += 1,
                            Err(e) => {
                                warn!("Failed to queue probe on agent {}: {}", host_id, e)
                            }
                        }
                    }
                    queued > 0
                }
            }
        }
    }

    /// Resolve the target agent set per the monitor's strategy
    async fn resolve_agents(&self, monitor: &ServiceMonitor) -> Vec<Uuid> {
        let data = monitor.strategy_data.as_deref().unwrap_or("");
        match monitor.strategy {
            ProbeStrategy::Server => Vec::new(),
            ProbeStrategy::Include => parse_uuid_list(data)
                .into_iter()
                .filter(|id| self.registry.is_online(*id))
                .collect(),
            ProbeStrategy::Exclude => {
                let excluded = parse_uuid_list(data);
                self.registry
                    .active_host_ids()
                    .into_iter()
                    .filter(|id| !excluded.contains(id))
                    .collect()
            }
            ProbeStrategy::Group => match self.hosts.list_host_ids_in_group(data).await {
                Ok(ids) => ids
                    .into_iter()
                    .filter(|id| self.registry.is_online(*id))
                    .collect(),
                Err(e) => {
                    warn!("Group resolution failed for {}: {}", monitor.id, e);
                    Vec::new()
                }
            },
        }
    }

    async fn run_server_probe(&self, monitor: &ServiceMonitor) -> bool {
        let outcome = self.executor.execute(monitor).await;
        let result = outcome.result;

        if let Err(e) = self.services.insert_probe_result(result.clone()).await {
            warn!("Failed to persist probe result for {}: {}", monitor.id, e);
        }

        let metadata = outcome
            .cert
            .as_ref()
            .and_then(|cert| serde_json::to_value(cert).ok());
        self.sentinel.dispatch_report(ProbeReport {
            monitor_id: monitor.id,
            executor: None,
            success: result.success,
            latency_ms: result.latency_ms,
            timestamp: result.timestamp,
            error_message: result.error_message.clone(),
            metadata,
        });

        if let Some(cert) = outcome.cert {
            if let Some(severity) = cert_severity(cert.days_to_expiry) {
                debug!(
                    "Certificate for {} expires in {} days ({})",
                    monitor.target,
                    cert.days_to_expiry,
                    severity.as_str()
                );
                let snapshot = AvailabilitySnapshot::cert_check(monitor.id, cert);
                if let Err(e) = self.alerts.evaluate_service_rules(snapshot).await {
                    debug!("Certificate alert evaluation failed: {}", e);
                }
            }
        }

        self.evaluate_window_alerts(monitor).await;
        result.success
    }

    /// Availability over a sliding 1-hour window from stored results
    async fn evaluate_window_alerts(&self, monitor: &ServiceMonitor) {
        let since = Utc::now() - chrono::Duration::hours(1);
        let results = match self.services.list_probe_results(monitor.id, since).await {
            Ok(results) if !results.is_empty() => results,
            Ok(_) => return,
            Err(e) => {
                debug!("Availability window query failed for {}: {}", monitor.id, e);
                return;
            }
        };

        let total = results.len();
        let up: Vec<&crate::model::ProbeResult> =
            results.iter().filter(|r| r.success).collect();
        let avg_delay_ms = if up.is_empty() {
            0.0
        } else {
            up.iter().map(|r| r.latency_ms).sum::<f64>() / up.len() as f64
        };
        let snapshot = AvailabilitySnapshot {
            monitor_id: monitor.id,
            kind: "availability".to_string(),
            uptime_percent: up.len() as f64 / total as f64 * 100.0,
            avg_delay_ms,
            cert: None,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.alerts.evaluate_service_rules(snapshot).await {
            debug!("Availability alert evaluation failed: {}", e);
        }
    }

    /// Cancel all entries; used on shutdown
    pub fn shutdown(&self) {
        for entry in self.entries.iter() {
            entry.cancel.cancel();
        }
        self.entries.clear();
    }
}

fn entry_info(entry: &ScheduledEntry) -> TaskInfo {
    let last = *entry.last_run.lock();
    TaskInfo {
        monitor_id: entry.monitor.id,
        name: entry.monitor.name.clone(),
        expression: entry.expression.clone(),
        next_run: *entry.next_run.lock(),
        last_run: last.map(|(at, _)| at),
        last_success: last.map(|(_, ok)| ok),
    }
}

/// Build the probe task envelope queued to agents
fn probe_task(monitor: &ServiceMonitor) -> AgentTask {
    let mut task = AgentTask::new(TaskType::Probe)
        .with_param("type", monitor.kind.as_str())
        .with_param("target", monitor.target.clone())
        .with_param("monitor_id", monitor.id.to_string());
    if monitor.timeout_seconds > 0 {
        task = task.with_param("timeout", monitor.timeout_seconds.to_string());
    }
    if monitor.kind == ProbeKind::Http {
        task = task
            .with_param(
                "method",
                monitor.http_method.clone().unwrap_or_else(|| "GET".to_string()),
            )
            .with_param(
                "expected_status",
                monitor.expect_status.unwrap_or(200).to_string(),
            );
        if let Some(headers) = &monitor.http_headers {
            if let Ok(encoded) = serde_json::to_string(headers) {
                task = task.with_param("headers", encoded);
            }
        }
    }
    task
}

fn parse_uuid_list(data: &str) -> Vec<Uuid> {
    serde_json::from_str::<Vec<Uuid>>(data).unwrap_or_default()
}
