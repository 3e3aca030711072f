//! Service monitor management and probe analytics

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::error::{AppError, AppResult};
use crate::model::{AuditEvent, Principal, ProbeResult, ServiceMonitor};
use crate::probe::ProbeScheduler;
use crate::repository::ServiceRepository;
use crate::sentinel::{ServiceSentinel, ServiceStats};

/// Monitor view enriched with the latest probe outcome
#[derive(Debug, Clone)]
pub struct MonitorDetails {
    pub monitor: ServiceMonitor,
    pub latest_result: Option<ProbeResult>,
}

/// Availability over a fixed query period
#[derive(Debug, Clone, serde::Serialize)]
pub struct AvailabilityStats {
    pub period: String,
    pub total: usize,
    pub up: usize,
    pub down: usize,
    pub uptime_percent: f64,
    pub avg_latency_ms: f64,
}

/// One host-monitor edge of the probe topology matrix
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopologyEdge {
    /// None when the server executed the probes
    pub host_id: Option<Uuid>,
    pub monitor_id: Uuid,
    pub samples: usize,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub loss_percent: f64,
    pub success_rate: f64,
}

/// Facade over monitor CRUD with schedule synchronization
pub struct ServiceProbeService {
    services: Arc<dyn ServiceRepository>,
    scheduler: Arc<ProbeScheduler>,
    sentinel: Arc<ServiceSentinel>,
    audit: Arc<AuditLogger>,
}

impl ServiceProbeService {
    pub fn new(
        services: Arc<dyn ServiceRepository>,
        scheduler: Arc<ProbeScheduler>,
        sentinel: Arc<ServiceSentinel>,
        audit: Arc<AuditLogger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            services,
            scheduler,
            sentinel,
            audit,
        })
    }

    pub async fn create_monitor(&self, monitor: ServiceMonitor) -> AppResult<ServiceMonitor> {
        monitor.validate()?;
        self.services.create_monitor(monitor.clone()).await?;
        if monitor.enabled {
            self.scheduler.schedule_monitor(monitor.clone())?;
        }
        self.audit_monitor_event("create", &monitor);
        info!("Monitor {} created ({})", monitor.id, monitor.name);
        Ok(monitor)
    }

    pub async fn update_monitor(&self, mut monitor: ServiceMonitor) -> AppResult<ServiceMonitor> {
        monitor.validate()?;
        monitor.updated_at = Utc::now();
        self.services.update_monitor(monitor.clone()).await?;
        self.scheduler.update_monitor_schedule(monitor.clone())?;
        self.audit_monitor_event("update", &monitor);
        Ok(monitor)
    }

    pub async fn delete_monitor(&self, id: Uuid) -> AppResult<()> {
        self.scheduler.unschedule_monitor(id);
        self.services.delete_monitor(id).await?;
        self.audit.enqueue(AuditEvent {
            subsystem: "service".to_string(),
            action: "delete".to_string(),
            resource_type: "monitor".to_string(),
            resource_id: Some(id.to_string()),
            principal: Principal::System,
            timestamp: Utc::now(),
            client_ip: None,
            user_agent: None,
            data: HashMap::new(),
        });
        info!("Monitor {} deleted", id);
        Ok(())
    }

    pub async fn get_monitor(&self, id: Uuid) -> AppResult<MonitorDetails> {
        let monitor = self
            .services
            .get_monitor(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("monitor {id}")))?;
        let latest_result = self.services.latest_probe_result(id).await?;
        Ok(MonitorDetails {
            monitor,
            latest_result,
        })
    }

    pub async fn list_monitors(&self) -> AppResult<Vec<ServiceMonitor>> {
        self.services.list_monitors().await
    }

    /// Availability over a named period: 1h, 24h, 7d or 30d
    pub async fn get_availability_stats(
        &self,
        id: Uuid,
        period: &str,
    ) -> AppResult<AvailabilityStats> {
        let window = match period {
            "1h" => ChronoDuration::hours(1),
            "24h" => ChronoDuration::hours(24),
            "7d" => ChronoDuration::days(7),
            "30d" => ChronoDuration::days(30),
            other => {
                return Err(AppError::validation(format!(
                    "unknown period {other}, expected 1h, 24h, 7d or 30d"
                )))
            }
        };
        let results = self
            .services
            .list_probe_results(id, Utc::now() - window)
            .await?;

        let total = results.len();
        let up = results.iter().filter(|r| r.success).count();
        let avg_latency_ms = if up == 0 {
            0.0
        } else {
            results
                .iter()
                .filter(|r| r.success)
                .map(|r| r.latency_ms)
                .sum::<f64>()
                / up as f64
        };
        Ok(AvailabilityStats {
            period: period.to_string(),
            total,
            up,
            down: total - up,
            uptime_percent: if total == 0 {
                0.0
            } else {
                up as f64 / total as f64 * 100.0
            },
            avg_latency_ms,
        })
    }

    pub async fn trigger_manual_probe(&self, id: Uuid) -> AppResult<()> {
        self.scheduler.trigger_manual_probe(id).await
    }

    /// The sentinel's per-monitor aggregated 30-day view
    pub fn get_overview(&self) -> HashMap<Uuid, ServiceStats> {
        self.sentinel.copy_stats()
    }

    /// Probe results executed by one host, grouped by monitor
    pub async fn get_host_probe_history(
        &self,
        host_id: Uuid,
        since: DateTime<Utc>,
    ) -> AppResult<HashMap<Uuid, Vec<ProbeResult>>> {
        let results = self.services.list_probe_results_since(since).await?;
        let mut grouped: HashMap<Uuid, Vec<ProbeResult>> = HashMap::new();
        for result in results {
            if result.executor == Some(host_id) {
                grouped.entry(result.monitor_id).or_default().push(result);
            }
        }
        Ok(grouped)
    }

    /// Host-monitor matrix with latency and loss over the last `hours`
    pub async fn get_network_topology(&self, hours: i64) -> AppResult<Vec<TopologyEdge>> {
        let since = Utc::now() - ChronoDuration::hours(hours.max(1));
        let results = self.services.list_probe_results_since(since).await?;

        let mut buckets: HashMap<(Option<Uuid>, Uuid), Vec<ProbeResult>> = HashMap::new();
        for result in results {
            buckets
                .entry((result.executor, result.monitor_id))
                .or_default()
                .push(result);
        }

        let mut edges = Vec::with_capacity(buckets.len());
        for ((host_id, monitor_id), results) in buckets {
            let samples = results.len();
            let up: Vec<&ProbeResult> = results.iter().filter(|r| r.success).collect();
            let success_rate = up.len() as f64 / samples as f64;
            let latencies: Vec<f64> = up.iter().map(|r| r.latency_ms).collect();
            let (min, max, avg) = if latencies.is_empty() {
                (0.0, 0.0, 0.0)
            } else {
                (
                    latencies.iter().cloned().fold(f64::INFINITY, f64::min),
                    latencies.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    latencies.iter().sum::<f64>() / latencies.len() as f64,
                )
            };
            edges.push(TopologyEdge {
                host_id,
                monitor_id,
                samples,
                avg_latency_ms: avg,
                min_latency_ms: min,
                max_latency_ms: max,
                loss_percent: (1.0 - success_rate) * 100.0,
                success_rate,
            });
        }
        edges.sort_by(|a, b| {
            a.monitor_id
                .cmp(&b.monitor_id)
                .then(a.host_id.cmp(&b.host_id))
        });
        Ok(edges)
    }

    fn audit_monitor_event(&self, action: &str, monitor: &ServiceMonitor) {
        self.audit.enqueue(AuditEvent {
            subsystem: "service".to_string(),
            action: action.to_string(),
            resource_type: "monitor".to_string(),
            resource_id: Some(monitor.id.to_string()),
            principal: Principal::System,
            timestamp: Utc::now(),
            client_ip: None,
            user_agent: None,
            data: HashMap::from([
                ("name".to_string(), json!(monitor.name)),
                ("type".to_string(), json!(monitor.kind.as_str())),
            ]),
        });
    }
}
