//! Alert engine contract and severity mappings
//!
//! Alert delivery lives outside the core; the core talks to it through
//! [`AlertEngine`]. `LogAlertEngine` is the in-process default: it logs
//! firing events and retains them so expiry deduplication works without
//! the external delivery system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::{AlertSeverity, CertificateInfo, HostNode, MonitorAlertEvent};

pub mod expiry;

pub use expiry::ExpiryScheduler;

/// Availability view handed to the rule evaluator
#[derive(Debug, Clone)]
pub struct AvailabilitySnapshot {
    pub monitor_id: Uuid,
    /// "availability" for probe outcomes, "cert_check" for synthetic
    /// certificate snapshots
    pub kind: String,
    pub uptime_percent: f64,
    pub avg_delay_ms: f64,
    pub cert: Option<CertificateInfo>,
    pub timestamp: DateTime<Utc>,
}

impl AvailabilitySnapshot {
    /// Synthetic snapshot at 100% uptime so that only cert-type rules fire
    pub fn cert_check(monitor_id: Uuid, cert: CertificateInfo) -> Self {
        Self {
            monitor_id,
            kind: "cert_check".to_string(),
            uptime_percent: 100.0,
            avg_delay_ms: 0.0,
            cert: Some(cert),
            timestamp: Utc::now(),
        }
    }
}

/// External alert evaluation and event storage contract
#[async_trait]
pub trait AlertEngine: Send + Sync {
    /// Evaluate registered rules against an availability snapshot.
    /// Callers treat this as fire-and-forget.
    async fn evaluate_service_rules(&self, snapshot: AvailabilitySnapshot) -> AppResult<()>;

    /// Upsert the synthetic expiry rule for a host; returns the rule id
    async fn upsert_expiry_rule(&self, host: &HostNode) -> AppResult<Uuid>;

    /// Whether a firing event with this rule id and message already exists
    async fn has_firing_event(&self, rule_id: Uuid, message: &str) -> AppResult<bool>;

    /// Record a firing event
    async fn create_event(&self, event: MonitorAlertEvent) -> AppResult<()>;
}

/// Default engine: logs evaluations, retains events in memory
#[derive(Default)]
pub struct LogAlertEngine {
    expiry_rules: DashMap<Uuid, Uuid>,
    events: Mutex<Vec<MonitorAlertEvent>>,
}

impl LogAlertEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MonitorAlertEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AlertEngine for LogAlertEngine {
    async fn evaluate_service_rules(&self, snapshot: AvailabilitySnapshot) -> AppResult<()> {
        info!(
            "Evaluating {} rules for monitor {}: uptime {:.2}%",
            snapshot.kind, snapshot.monitor_id, snapshot.uptime_percent
        );
        Ok(())
    }

    async fn upsert_expiry_rule(&self, host: &HostNode) -> AppResult<Uuid> {
        let rule_id = *self
            .expiry_rules
            .entry(host.id)
            .or_insert_with(Uuid::new_v4);
        Ok(rule_id)
    }

    async fn has_firing_event(&self, rule_id: Uuid, message: &str) -> AppResult<bool> {
        Ok(self
            .events
            .lock()
            .iter()
            .any(|e| e.firing && e.rule_id == rule_id && e.message == message))
    }

    async fn create_event(&self, event: MonitorAlertEvent) -> AppResult<()> {
        info!(
            "Alert event [{}] {}",
            event.severity.as_str(),
            event.message
        );
        self.events.lock().push(event);
        Ok(())
    }
}

/// Certificate expiry severity mapping
///
/// Expired or within 7 days is critical, within 15 warning, within 30
/// info; anything further out raises no alert.
pub fn cert_severity(days_to_expiry: i64) -> Option<AlertSeverity> {
    if days_to_expiry < 0 || days_to_expiry <= 7 {
        Some(AlertSeverity::Critical)
    } else if days_to_expiry <= 15 {
        Some(AlertSeverity::Warning)
    } else if days_to_expiry <= 30 {
        Some(AlertSeverity::Info)
    } else {
        None
    }
}

/// Host subscription expiry severity mapping
pub fn expiry_severity(days_left: i64) -> AlertSeverity {
    if days_left < 0 || days_left <= 3 {
        AlertSeverity::Critical
    } else if days_left <= 7 {
        AlertSeverity::Warning
    } else {
        AlertSeverity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_severity_mapping() {
        assert_eq!(cert_severity(-1), Some(AlertSeverity::Critical));
        assert_eq!(cert_severity(0), Some(AlertSeverity::Critical));
        assert_eq!(cert_severity(7), Some(AlertSeverity::Critical));
        assert_eq!(cert_severity(8), Some(AlertSeverity::Warning));
        assert_eq!(cert_severity(15), Some(AlertSeverity::Warning));
        assert_eq!(cert_severity(16), Some(AlertSeverity::Info));
        assert_eq!(cert_severity(30), Some(AlertSeverity::Info));
        assert_eq!(cert_severity(31), None);
    }

    #[test]
    fn expiry_severity_mapping() {
        assert_eq!(expiry_severity(-2), AlertSeverity::Critical);
        assert_eq!(expiry_severity(0), AlertSeverity::Critical);
        assert_eq!(expiry_severity(1), AlertSeverity::Critical);
        assert_eq!(expiry_severity(3), AlertSeverity::Critical);
        assert_eq!(expiry_severity(7), AlertSeverity::Warning);
        assert_eq!(expiry_severity(30), AlertSeverity::Info);
    }

    #[tokio::test]
    async fn log_engine_dedups_by_rule_and_message() {
        let engine = LogAlertEngine::new();
        let host = HostNode::new("h".to_string(), "s".to_string());
        let rule_id = engine.upsert_expiry_rule(&host).await.unwrap();

        assert!(!engine.has_firing_event(rule_id, "msg").await.unwrap());
        engine
            .create_event(MonitorAlertEvent {
                id: Uuid::new_v4(),
                rule_id,
                host_id: Some(host.id),
                monitor_id: None,
                severity: AlertSeverity::Warning,
                message: "msg".to_string(),
                firing: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(engine.has_firing_event(rule_id, "msg").await.unwrap());

        // re-upserting yields the same rule id
        assert_eq!(engine.upsert_expiry_rule(&host).await.unwrap(), rule_id);
    }
}
