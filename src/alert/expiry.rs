//! Host subscription expiry scheduler
//!
//! A once-per-24h scan over hosts carrying an expiry date. Fires alert
//! events at fixed day deltas before expiry, deduplicated on
//! (rule id, message) against existing firing events.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{expiry_severity, AlertEngine};
use crate::model::MonitorAlertEvent;
use crate::repository::HostRepository;

/// Day deltas to expiry that trigger an event
const NOTIFY_DAYS: [i64; 5] = [30, 7, 3, 1, 0];

/// Daily scanner for hosts nearing subscription expiry
pub struct ExpiryScheduler {
    hosts: Arc<dyn HostRepository>,
    engine: Arc<dyn AlertEngine>,
}

impl ExpiryScheduler {
    pub fn new(hosts: Arc<dyn HostRepository>, engine: Arc<dyn AlertEngine>) -> Arc<Self> {
        Arc::new(Self { hosts, engine })
    }

    /// Spawn the daily scan loop; the first scan runs immediately
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(86_400));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.scan().await {
                            warn!("Expiry scan failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// One scan pass over all hosts with an expiry date
    pub async fn scan(&self) -> crate::error::AppResult<usize> {
        let hosts = self.hosts.list_hosts_with_expiry().await?;
        let today = Utc::now().date_naive();
        let mut fired = 0;

        for host in hosts {
            let Some(expires_at) = host.expires_at else {
                continue;
            };
            let days_left = (expires_at.date_naive() - today).num_days();
            if !NOTIFY_DAYS.contains(&days_left) {
                continue;
            }

            let severity = expiry_severity(days_left);
            let message = if days_left == 0 {
                format!("Host {} subscription expires today", host.name)
            } else {
                format!(
                    "Host {} subscription expires in {} days",
                    host.name, days_left
                )
            };

            let rule_id = match self.engine.upsert_expiry_rule(&host).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("Failed to upsert expiry rule for {}: {}", host.id, e);
                    continue;
                }
            };

            match self.engine.has_firing_event(rule_id, &message).await {
                Ok(true) => {
                    debug!("Expiry event already firing for {}", host.id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Expiry dedup lookup failed for {}: {}", host.id, e);
                    continue;
                }
            }

            let event = MonitorAlertEvent {
                id: Uuid::new_v4(),
                rule_id,
                host_id: Some(host.id),
                monitor_id: None,
                severity,
                message: message.clone(),
                firing: true,
                created_at: Utc::now(),
            };
            if let Err(e) = self.engine.create_event(event).await {
                warn!("Failed to create expiry event for {}: {}", host.id, e);
                continue;
            }
            info!("Expiry alert for host {}: {}", host.id, message);
            fired += 1;
        }

        Ok(fired)
    }
}
