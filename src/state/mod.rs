//! State collector
//!
//! Receives completed host-state samples from the agent manager, persists
//! them write-through, maintains the latest-state cache, and fans updates
//! out to subscribers over bounded channels. Delivery is non-blocking:
//! a full subscriber channel drops the update rather than stalling ingest.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::ClientRegistry;
use crate::config::CollectorConfig;
use crate::error::AppResult;
use crate::model::HostState;
use crate::repository::HostRepository;

/// One registered subscriber with its bounded delivery channel
struct Subscriber {
    id: String,
    /// None subscribes to all hosts
    filter: Option<HashSet<Uuid>>,
    tx: mpsc::Sender<HostState>,
    last_sent: Mutex<DateTime<Utc>>,
}

/// Min/avg/max summary over a state window
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// Statistics over a host's state window
#[derive(Debug, Clone, serde::Serialize)]
pub struct StateSummary {
    pub count: usize,
    pub cpu: MetricSummary,
    pub mem: MetricSummary,
    pub disk: MetricSummary,
}

/// State collector; owns the latest-state cache and the subscriber set
pub struct StateCollector {
    hosts: Arc<dyn HostRepository>,
    config: CollectorConfig,
    latest: DashMap<Uuid, HostState>,
    subscribers: DashMap<String, Arc<Subscriber>>,
    /// Late-bound to break the constructor cycle with the agent manager
    registry: RwLock<Option<Arc<ClientRegistry>>>,
    dropped_updates: AtomicU64,
}

impl StateCollector {
    pub fn new(hosts: Arc<dyn HostRepository>, config: CollectorConfig) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            config,
            latest: DashMap::new(),
            subscribers: DashMap::new(),
            registry: RwLock::new(None),
            dropped_updates: AtomicU64::new(0),
        })
    }

    /// Wire the registry after both sides are constructed
    pub fn set_registry(&self, registry: Arc<ClientRegistry>) {
        *self.registry.write() = Some(registry);
    }

    /// Number of currently connected agents, for enriched views
    pub fn active_agent_count(&self) -> usize {
        self.registry
            .read()
            .as_ref()
            .map(|r| r.active_count())
            .unwrap_or(0)
    }

    /// Persist a sample, refresh the latest-state cache and fan out
    pub async fn ingest(&self, state: HostState) {
        if let Err(e) = self.hosts.insert_state(state.clone()).await {
            warn!("Failed to persist state for {}: {}", state.host_id, e);
        }
        self.latest.insert(state.host_id, state.clone());
        self.fan_out(state);
    }

    fn fan_out(&self, state: HostState) {
        for subscriber in self.subscribers.iter() {
            if let Some(filter) = &subscriber.filter {
                if !filter.contains(&state.host_id) {
                    continue;
                }
            }
            match subscriber.tx.try_send(state.clone()) {
                Ok(()) => {
                    *subscriber.last_sent.lock() = Utc::now();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_updates.fetch_add(1, Ordering::Relaxed);
                    debug!("Subscriber {} channel full, update dropped", subscriber.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {} channel closed", subscriber.id);
                }
            }
        }
    }

    /// Register a subscriber; `filter` of None receives all hosts
    pub fn subscribe(&self, id: &str, filter: Option<Vec<Uuid>>) -> mpsc::Receiver<HostState> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        let subscriber = Arc::new(Subscriber {
            id: id.to_string(),
            filter: filter.map(|hosts| hosts.into_iter().collect()),
            tx,
            last_sent: Mutex::new(Utc::now()),
        });
        self.subscribers.insert(id.to_string(), subscriber);
        rx
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    /// Sweep subscribers whose last successful delivery is too old
    ///
    /// Defensive cleanup for leaked client handles.
    pub fn start_janitor(self: &Arc<Self>, cancel: CancellationToken) {
        let collector = Arc::clone(self);
        let interval = std::time::Duration::from_secs(collector.config.janitor_interval_secs);
        let cutoff = ChronoDuration::seconds(collector.config.idle_cutoff_secs as i64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let stale: Vec<String> = collector
                            .subscribers
                            .iter()
                            .filter(|s| now - *s.last_sent.lock() > cutoff)
                            .map(|s| s.id.clone())
                            .collect();
                        for id in stale {
                            info!("Unsubscribing idle subscriber {}", id);
                            collector.subscribers.remove(&id);
                        }
                    }
                }
            }
        });
    }

    /// Latest sample for a host, if any has been received
    pub fn latest_state(&self, host_id: Uuid) -> Option<HostState> {
        self.latest.get(&host_id).map(|s| s.clone())
    }

    /// Stored samples over [start, end), optionally down-sampled
    ///
    /// Supported interval names are `minute`, `hour` and `day`; buckets
    /// are averaged per gauge. Unknown names return the raw series.
    pub async fn history(
        &self,
        host_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Option<&str>,
    ) -> AppResult<Vec<HostState>> {
        let mut samples = self.hosts.list_states(host_id, start, end).await?;
        samples.sort_by_key(|s| s.timestamp);

        let bucket_seconds = match interval {
            Some("minute") => 60,
            Some("hour") => 3600,
            Some("day") => 86_400,
            _ => return Ok(samples),
        };
        Ok(downsample(samples, bucket_seconds))
    }

    /// Count plus min/avg/max for CPU%, mem%, disk% over the window
    pub async fn summary(
        &self,
        host_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Option<StateSummary>> {
        let samples = self.hosts.list_states(host_id, start, end).await?;
        if samples.is_empty() {
            return Ok(None);
        }

        let summarize = |values: Vec<f64>| -> MetricSummary {
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            MetricSummary { min, avg, max }
        };

        Ok(Some(StateSummary {
            count: samples.len(),
            cpu: summarize(samples.iter().map(|s| s.cpu_percent).collect()),
            mem: summarize(samples.iter().map(|s| s.mem_used_percent).collect()),
            disk: summarize(samples.iter().map(|s| s.disk_used_percent).collect()),
        }))
    }
}

/// Bucket-mean down-sampling; the representative sample keeps the bucket's
/// last timestamp and identity fields with averaged gauges.
fn downsample(samples: Vec<HostState>, bucket_seconds: i64) -> Vec<HostState> {
    let mut out: Vec<HostState> = Vec::new();
    let mut bucket: Vec<HostState> = Vec::new();
    let mut bucket_key: Option<i64> = None;

    for sample in samples {
        let key = sample.timestamp.timestamp().div_euclid(bucket_seconds);
        if bucket_key.is_some() && bucket_key != Some(key) {
            if let Some(merged) = merge_bucket(std::mem::take(&mut bucket)) {
                out.push(merged);
            }
        }
        bucket_key = Some(key);
        bucket.push(sample);
    }
    if let Some(merged) = merge_bucket(bucket) {
        out.push(merged);
    }
    out
}

fn merge_bucket(bucket: Vec<HostState>) -> Option<HostState> {
    let last = bucket.last()?.clone();
    let n = bucket.len() as f64;
    let mut merged = last;
    merged.cpu_percent = bucket.iter().map(|s| s.cpu_percent).sum::<f64>() / n;
    merged.mem_used_percent = bucket.iter().map(|s| s.mem_used_percent).sum::<f64>() / n;
    merged.disk_used_percent = bucket.iter().map(|s| s.disk_used_percent).sum::<f64>() / n;
    merged.load1 = bucket.iter().map(|s| s.load1).sum::<f64>() / n;
    merged.load5 = bucket.iter().map(|s| s.load5).sum::<f64>() / n;
    merged.load15 = bucket.iter().map(|s| s.load15).sum::<f64>() / n;
    merged.gpu_percent = bucket.iter().map(|s| s.gpu_percent).sum::<f64>() / n;
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryHostRepository;
    use chrono::TimeZone;

    fn sample(host_id: Uuid, cpu: f64, at: DateTime<Utc>) -> HostState {
        HostState {
            host_id,
            timestamp: at,
            cpu_percent: cpu,
            load1: 0.0,
            load5: 0.0,
            load15: 0.0,
            mem_used: 0,
            mem_used_percent: 50.0,
            swap_used: 0,
            disk_used: 0,
            disk_used_percent: 30.0,
            net_rx_transfer: 0,
            net_tx_transfer: 0,
            net_rx_speed: 0,
            net_tx_speed: 0,
            tcp_connections: 0,
            udp_connections: 0,
            process_count: 0,
            uptime_seconds: 0,
            gpu_percent: 0.0,
            traffic_sent: 0,
            traffic_recv: 0,
            delta_sent: 0,
            delta_recv: 0,
            temperatures: None,
        }
    }

    #[tokio::test]
    async fn ingest_updates_latest_and_delivers_to_subscriber() {
        let collector = StateCollector::new(
            Arc::new(MemoryHostRepository::new()),
            CollectorConfig::default(),
        );
        let host_id = Uuid::new_v4();
        let mut rx = collector.subscribe("ui-1", None);

        collector.ingest(sample(host_id, 42.0, Utc::now())).await;

        assert_eq!(collector.latest_state(host_id).unwrap().cpu_percent, 42.0);
        assert_eq!(rx.recv().await.unwrap().cpu_percent, 42.0);
    }

    #[tokio::test]
    async fn filtered_subscriber_only_sees_its_hosts() {
        let collector = StateCollector::new(
            Arc::new(MemoryHostRepository::new()),
            CollectorConfig::default(),
        );
        let wanted = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = collector.subscribe("ui-2", Some(vec![wanted]));

        collector.ingest(sample(other, 1.0, Utc::now())).await;
        collector.ingest(sample(wanted, 2.0, Utc::now())).await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.host_id, wanted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_channel_drops_instead_of_blocking() {
        let config = CollectorConfig {
            subscriber_capacity: 1,
            ..CollectorConfig::default()
        };
        let collector = StateCollector::new(Arc::new(MemoryHostRepository::new()), config);
        let host_id = Uuid::new_v4();
        let _rx = collector.subscribe("slow", None);

        collector.ingest(sample(host_id, 1.0, Utc::now())).await;
        collector.ingest(sample(host_id, 2.0, Utc::now())).await;

        assert_eq!(collector.dropped_updates(), 1);
    }

    #[tokio::test]
    async fn summary_reports_min_avg_max() {
        let repo = Arc::new(MemoryHostRepository::new());
        let collector = StateCollector::new(repo, CollectorConfig::default());
        let host_id = Uuid::new_v4();
        let base = Utc::now();

        for (i, cpu) in [10.0, 20.0, 30.0].iter().enumerate() {
            collector
                .ingest(sample(host_id, *cpu, base + ChronoDuration::seconds(i as i64)))
                .await;
        }

        let summary = collector
            .summary(host_id, base - ChronoDuration::minutes(1), base + ChronoDuration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.cpu.min, 10.0);
        assert_eq!(summary.cpu.avg, 20.0);
        assert_eq!(summary.cpu.max, 30.0);
    }

    #[test]
    fn downsample_buckets_by_interval() {
        let host_id = Uuid::new_v4();
        let base = Utc.timestamp_opt(1_700_000_040, 0).unwrap();
        let samples = vec![
            sample(host_id, 10.0, base),
            sample(host_id, 30.0, base + ChronoDuration::seconds(10)),
            sample(host_id, 50.0, base + ChronoDuration::seconds(70)),
        ];
        let out = downsample(samples, 60);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].cpu_percent, 20.0);
        assert_eq!(out[1].cpu_percent, 50.0);
    }
}
