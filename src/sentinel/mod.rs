//! Service sentinel: in-memory 30-day availability engine
//!
//! Maintains a 30-slot ring per (monitor, executor) with slot 0 = today,
//! accumulates in-flight reports into PingBatch accumulators, flushes them
//! to durable history on count or timer, rotates at local midnight, and
//! reloads its state from the last 30 days of history rows on startup.
//!
//! A single worker drains a bounded report channel; producers never block.

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{AlertEngine, AvailabilitySnapshot};
use crate::config::SentinelConfig;
use crate::error::AppResult;
use crate::model::ServiceHistory;
use crate::repository::ServiceRepository;

/// Ring length in days; slot 0 is today
pub const RING_DAYS: usize = 30;

/// Executor identity: None means the server ran the probe
pub type ExecutorId = Option<Uuid>;

type Key = (Uuid, ExecutorId);

/// One probe outcome entering the sentinel
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub monitor_id: Uuid,
    pub executor: ExecutorId,
    pub success: bool,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub error_message: Option<String>,
    /// Opaque metadata carried into history rows, e.g. TLS cert facts
    pub metadata: Option<serde_json::Value>,
}

/// 30-slot per-day aggregates for one (monitor, executor)
#[derive(Debug, Clone)]
pub struct MonthlyStatus {
    pub avg_delay: [f64; RING_DAYS],
    pub up: [u64; RING_DAYS],
    pub down: [u64; RING_DAYS],
    pub last_update: DateTime<Utc>,
}

impl Default for MonthlyStatus {
    fn default() -> Self {
        Self {
            avg_delay: [0.0; RING_DAYS],
            up: [0; RING_DAYS],
            down: [0; RING_DAYS],
            last_update: Utc::now(),
        }
    }
}

impl MonthlyStatus {
    /// Weighted-mean merge into an arbitrary slot
    ///
    /// avg' = (avg_old * up_old + avg_new * up_new) / (up_old + up_new)
    fn merge_slot(&mut self, idx: usize, avg: f64, up: u64, down: u64) {
        let old_up = self.up[idx];
        let total_up = old_up + up;
        if total_up > 0 {
            self.avg_delay[idx] =
                (self.avg_delay[idx] * old_up as f64 + avg * up as f64) / total_up as f64;
        }
        self.up[idx] = total_up;
        self.down[idx] += down;
        self.last_update = Utc::now();
    }

    /// Shift slots right by one day; slot 29 is discarded, slot 0 is
    /// seeded from today's running totals when present.
    fn rotate(&mut self, today: Option<&TodayStats>) {
        for i in (1..RING_DAYS).rev() {
            self.avg_delay[i] = self.avg_delay[i - 1];
            self.up[i] = self.up[i - 1];
            self.down[i] = self.down[i - 1];
        }
        match today {
            Some(t) => {
                self.avg_delay[0] = t.avg_delay;
                self.up[0] = t.up;
                self.down[0] = t.down;
            }
            None => {
                self.avg_delay[0] = 0.0;
                self.up[0] = 0;
                self.down[0] = 0;
            }
        }
        self.last_update = Utc::now();
    }
}

/// Running totals for the current day, cleared at midnight
#[derive(Debug, Clone, Default)]
pub struct TodayStats {
    pub avg_delay: f64,
    pub up: u64,
    pub down: u64,
}

impl TodayStats {
    fn merge(&mut self, avg: f64, up: u64, down: u64) {
        let total_up = self.up + up;
        if total_up > 0 {
            self.avg_delay = (self.avg_delay * self.up as f64 + avg * up as f64) / total_up as f64;
        }
        self.up = total_up;
        self.down += down;
    }
}

/// In-flight accumulator keyed by (monitor, executor)
#[derive(Debug, Clone)]
pub struct PingBatch {
    total_latency: f64,
    count: u64,
    up: u64,
    down: u64,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl PingBatch {
    fn new() -> Self {
        Self {
            total_latency: 0.0,
            count: 0,
            up: 0,
            down: 0,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    fn add(&mut self, report: &ProbeReport) {
        self.count += 1;
        if report.success {
            self.up += 1;
            self.total_latency += report.latency_ms;
        } else {
            self.down += 1;
        }
        if report.metadata.is_some() {
            self.metadata = report.metadata.clone();
        }
    }

    /// total_latency / up, guarded against up = 0
    fn avg_delay(&self) -> f64 {
        if self.up == 0 {
            0.0
        } else {
            self.total_latency / self.up as f64
        }
    }
}

/// Availability status code for the aggregated view
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StatusCode {
    Good,
    LowAvailability,
    Down,
    Unknown,
}

impl StatusCode {
    pub fn from_totals(total: u64, uptime_percent: f64) -> Self {
        if total == 0 {
            StatusCode::Unknown
        } else if uptime_percent >= 95.0 {
            StatusCode::Good
        } else if uptime_percent >= 80.0 {
            StatusCode::LowAvailability
        } else {
            StatusCode::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Good => "Good",
            StatusCode::LowAvailability => "LowAvailability",
            StatusCode::Down => "Down",
            StatusCode::Unknown => "Unknown",
        }
    }
}

/// Per-monitor aggregated view across all executors
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStats {
    pub monitor_id: Uuid,
    pub delay: [f64; RING_DAYS],
    pub up: [u64; RING_DAYS],
    pub down: [u64; RING_DAYS],
    pub total_up: u64,
    pub total_down: u64,
    pub uptime_percent: f64,
    pub status: StatusCode,
    pub today_up: u64,
    pub today_down: u64,
    pub today_avg_delay: f64,
    pub last_update: DateTime<Utc>,
}

#[derive(Default)]
struct SentinelState {
    batches: HashMap<Key, PingBatch>,
    monthly: HashMap<Key, MonthlyStatus>,
    today: HashMap<Key, TodayStats>,
}

/// The sentinel engine; owns all rolling-window state
pub struct ServiceSentinel {
    state: Mutex<SentinelState>,
    report_tx: mpsc::Sender<ProbeReport>,
    report_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ProbeReport>>>,
    services: Arc<dyn ServiceRepository>,
    alerts: Arc<dyn AlertEngine>,
    config: SentinelConfig,
    dropped_reports: AtomicU64,
}

impl ServiceSentinel {
    pub fn new(
        services: Arc<dyn ServiceRepository>,
        alerts: Arc<dyn AlertEngine>,
        config: SentinelConfig,
    ) -> Arc<Self> {
        let (report_tx, report_rx) = mpsc::channel(config.report_channel_capacity);
        Arc::new(Self {
            state: Mutex::new(SentinelState::default()),
            report_tx,
            report_rx: tokio::sync::Mutex::new(Some(report_rx)),
            services,
            alerts,
            config,
            dropped_reports: AtomicU64::new(0),
        })
    }

    /// Non-blocking report ingestion; drops with a warning when saturated
    pub fn dispatch_report(&self, report: ProbeReport) {
        if let Err(e) = self.report_tx.try_send(report) {
            self.dropped_reports.fetch_add(1, Ordering::Relaxed);
            warn!("Sentinel report channel saturated, report dropped: {}", e);
        }
    }

    pub fn dropped_reports(&self) -> u64 {
        self.dropped_reports.load(Ordering::Relaxed)
    }

    /// Rebuild the rings from the last 30 days of history rows
    pub async fn reload_from_history(&self) -> AppResult<()> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::days(RING_DAYS as i64);
        let rows = self.services.list_history_since(cutoff).await?;
        let row_count = rows.len();

        let mut state = self.state.lock();
        for row in rows {
            let key = (row.monitor_id, row.executor);
            let age_secs = (now - row.created_at).num_seconds().max(0);
            let day = ((age_secs / 86_400) as usize).min(RING_DAYS - 1);
            state
                .monthly
                .entry(key)
                .or_default()
                .merge_slot(day, row.avg_delay, row.up, row.down);
            if day == 0 {
                state
                    .today
                    .entry(key)
                    .or_default()
                    .merge(row.avg_delay, row.up, row.down);
            }
        }
        info!("Sentinel reloaded {} history rows", row_count);
        Ok(())
    }

    /// Spawn the report worker, the coordinated flush ticker and the
    /// midnight rotator.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let sentinel = Arc::clone(self);
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            let Some(mut rx) = sentinel.report_rx.lock().await.take() else {
                warn!("Sentinel report worker already started");
                return;
            };
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    report = rx.recv() => match report {
                        Some(report) => sentinel.handle_report(report).await,
                        None => break,
                    }
                }
            }
        });

        let sentinel = Arc::clone(self);
        let flush_cancel = cancel.clone();
        let flush_interval = std::time::Duration::from_secs(self.config.flush_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = flush_cancel.cancelled() => break,
                    _ = ticker.tick() => sentinel.flush_all().await,
                }
            }
        });

        let sentinel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = duration_until_local_midnight();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        info!("Sentinel midnight rotation");
                        sentinel.rotate();
                    }
                }
            }
        });
    }

    /// Flush remaining batches; called on shutdown
    pub async fn shutdown(&self) {
        self.flush_all().await;
    }

    async fn handle_report(&self, report: ProbeReport) {
        let key = (report.monitor_id, report.executor);
        let flushed = {
            let mut state = self.state.lock();
            let batch = state.batches.entry(key).or_insert_with(PingBatch::new);
            batch.add(&report);
            if batch.count >= self.config.batch_flush_threshold {
                state.batches.remove(&key).map(|b| vec![(key, b)])
            } else {
                None
            }
        };
        if let Some(batches) = flushed {
            self.flush_batches(batches).await;
        }
        self.evaluate_alerts(report.monitor_id);
    }

    /// Coordinated flush of every in-flight batch
    pub async fn flush_all(&self) {
        let batches: Vec<(Key, PingBatch)> = {
            let mut state = self.state.lock();
            state.batches.drain().collect()
        };
        self.flush_batches(batches).await;
    }

    /// Persist batches as history rows, then merge them into today's slot
    /// and the running today totals. Persistence failures are logged; the
    /// in-memory merge still happens so the live view stays current.
    async fn flush_batches(&self, batches: Vec<(Key, PingBatch)>) {
        if batches.is_empty() {
            return;
        }

        let rows: Vec<ServiceHistory> = batches
            .iter()
            .map(|(key, batch)| ServiceHistory {
                monitor_id: key.0,
                executor: key.1,
                created_at: Utc::now(),
                avg_delay: batch.avg_delay(),
                up: batch.up,
                down: batch.down,
                metadata: batch.metadata.clone(),
            })
            .collect();
        if let Err(e) = self.services.insert_history_batch(rows).await {
            warn!("Failed to persist service history batch: {}", e);
        }

        let mut state = self.state.lock();
        for (key, batch) in batches {
            let avg = batch.avg_delay();
            state
                .monthly
                .entry(key)
                .or_default()
                .merge_slot(0, avg, batch.up, batch.down);
            state
                .today
                .entry(key)
                .or_default()
                .merge(avg, batch.up, batch.down);
        }
    }

    /// Midnight rotation: shift every ring, seed slot 0 from the running
    /// today totals when present, then clear them.
    pub fn rotate(&self) {
        let mut state = self.state.lock();
        let SentinelState { monthly, today, .. } = &mut *state;
        for (key, status) in monthly.iter_mut() {
            status.rotate(today.get(key));
        }
        today.clear();
    }

    /// Per-monitor aggregated view across all executors
    pub fn copy_stats(&self) -> HashMap<Uuid, ServiceStats> {
        let state = self.state.lock();
        let mut out: HashMap<Uuid, ServiceStats> = HashMap::new();

        for ((monitor_id, _executor), status) in state.monthly.iter() {
            let entry = out.entry(*monitor_id).or_insert_with(|| ServiceStats {
                monitor_id: *monitor_id,
                delay: [0.0; RING_DAYS],
                up: [0; RING_DAYS],
                down: [0; RING_DAYS],
                total_up: 0,
                total_down: 0,
                uptime_percent: 0.0,
                status: StatusCode::Unknown,
                today_up: 0,
                today_down: 0,
                today_avg_delay: 0.0,
                last_update: status.last_update,
            });
            for i in 0..RING_DAYS {
                let old_up = entry.up[i];
                let total_up = old_up + status.up[i];
                if total_up > 0 {
                    entry.delay[i] = (entry.delay[i] * old_up as f64
                        + status.avg_delay[i] * status.up[i] as f64)
                        / total_up as f64;
                }
                entry.up[i] = total_up;
                entry.down[i] += status.down[i];
            }
            if status.last_update > entry.last_update {
                entry.last_update = status.last_update;
            }
        }

        for ((monitor_id, _executor), today) in state.today.iter() {
            if let Some(entry) = out.get_mut(monitor_id) {
                let total_up = entry.today_up + today.up;
                if total_up > 0 {
                    entry.today_avg_delay = (entry.today_avg_delay * entry.today_up as f64
                        + today.avg_delay * today.up as f64)
                        / total_up as f64;
                }
                entry.today_up = total_up;
                entry.today_down += today.down;
            }
        }

        for stats in out.values_mut() {
            stats.total_up = stats.up.iter().sum();
            stats.total_down = stats.down.iter().sum();
            let total = stats.total_up + stats.total_down;
            stats.uptime_percent = if total == 0 {
                0.0
            } else {
                stats.total_up as f64 / total as f64 * 100.0
            };
            stats.status = StatusCode::from_totals(total, stats.uptime_percent);
        }

        out
    }

    /// Fire-and-forget evaluation of today's availability for a monitor
    fn evaluate_alerts(&self, monitor_id: Uuid) {
        let snapshot = {
            let state = self.state.lock();
            let mut up = 0u64;
            let mut down = 0u64;
            let mut avg = 0.0f64;
            for ((id, _), today) in state.today.iter() {
                if *id != monitor_id {
                    continue;
                }
                let total_up = up + today.up;
                if total_up > 0 {
                    avg = (avg * up as f64 + today.avg_delay * today.up as f64) / total_up as f64;
                }
                up = total_up;
                down += today.down;
            }
            let total = up + down;
            AvailabilitySnapshot {
                monitor_id,
                kind: "availability".to_string(),
                uptime_percent: if total == 0 {
                    100.0
                } else {
                    up as f64 / total as f64 * 100.0
                },
                avg_delay_ms: avg,
                cert: None,
                timestamp: Utc::now(),
            }
        };

        let engine = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            if let Err(e) = engine.evaluate_service_rules(snapshot).await {
                debug!("Alert evaluation failed: {}", e);
            }
        });
    }

    /// Snapshot of one ring, for tests and diagnostics
    pub fn monthly_status(&self, monitor_id: Uuid, executor: ExecutorId) -> Option<MonthlyStatus> {
        self.state
            .lock()
            .monthly
            .get(&(monitor_id, executor))
            .cloned()
    }

    /// Seed one ring directly, for tests and diagnostics
    pub fn seed_monthly_status(
        &self,
        monitor_id: Uuid,
        executor: ExecutorId,
        status: MonthlyStatus,
    ) {
        self.state
            .lock()
            .monthly
            .insert((monitor_id, executor), status);
    }
}

/// Time until the next local midnight
fn duration_until_local_midnight() -> std::time::Duration {
    let now = Local::now();
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
    let next = Local
        .from_local_datetime(&midnight)
        .earliest()
        .unwrap_or(now + ChronoDuration::days(1));
    (next - now)
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_mean_merge() {
        let mut status = MonthlyStatus::default();
        status.merge_slot(0, 100.0, 10, 0);
        status.merge_slot(0, 200.0, 10, 2);

        assert_eq!(status.up[0], 20);
        assert_eq!(status.down[0], 2);
        assert!((status.avg_delay[0] - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_with_zero_up_keeps_delay() {
        let mut status = MonthlyStatus::default();
        status.merge_slot(0, 100.0, 10, 0);
        status.merge_slot(0, 0.0, 0, 5);

        assert_eq!(status.up[0], 10);
        assert_eq!(status.down[0], 5);
        assert!((status.avg_delay[0] - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rotation_shifts_and_seeds_slot_zero() {
        let mut status = MonthlyStatus::default();
        status.up[0] = 10;
        status.avg_delay[0] = 42.0;
        status.up[29] = 99;

        status.rotate(None);
        assert_eq!(status.up[0], 0);
        assert_eq!(status.up[1], 10);
        assert!((status.avg_delay[1] - 42.0).abs() < f64::EPSILON);
        // slot 29 contents discarded, replaced by former slot 28
        assert_eq!(status.up[29], 0);

        let today = TodayStats {
            avg_delay: 7.0,
            up: 3,
            down: 1,
        };
        status.rotate(Some(&today));
        assert_eq!(status.up[0], 3);
        assert_eq!(status.down[0], 1);
        assert_eq!(status.up[2], 10);
    }

    #[test]
    fn batch_avg_guards_against_zero_up() {
        let mut batch = PingBatch::new();
        batch.add(&ProbeReport {
            monitor_id: Uuid::new_v4(),
            executor: None,
            success: false,
            latency_ms: 500.0,
            timestamp: Utc::now(),
            error_message: Some("timeout".to_string()),
            metadata: None,
        });
        assert_eq!(batch.avg_delay(), 0.0);
        assert_eq!(batch.down, 1);
    }

    #[test]
    fn status_code_thresholds() {
        assert_eq!(StatusCode::from_totals(0, 0.0), StatusCode::Unknown);
        assert_eq!(StatusCode::from_totals(100, 95.0), StatusCode::Good);
        assert_eq!(StatusCode::from_totals(100, 94.9), StatusCode::LowAvailability);
        assert_eq!(StatusCode::from_totals(100, 80.0), StatusCode::LowAvailability);
        assert_eq!(StatusCode::from_totals(100, 79.9), StatusCode::Down);
    }

    #[test]
    fn midnight_is_within_a_day() {
        let wait = duration_until_local_midnight();
        assert!(wait <= std::time::Duration::from_secs(86_400));
    }
}
