//! Async audit logger
//!
//! Subsystem-tagged buffered writer. `enqueue` never blocks: a full
//! buffer drops the event with a warning. A background worker batches
//! events into the repository on size or interval and drains the buffer
//! on shutdown. Audit writes never surface errors to the originating
//! operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AuditConfig;
use crate::model::AuditEvent;
use crate::repository::AuditEventRepository;

/// Buffered, non-blocking audit writer
pub struct AuditLogger {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl AuditLogger {
    /// Create the logger and spawn its batching worker
    pub fn new(
        repository: Arc<dyn AuditEventRepository>,
        config: AuditConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(config.buffer_capacity);
        let batch_size = config.batch_size.max(1);
        let flush_interval = std::time::Duration::from_secs(config.flush_interval_secs.max(1));

        tokio::spawn(async move {
            enum WorkerEvent {
                Received(Option<AuditEvent>),
                Tick,
                Stop,
            }

            let mut batch: Vec<AuditEvent> = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.tick().await;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => WorkerEvent::Stop,
                    _ = ticker.tick() => WorkerEvent::Tick,
                    event = rx.recv() => WorkerEvent::Received(event),
                };
                match event {
                    WorkerEvent::Stop => {
                        // drain whatever is still buffered before exiting
                        while let Ok(event) = rx.try_recv() {
                            batch.push(event);
                        }
                        flush(&repository, &mut batch).await;
                        break;
                    }
                    WorkerEvent::Tick => {
                        flush(&repository, &mut batch).await;
                    }
                    WorkerEvent::Received(Some(event)) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            flush(&repository, &mut batch).await;
                        }
                    }
                    WorkerEvent::Received(None) => {
                        flush(&repository, &mut batch).await;
                        break;
                    }
                }
            }
        });

        Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    /// Non-blocking enqueue; drops on a full buffer
    pub fn enqueue(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Audit buffer full, event dropped");
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn flush(repository: &Arc<dyn AuditEventRepository>, batch: &mut Vec<AuditEvent>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    if let Err(e) = repository.insert_events(events).await {
        warn!("Failed to persist {} audit events: {}", count, e);
    } else {
        debug!("Flushed {} audit events", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryAuditRepository;

    #[tokio::test]
    async fn events_reach_the_repository_in_batches() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let config = AuditConfig {
            buffer_capacity: 16,
            batch_size: 2,
            flush_interval_secs: 60,
        };
        let cancel = CancellationToken::new();
        let logger = AuditLogger::new(repo.clone(), config, cancel.clone());

        logger.enqueue(AuditEvent::host_system_event(uuid::Uuid::new_v4(), "register"));
        logger.enqueue(AuditEvent::host_system_event(uuid::Uuid::new_v4(), "register"));

        // batch_size reached, worker flushes without waiting for the timer
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(repo.list_events(Some("host")).await.unwrap().len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn shutdown_drains_pending_events() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let config = AuditConfig {
            buffer_capacity: 16,
            batch_size: 100,
            flush_interval_secs: 3600,
        };
        let cancel = CancellationToken::new();
        let logger = AuditLogger::new(repo.clone(), config, cancel.clone());

        logger.enqueue(AuditEvent::host_system_event(uuid::Uuid::new_v4(), "delete"));
        cancel.cancel();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(repo.list_events(None).await.unwrap().len(), 1);
    }
}
