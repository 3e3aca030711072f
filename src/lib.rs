//! Fleetwatch - agent monitoring core for a host fleet observability platform
//!
//! This library implements the control-plane server that owns:
//! - persistent bidirectional streams from remote monitoring agents
//! - host state telemetry ingestion with traffic accounting
//! - interactive shell and container sessions multiplexed over the
//!   agent transport
//! - cron-driven HTTP/TCP/ICMP probe dispatch with strategy-based
//!   executor selection
//! - an in-memory 30-day rolling availability engine with periodic
//!   batch persistence
//! - fan-out of real-time host state to UI subscribers
//!
//! Persistence and alert delivery are external collaborators behind the
//! traits in [`repository`] and [`alert`].

pub mod agent;
pub mod alert;
pub mod audit;
pub mod config;
pub mod error;
pub mod model;
pub mod probe;
pub mod repository;
pub mod sentinel;
pub mod server;
pub mod service;
pub mod session;
pub mod state;
pub mod transport;

pub use error::{AppError, AppResult};

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the logging system with structured logging
///
/// Log levels are configurable via the RUST_LOG environment variable.
pub fn initialize_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
