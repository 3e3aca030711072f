//! Configuration management module
//!
//! Provides TOML-based configuration with per-subsystem sections,
//! default-value fallback and validation. Search order mirrors the
//! usual layout: working directory first, then the user config dir.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server settings
    pub server: ServerConfig,
    /// Agent connection registry settings
    pub agent: AgentConfig,
    /// State collector settings
    pub collector: CollectorConfig,
    /// Service sentinel settings
    pub sentinel: SentinelConfig,
    /// Probe scheduler and executor settings
    pub probe: ProbeConfig,
    /// Terminal / docker session settings
    pub session: SessionConfig,
    /// Audit logger settings
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./fleetwatch.toml
    /// 2. ~/.config/fleetwatch/config.toml
    /// 3. Default configuration
    pub async fn load() -> AppResult<Self> {
        if let Ok(config) = Self::load_from_file("./fleetwatch.toml").await {
            info!("Loaded configuration from ./fleetwatch.toml");
            return Ok(config);
        }

        if let Some(config_path) = Self::user_config_path() {
            if let Ok(config) = Self::load_from_file(&config_path).await {
                info!("Loaded configuration from {}", config_path.display());
                return Ok(config);
            }
        }

        info!("Using default configuration");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).await.map_err(AppError::Io)?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| AppError::config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.agent.heartbeat_interval_secs == 0 {
            return Err(AppError::config(
                "agent.heartbeat_interval_secs must be greater than 0",
            ));
        }
        if self.agent.heartbeat_timeout_secs <= self.agent.heartbeat_interval_secs {
            return Err(AppError::config(
                "agent.heartbeat_timeout_secs must exceed the heartbeat interval",
            ));
        }
        if self.agent.task_queue_capacity == 0 {
            return Err(AppError::config(
                "agent.task_queue_capacity must be greater than 0",
            ));
        }
        if self.sentinel.report_channel_capacity == 0 {
            return Err(AppError::config(
                "sentinel.report_channel_capacity must be greater than 0",
            ));
        }
        if self.sentinel.batch_flush_threshold == 0 {
            return Err(AppError::config(
                "sentinel.batch_flush_threshold must be greater than 0",
            ));
        }
        if self.probe.icmp_count == 0 {
            return Err(AppError::config("probe.icmp_count must be greater than 0"));
        }
        Ok(())
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("fleetwatch");
            path.push("config.toml");
            path
        })
    }
}

/// Server-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the agent transport listener
    pub bind_addr: String,
    /// Public endpoint rendered into agent install commands
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8008".to_string(),
            public_url: "http://localhost:8008".to_string(),
        }
    }
}

/// Agent connection registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Heartbeat watchdog tick interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Seconds without activity before an agent is unregistered
    pub heartbeat_timeout_secs: u64,
    /// Bounded outbound task queue capacity per agent
    pub task_queue_capacity: usize,
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            task_queue_capacity: 100,
        }
    }
}

/// State collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Per-subscriber delivery channel capacity
    pub subscriber_capacity: usize,
    /// Janitor sweep interval in seconds
    pub janitor_interval_secs: u64,
    /// Subscribers idle longer than this are unsubscribed
    pub idle_cutoff_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 100,
            janitor_interval_secs: 300,
            idle_cutoff_secs: 1800,
        }
    }
}

/// Service sentinel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Bounded report channel capacity
    pub report_channel_capacity: usize,
    /// Coordinated batch flush interval in seconds
    pub flush_interval_secs: u64,
    /// Per-batch report count that triggers an early flush
    pub batch_flush_threshold: u64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            report_channel_capacity: 1000,
            flush_interval_secs: 300,
            batch_flush_threshold: 20,
        }
    }
}

/// Probe scheduler and executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Shared HTTP client timeout in seconds
    pub http_timeout_secs: u64,
    /// Default TCP dial timeout in seconds when the monitor has none
    pub tcp_dial_timeout_secs: u64,
    /// Default ICMP deadline in seconds when the monitor has none
    pub icmp_timeout_secs: u64,
    /// ICMP echo requests per probe
    pub icmp_count: u32,
    /// User-Agent header on HTTP probes
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            tcp_dial_timeout_secs: 10,
            icmp_timeout_secs: 20,
            icmp_count: 5,
            user_agent: format!("fleetwatch-probe/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Terminal / docker session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded per-direction channel capacity
    pub channel_capacity: usize,
    /// Hard ceiling on docker session lifetime in seconds
    pub docker_session_timeout_secs: u64,
    /// send_to_agent gives up after this many seconds on a full channel
    pub terminal_send_timeout_secs: u64,
    /// wait_for_ready polling interval in milliseconds
    pub ready_poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            docker_session_timeout_secs: 300,
            terminal_send_timeout_secs: 5,
            ready_poll_interval_ms: 100,
        }
    }
}

/// Audit logger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Bounded enqueue buffer capacity
    pub buffer_capacity: usize,
    /// Worker flushes when this many events have accumulated
    pub batch_size: usize,
    /// Worker flush interval in seconds
    pub flush_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            batch_size: 32,
            flush_interval_secs: 5,
        }
    }
}
