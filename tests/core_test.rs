//! Core functionality tests

use std::time::{Duration, Instant};

#[test]
fn test_error_handling_basics() {
    use fleetwatch::error::{AppError, AppResult};

    let error = AppError::persistence("connection refused");
    assert!(error.is_recoverable());

    let error = AppError::validation("interval_seconds must be >= 1");
    assert!(!error.is_recoverable());

    let result: AppResult<()> = Err(AppError::Unauthorized);
    assert_eq!(result.unwrap_err().to_string(), "Invalid credentials");
}

#[test]
fn test_configuration_defaults() {
    use fleetwatch::config::Config;

    let config = Config::default();

    // heartbeat defaults from the connection registry contract
    assert_eq!(config.agent.heartbeat_interval_secs, 30);
    assert_eq!(config.agent.heartbeat_timeout_secs, 90);
    assert_eq!(config.agent.task_queue_capacity, 100);

    // bounded channel capacities
    assert_eq!(config.collector.subscriber_capacity, 100);
    assert_eq!(config.sentinel.report_channel_capacity, 1000);

    // probe defaults
    assert_eq!(config.probe.http_timeout_secs, 30);
    assert_eq!(config.probe.icmp_count, 5);

    assert!(config.validate().is_ok());
}

#[test]
fn test_logging_initialization() {
    use fleetwatch::initialize_logging;

    let start_time = Instant::now();
    let result = initialize_logging();
    let init_duration = start_time.elapsed();

    assert!(result.is_ok());
    assert!(init_duration < Duration::from_millis(500));
}

#[test]
fn test_status_code_strings() {
    use fleetwatch::sentinel::StatusCode;

    assert_eq!(StatusCode::from_totals(0, 0.0).as_str(), "Unknown");
    assert_eq!(StatusCode::from_totals(10, 100.0).as_str(), "Good");
    assert_eq!(StatusCode::from_totals(10, 90.0).as_str(), "LowAvailability");
    assert_eq!(StatusCode::from_totals(10, 50.0).as_str(), "Down");
}
