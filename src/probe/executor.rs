//! Server-side probe execution
//!
//! Executes HTTP/TCP/ICMP probes in-process. The shared HTTP client runs
//! with TLS verification disabled and a 30s timeout; HTTPS targets get a
//! certificate inspection pass whose facts ride along with the result.

use chrono::Utc;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use surge_ping::{PingIdentifier, PingSequence, ICMP};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::config::ProbeConfig;
use crate::error::AppResult;
use crate::model::{CertificateInfo, ProbeKind, ProbeResult, ServiceMonitor};
use crate::probe::tls;

/// Bytes read from an HTTP response at most
const HTTP_READ_LIMIT: usize = 10 * 1024;
/// Bytes kept in the stored result at most
const BODY_KEEP_LIMIT: usize = 1024;
/// ICMP echo payload
const ICMP_PAYLOAD: [u8; 56] = [0; 56];

/// Result of a server-side probe run
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub result: ProbeResult,
    pub cert: Option<CertificateInfo>,
}

/// Executes probes in-process
pub struct ProbeExecutor {
    http: reqwest::Client,
    config: ProbeConfig,
}

impl ProbeExecutor {
    pub fn new(config: ProbeConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { http, config })
    }

    pub async fn execute(&self, monitor: &ServiceMonitor) -> ProbeOutcome {
        match monitor.kind {
            ProbeKind::Http => self.probe_http(monitor).await,
            ProbeKind::Tcp => self.probe_tcp(monitor).await,
            ProbeKind::Icmp => self.probe_icmp(monitor).await,
        }
    }

    async fn probe_http(&self, monitor: &ServiceMonitor) -> ProbeOutcome {
        let mut result = blank_result(monitor);
        let started = Instant::now();

        let method = monitor
            .http_method
            .as_deref()
            .and_then(|m| reqwest::Method::from_bytes(m.as_bytes()).ok())
            .unwrap_or(reqwest::Method::GET);
        let mut request = self.http.request(method, &monitor.target);
        if let Some(headers) = &monitor.http_headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        let expect_status = monitor.expect_status.unwrap_or(200);

        match request.send().await {
            Err(e) => {
                result.latency_ms = elapsed_ms(started);
                result.error_message = Some(e.to_string());
            }
            Ok(response) => {
                let status = response.status().as_u16();
                result.http_status = Some(status);
                let body = read_limited(response, HTTP_READ_LIMIT).await;
                result.latency_ms = elapsed_ms(started);

                let body_text = String::from_utf8_lossy(&body).to_string();
                result.response_body = Some(truncate_utf8(&body_text, BODY_KEEP_LIMIT));

                let status_ok = status == expect_status;
                let body_ok = monitor
                    .expect_body
                    .as_deref()
                    .map(|expected| expected.is_empty() || body_text.contains(expected))
                    .unwrap_or(true);
                result.success = status_ok && body_ok;
                if !status_ok {
                    result.error_message = Some(format!(
                        "unexpected status {status}, expected {expect_status}"
                    ));
                } else if !body_ok {
                    result.error_message =
                        Some("response body missing expected content".to_string());
                }
            }
        }

        let cert = self.inspect_https_target(monitor, &mut result).await;
        ProbeOutcome { result, cert }
    }

    /// On HTTPS targets, capture certificate facts and annotate the result
    /// when expiry is near.
    async fn inspect_https_target(
        &self,
        monitor: &ServiceMonitor,
        result: &mut ProbeResult,
    ) -> Option<CertificateInfo> {
        if !monitor.target.starts_with("https://") {
            return None;
        }
        let url = Url::parse(&monitor.target).ok()?;
        let host = url.host_str()?;
        let port = url.port().unwrap_or(443);
        let timeout = Duration::from_secs(self.config.http_timeout_secs);

        match tls::inspect_certificate(host, port, timeout).await {
            Ok(info) => {
                if info.days_to_expiry < 7 {
                    append_note(
                        &mut result.error_message,
                        &format!("Critical: certificate expires in {} days", info.days_to_expiry),
                    );
                } else if info.days_to_expiry < 30 {
                    append_note(
                        &mut result.error_message,
                        &format!("Warning: certificate expires in {} days", info.days_to_expiry),
                    );
                }
                Some(info)
            }
            Err(e) => {
                debug!("Certificate inspection failed for {}: {}", monitor.target, e);
                None
            }
        }
    }

    async fn probe_tcp(&self, monitor: &ServiceMonitor) -> ProbeOutcome {
        let mut result = blank_result(monitor);
        let timeout = Duration::from_secs(if monitor.timeout_seconds > 0 {
            monitor.timeout_seconds
        } else {
            self.config.tcp_dial_timeout_secs
        });
        let started = Instant::now();

        let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(&monitor.target))
            .await
        {
            Err(_) => {
                result.latency_ms = elapsed_ms(started);
                result.error_message = Some("connect timed out".to_string());
                return ProbeOutcome { result, cert: None };
            }
            Ok(Err(e)) => {
                result.latency_ms = elapsed_ms(started);
                result.error_message = Some(e.to_string());
                return ProbeOutcome { result, cert: None };
            }
            Ok(Ok(stream)) => stream,
        };
        result.latency_ms = elapsed_ms(started);
        result.success = true;

        if let Some(payload) = monitor.tcp_send.as_deref().filter(|p| !p.is_empty()) {
            if let Err(e) = stream.write_all(payload.as_bytes()).await {
                result.success = false;
                result.error_message = Some(format!("send failed: {e}"));
                return ProbeOutcome { result, cert: None };
            }
        }

        if let Some(expected) = monitor.tcp_expect.as_deref().filter(|e| !e.is_empty()) {
            let mut buf = vec![0u8; BODY_KEEP_LIMIT];
            match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                Err(_) => {
                    result.success = false;
                    result.error_message = Some("read timed out".to_string());
                }
                Ok(Err(e)) => {
                    result.success = false;
                    result.error_message = Some(format!("read failed: {e}"));
                }
                Ok(Ok(n)) => {
                    let text = String::from_utf8_lossy(&buf[..n]).to_string();
                    if !text.contains(expected) {
                        result.success = false;
                        result.error_message =
                            Some("expected content not found in response".to_string());
                    }
                    result.response_body = Some(truncate_utf8(&text, BODY_KEEP_LIMIT));
                }
            }
        }

        ProbeOutcome { result, cert: None }
    }

    async fn probe_icmp(&self, monitor: &ServiceMonitor) -> ProbeOutcome {
        let mut result = blank_result(monitor);
        let timeout = Duration::from_secs(if monitor.timeout_seconds > 0 {
            monitor.timeout_seconds
        } else {
            self.config.icmp_timeout_secs
        });

        let ip = match resolve_target(&monitor.target).await {
            Some(ip) => ip,
            None => {
                result.error_message = Some(format!("cannot resolve {}", monitor.target));
                return ProbeOutcome { result, cert: None };
            }
        };

        let cfg = match ip {
            IpAddr::V4(_) => surge_ping::Config::default(),
            IpAddr::V6(_) => surge_ping::Config::builder().kind(ICMP::V6).build(),
        };
        let client = match surge_ping::Client::new(&cfg) {
            Ok(client) => client,
            Err(e) => {
                result.error_message = Some(format!("icmp socket unavailable: {e}"));
                return ProbeOutcome { result, cert: None };
            }
        };

        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(timeout);

        let mut received = 0u32;
        let mut total_rtt_ms = 0.0f64;
        for seq in 0..self.config.icmp_count {
            match pinger.ping(PingSequence(seq as u16), &ICMP_PAYLOAD).await {
                Ok((_, rtt)) => {
                    received += 1;
                    total_rtt_ms += rtt.as_secs_f64() * 1000.0;
                }
                Err(e) => debug!("Ping {} seq {} failed: {}", monitor.target, seq, e),
            }
        }

        if received > 0 {
            result.success = true;
            result.latency_ms = total_rtt_ms / received as f64;
        } else {
            result.error_message = Some("no icmp replies received".to_string());
        }
        ProbeOutcome { result, cert: None }
    }
}

fn blank_result(monitor: &ServiceMonitor) -> ProbeResult {
    ProbeResult {
        monitor_id: monitor.id,
        timestamp: Utc::now(),
        success: false,
        latency_ms: 0.0,
        http_status: None,
        response_body: None,
        error_message: None,
        executor: None,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

async fn read_limited(mut response: reqwest::Response, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        buf.extend_from_slice(&chunk);
        if buf.len() >= limit {
            buf.truncate(limit);
            break;
        }
    }
    buf
}

/// Byte-bounded truncation on a char boundary
fn truncate_utf8(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Append a note to an error message without clobbering what is there
fn append_note(message: &mut Option<String>, note: &str) {
    match message {
        Some(existing) => {
            existing.push_str("; ");
            existing.push_str(note);
        }
        None => *message = Some(note.to_string()),
    }
}

async fn resolve_target(target: &str) -> Option<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some(ip);
    }
    tokio::net::lookup_host((target, 0u16))
        .await
        .ok()?
        .next()
        .map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let out = truncate_utf8(text, 2);
        assert!(out.len() <= 2);
        assert!(text.starts_with(&out));
        assert_eq!(truncate_utf8("short", 1024), "short");
    }

    #[test]
    fn append_note_preserves_existing_message() {
        let mut message = Some("unexpected status 500, expected 200".to_string());
        append_note(&mut message, "Critical: certificate expires in 5 days");
        let text = message.unwrap();
        assert!(text.contains("unexpected status 500"));
        assert!(text.contains("Critical: certificate expires in 5 days"));

        let mut empty = None;
        append_note(&mut empty, "Warning: certificate expires in 20 days");
        assert_eq!(
            empty.as_deref(),
            Some("Warning: certificate expires in 20 days")
        );
    }

    #[tokio::test]
    async fn resolve_accepts_literal_addresses() {
        assert_eq!(
            resolve_target("127.0.0.1").await,
            Some("127.0.0.1".parse::<IpAddr>().unwrap())
        );
    }

    #[tokio::test]
    async fn tcp_probe_reports_unreachable_target() {
        let executor = ProbeExecutor::new(ProbeConfig::default()).unwrap();
        let mut monitor = ServiceMonitor::new(
            "dead".to_string(),
            ProbeKind::Tcp,
            "127.0.0.1:1".to_string(),
            30,
        );
        monitor.timeout_seconds = 1;

        let outcome = executor.execute(&monitor).await;
        assert!(!outcome.result.success);
        assert!(outcome.result.error_message.is_some());
    }
}
