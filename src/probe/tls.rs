//! HTTPS certificate inspection
//!
//! Performs a direct TLS handshake with a no-verification verifier to
//! capture the peer certificate, then parses out the facts attached to
//! probe reports. Verification is intentionally skipped: the probe's job
//! is reachability and expiry tracking, not trust evaluation.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::{AppError, AppResult};
use crate::model::CertificateInfo;

/// Verifier that accepts any certificate; used only to capture the chain
#[derive(Debug)]
struct CaptureOnlyVerifier {
    provider: CryptoProvider,
}

impl ServerCertVerifier for CaptureOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Handshake with `host:port` and extract certificate facts
pub async fn inspect_certificate(
    host: &str,
    port: u16,
    timeout: Duration,
) -> AppResult<CertificateInfo> {
    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder_with_provider(Arc::new(provider.clone()))
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::transport(format!("tls config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(CaptureOnlyVerifier { provider }))
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| AppError::transport(format!("connect to {host}:{port} timed out")))??;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| AppError::validation(format!("invalid tls server name {host}: {e}")))?;
    let tls = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::transport(format!("tls handshake with {host} timed out")))??;

    let (_, session) = tls.get_ref();
    let chain = session
        .peer_certificates()
        .ok_or_else(|| AppError::transport(format!("no peer certificate from {host}")))?;
    let leaf = chain
        .first()
        .ok_or_else(|| AppError::transport(format!("empty certificate chain from {host}")))?;

    parse_certificate(leaf.as_ref())
}

fn parse_certificate(der: &[u8]) -> AppResult<CertificateInfo> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
        .map_err(|e| AppError::validation(format!("certificate parse failed: {e}")))?;

    let not_before = asn1_to_utc(cert.validity().not_before.timestamp());
    let not_after = asn1_to_utc(cert.validity().not_after.timestamp());
    let days_to_expiry = (not_after - Utc::now()).num_days();

    let dns_names = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        days_to_expiry,
        dns_names,
    })
}

fn asn1_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}
