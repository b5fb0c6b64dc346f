//! TLS configuration for connections to the ClickHouse HTTP interface

use crate::error::{FerruleError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// TLS trust settings
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Verify the server certificate chain
    pub verify: bool,
    /// Extra CA certificate (PEM) trusted in addition to the webpki roots
    pub ca_path: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            verify: true,
            ca_path: None,
        }
    }
}

impl TlsSettings {
    /// Load the configured CA certificates, if any
    pub fn load_ca_certs(&self) -> Result<Vec<CertificateDer<'static>>> {
        match &self.ca_path {
            Some(path) => {
                let pem = fs::read(Path::new(path))
                    .map_err(|e| FerruleError::Tls(format!("Failed to read CA: {}", e)))?;
                let certs = parse_pem_certs(&pem)?;
                if certs.is_empty() {
                    return Err(FerruleError::Tls("No CA certificate found".into()));
                }
                Ok(certs)
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Parse PEM-encoded certificates
fn parse_pem_certs(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem_data);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FerruleError::Tls(format!("Failed to parse certificates: {}", e)))?;
    Ok(certs)
}

/// Create a rustls client config for connecting to ClickHouse over HTTPS
pub fn create_client_tls_config(settings: &TlsSettings) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| FerruleError::Tls(format!("Failed to select protocol versions: {}", e)))?;

    let config = if settings.verify {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        for ca in settings.load_ca_certs()? {
            root_store.add(ca).map_err(|e| {
                FerruleError::Tls(format!("Failed to add CA certificate: {}", e))
            })?;
        }

        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification { provider }))
            .with_no_client_auth()
    };

    Ok(config)
}

/// Certificate verifier that accepts any certificate.
///
/// Only installed when `verify` is false, e.g. for the offline cluster
/// reached over a private network.
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_without_verification() {
        let settings = TlsSettings {
            verify: false,
            ca_path: None,
        };
        assert!(create_client_tls_config(&settings).is_ok());
    }

    #[test]
    fn test_client_config_with_default_roots() {
        assert!(create_client_tls_config(&TlsSettings::default()).is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let settings = TlsSettings {
            verify: true,
            ca_path: Some("/nonexistent/ferrule-ca.pem".into()),
        };
        let err = create_client_tls_config(&settings).unwrap_err();
        assert_eq!(err.code(), "TLS_ERROR");
    }

    #[test]
    fn test_parse_empty_pem() {
        assert!(parse_pem_certs(b"").unwrap().is_empty());
    }
}
