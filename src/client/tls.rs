//! TLS support for control connections
//!
//! Builds a rustls client configuration from [`TlsConfig`] and performs the
//! handshake. Compiled only with the `tls` feature.

use std::io;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::utils::ConnectionError;

/// Upgrade a TCP stream to TLS.
///
/// `server_name` is used for SNI and certificate verification; it falls
/// back to the connection host when no explicit SNI is configured.
pub(crate) async fn wrap_tls(
    tcp: TcpStream,
    server_name: &str,
    config: &TlsConfig,
) -> Result<TlsStream<TcpStream>, ConnectionError> {
    let client_config = build_client_config(config)
        .map_err(|e| ConnectionError::TlsFailed(e.to_string()))?;
    let connector = TlsConnector::from(Arc::new(client_config));

    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| ConnectionError::TlsFailed(format!("invalid server name: {e}")))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ConnectionError::TlsFailed(e.to_string()))
}

fn build_client_config(config: &TlsConfig) -> io::Result<rustls::ClientConfig> {
    if config.skip_verify {
        tracing::warn!("TLS certificate verification is disabled");
        return build_insecure_config(config);
    }

    let roots = load_root_certs(config.ca_cert.as_deref())?;
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    if let Some((cert_path, key_path)) = config.client_identity() {
        let (certs, key) = load_client_identity(cert_path, key_path)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    } else {
        Ok(builder.with_no_client_auth())
    }
}

/// Loads root certificates from a custom CA file or the system trust store.
fn load_root_certs(ca_cert_path: Option<&Path>) -> io::Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();

    if let Some(path) = ca_cert_path {
        let pem = std::fs::read(path).map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("failed to read CA cert '{}': {e}", path.display()),
            )
        })?;
        let certs = CertificateDer::pem_slice_iter(&pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if certs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no certificates found in '{}'", path.display()),
            ));
        }

        for cert in certs {
            roots.add(cert).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid CA certificate: {e}"),
                )
            })?;
        }
    } else {
        let native_certs = rustls_native_certs::load_native_certs();
        for cert in native_certs.certs {
            roots.add(cert).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid native CA certificate: {e}"),
                )
            })?;
        }
    }

    Ok(roots)
}

fn load_client_identity(
    cert_path: &Path,
    key_path: &Path,
) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    Ok((certs, key))
}

fn build_insecure_config(config: &TlsConfig) -> io::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier));

    if let Some((cert_path, key_path)) = config.client_identity() {
        let (certs, key) = load_client_identity(cert_path, key_path)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    } else {
        Ok(builder.with_no_client_auth())
    }
}

/// A certificate verifier that accepts everything. Used with `skip_verify`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
