//! TLS client setup for the tls and wss tunnel kinds.

use std::sync::Arc;

use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    ClientConfig, RootCertStore,
};

use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Build the rustls client config for a tunnel endpoint.
///
/// Trust, in order of precedence: skip verification entirely
/// (`tls_insecure_skip_verify`), a pinned root (`tls_ca`), otherwise the
/// bundled webpki roots. A client certificate is attached when configured.
pub fn build_client_config(config: &TunnelConfig) -> Result<Arc<ClientConfig>, TunnelError> {
    let builder = if config.tls_insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        let mut roots = RootCertStore::empty();
        match &config.tls_ca {
            Some(ca_path) => {
                for cert in load_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(|e| TunnelError::Config(format!("bad CA cert: {}", e)))?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        ClientConfig::builder().with_root_certificates(roots)
    };

    let client_config = match (&config.tls_client_cert, &config.tls_client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(client_config))
}

/// SNI server name for the handshake.
pub fn server_name(config: &TunnelConfig) -> Result<ServerName<'static>, TunnelError> {
    ServerName::try_from(config.sni().to_string())
        .map_err(|e| TunnelError::Config(format!("invalid SNI {:?}: {}", config.sni(), e)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let data = std::fs::read(path)
        .map_err(|e| TunnelError::Config(format!("failed to read {}: {}", path, e)))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::Cursor::new(&data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TunnelError::Config(format!("failed to parse {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(TunnelError::Config(format!(
            "no certificates found in {}",
            path
        )));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let data = std::fs::read(path)
        .map_err(|e| TunnelError::Config(format!("failed to read {}: {}", path, e)))?;
    let mut cursor = std::io::Cursor::new(&data);
    loop {
        match rustls_pemfile::read_one(&mut cursor)
            .map_err(|e| TunnelError::Config(format!("failed to parse {}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => {
                return Err(TunnelError::Config(format!(
                    "no private key found in {}",
                    path
                )));
            }
        }
    }
}

/// Certificate verifier that accepts anything. Used only when the config
/// explicitly opts in for self-signed relay links.
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
        rustls::crypto::CryptoProvider::get_default()
            .map(|provider| {
                provider
                    .signature_verification_algorithms
                    .supported_schemes()
            })
            .unwrap_or_default()
    }
}
