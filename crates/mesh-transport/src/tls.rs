//! Thin helpers over `rustls`/`tokio-rustls`. The spec does not mandate a
//! specific TLS library; the teacher crate doesn't use one, so this is
//! sourced from the pack's `rustls` usage (`paritytech-polkadot-sdk`).

use std::io::BufReader;
use std::sync::Arc;

use mesh_error::MeshError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

/// Loads a PEM-encoded certificate chain.
pub fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, MeshError> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MeshError::fatal(format!("failed to parse certificate chain: {e}")))
}

/// Loads a PEM-encoded PKCS8 or RSA private key.
pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, MeshError> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| MeshError::fatal(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| MeshError::fatal("no private key found in PEM input"))
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>, MeshError> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| MeshError::fatal(format!("invalid TLS server config: {e}")))?;
    Ok(Arc::new(config))
}

pub fn client_config_trusting(
    root_certs: Vec<CertificateDer<'static>>,
) -> Result<Arc<rustls::ClientConfig>, MeshError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in root_certs {
        roots
            .add(cert)
            .map_err(|e| MeshError::fatal(format!("invalid root certificate: {e}")))?;
    }
    let config =
        rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, MeshError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| MeshError::fatal(format!("invalid TLS server name {host}: {e}")))
}
