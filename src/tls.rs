//! TLS configuration for both ends of a channel.
//!
//! PEM material is loaded and validated at startup; anything malformed is a
//! `ConfigError` before a single byte hits the wire.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ConfigError;

/// Transport security selected by the caller at connect time.
pub enum Security {
    /// Plaintext. Only for tests and trusted links.
    Insecure,
    Tls(ClientTlsConfig),
}

/// Client-side TLS: a root of trust plus the name the server must present.
#[derive(Clone)]
pub struct ClientTlsConfig {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTlsConfig {
    pub fn from_ca_pem(ca_pem: &[u8], server_name: &str) -> Result<Self, ConfigError> {
        let mut roots = RootCertStore::empty();
        for cert in read_certs(ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| ConfigError::InvalidPem(e.to_string()))?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| ConfigError::InvalidServerName(server_name.to_owned()))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub fn from_ca_pem_file(path: impl AsRef<Path>, server_name: &str) -> Result<Self, ConfigError> {
        let pem = std::fs::read(path)?;
        Self::from_ca_pem(&pem, server_name)
    }

    pub(crate) fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub(crate) fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

/// Server-side TLS: a certificate chain and its private key.
#[derive(Clone)]
pub struct ServerTlsConfig {
    acceptor: TlsAcceptor,
}

impl ServerTlsConfig {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, ConfigError> {
        let certs = read_certs(cert_pem)?;
        let key = read_key(key_pem)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

fn read_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &*pem)
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::InvalidPem(e.to_string()))?;
    if certs.is_empty() {
        return Err(ConfigError::InvalidPem("no certificates found".into()));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut &*pem)
        .map_err(|e| ConfigError::InvalidPem(e.to_string()))?
        .ok_or_else(|| ConfigError::InvalidPem("no private key found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_pem_is_rejected_at_startup() {
        let err = ClientTlsConfig::from_ca_pem(b"not a certificate", "localhost");
        assert!(matches!(err, Err(ConfigError::InvalidPem(_))));

        let err = ServerTlsConfig::from_pem(b"garbage", b"garbage");
        assert!(matches!(err, Err(ConfigError::InvalidPem(_))));
    }

    #[test]
    fn bad_server_name_is_rejected() {
        // A valid CA is needed first, so feed the name check directly.
        assert!(ServerName::try_from("not a dns name".to_owned()).is_err());
    }
}
