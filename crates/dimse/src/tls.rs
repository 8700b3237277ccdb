//! TLS support for DICOM connections
//!
//! Settings are always available so configuration files parse the same way
//! with or without the `tls` feature. Building connectors and acceptors
//! requires the feature.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Certificate material for one side of a TLS connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain presented to the peer
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`
    pub key_path: Option<PathBuf>,
    /// PEM CA bundle used to verify the peer. On the server side its
    /// presence turns on client certificate verification.
    pub ca_path: Option<PathBuf>,
    /// Name to verify the server certificate against, defaults to the host
    pub server_name: Option<String>,
}

#[cfg(feature = "tls")]
pub use imp::{ClientTls, ServerTls};

#[cfg(feature = "tls")]
mod imp {
    use std::fmt;
    use std::path::Path;
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use tokio_rustls::rustls::server::WebPkiClientVerifier;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
    use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

    use super::TlsSettings;
    use crate::error::{DimseError, Result};

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let data = std::fs::read(path)
            .map_err(|e| DimseError::config(format!("failed to read certificate {}: {}", path.display(), e)))?;
        let certs = rustls_pemfile::certs(&mut &*data)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DimseError::config(format!("invalid PEM certificate {}: {}", path.display(), e)))?;
        if certs.is_empty() {
            return Err(DimseError::config(format!("no certificate in {}", path.display())));
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
        let data = std::fs::read(path)
            .map_err(|e| DimseError::config(format!("failed to read private key {}: {}", path.display(), e)))?;
        rustls_pemfile::private_key(&mut &*data)
            .map_err(|e| DimseError::config(format!("malformed private key {}: {}", path.display(), e)))?
            .ok_or_else(|| DimseError::config(format!("no private key in {}", path.display())))
    }

    fn load_roots(path: &Path) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(path)? {
            roots.add(cert)?;
        }
        Ok(roots)
    }

    fn identity(settings: &TlsSettings) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        match (&settings.cert_path, &settings.key_path) {
            (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_key(key)?))),
            (None, None) => Ok(None),
            _ => Err(DimseError::config("cert_path and key_path must be given together")),
        }
    }

    /// Client side TLS: verifies the server against a CA bundle
    #[derive(Clone)]
    pub struct ClientTls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    }

    impl fmt::Debug for ClientTls {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ClientTls").field("server_name", &self.server_name).finish()
        }
    }

    impl ClientTls {
        pub fn from_settings(settings: &TlsSettings, host: &str) -> Result<Self> {
            let ca = settings
                .ca_path
                .as_deref()
                .ok_or_else(|| DimseError::config("TLS client needs ca_path to verify the server"))?;
            let builder = ClientConfig::builder().with_root_certificates(load_roots(ca)?);
            let config = match identity(settings)? {
                Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
                None => builder.with_no_client_auth(),
            };
            let name = settings.server_name.clone().unwrap_or_else(|| host.to_string());
            let server_name = ServerName::try_from(name.clone())
                .map_err(|e| DimseError::config(format!("invalid TLS server name '{}': {}", name, e)))?;
            Ok(Self { connector: TlsConnector::from(Arc::new(config)), server_name })
        }

        pub async fn connect(&self, tcp: TcpStream) -> Result<client::TlsStream<TcpStream>> {
            Ok(self.connector.connect(self.server_name.clone(), tcp).await?)
        }
    }

    /// Server side TLS
    #[derive(Clone)]
    pub struct ServerTls {
        acceptor: TlsAcceptor,
    }

    impl fmt::Debug for ServerTls {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ServerTls").finish_non_exhaustive()
        }
    }

    impl ServerTls {
        pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
            let (certs, key) =
                identity(settings)?.ok_or_else(|| DimseError::config("TLS server needs cert_path and key_path"))?;
            let builder = match &settings.ca_path {
                Some(ca) => {
                    let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(ca)?))
                        .build()
                        .map_err(|e| DimseError::config(format!("invalid client CA bundle: {}", e)))?;
                    ServerConfig::builder().with_client_cert_verifier(verifier)
                }
                None => ServerConfig::builder().with_no_client_auth(),
            };
            let config = builder.with_single_cert(certs, key)?;
            Ok(Self { acceptor: TlsAcceptor::from(Arc::new(config)) })
        }

        pub async fn accept(&self, tcp: TcpStream) -> Result<server::TlsStream<TcpStream>> {
            Ok(self.acceptor.accept(tcp).await?)
        }
    }

}
