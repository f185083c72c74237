/// TLS client setup for node connections
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::ServerAddress;
use crate::config::TlsConfig;
use crate::error::{RutaError, RutaResult};

/// Wraps TCP streams in TLS using one shared rustls configuration
#[derive(Clone)]
pub struct TlsWrapper {
    connector: TlsConnector,
}

impl TlsWrapper {
    pub fn from_config(config: &TlsConfig) -> RutaResult<Self> {
        let mut roots = RootCertStore::empty();
        match &config.ca_file {
            Some(path) => {
                let mut reader = BufReader::new(File::open(path).map_err(|e| {
                    RutaError::invalid_argument(format!("cannot open CA file {}: {}", path, e))
                })?);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|e| {
                        RutaError::invalid_argument(format!("invalid CA file {}: {}", path, e))
                    })?;
                    roots.add(cert).map_err(|e| {
                        RutaError::invalid_argument(format!("invalid CA certificate: {}", e))
                    })?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let client_config = match &config.cert_key_file {
            Some(path) => {
                let open = || {
                    File::open(path).map(BufReader::new).map_err(|e| {
                        RutaError::invalid_argument(format!("cannot open key file {}: {}", path, e))
                    })
                };
                let certs = rustls_pemfile::certs(&mut open()?)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| RutaError::invalid_argument(format!("invalid certificate: {}", e)))?;
                let key = rustls_pemfile::private_key(&mut open()?)
                    .map_err(|e| RutaError::invalid_argument(format!("invalid private key: {}", e)))?
                    .ok_or_else(|| {
                        RutaError::invalid_argument(format!("no private key found in {}", path))
                    })?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| RutaError::invalid_argument(format!("invalid client certificate: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    pub async fn wrap(
        &self,
        address: &ServerAddress,
        stream: TcpStream,
    ) -> RutaResult<TlsStream<TcpStream>> {
        let name = ServerName::try_from(address.host().to_string()).map_err(|e| {
            RutaError::invalid_argument(format!("invalid TLS server name {}: {}", address.host(), e))
        })?;
        Ok(self.connector.connect(name, stream).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roots() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(TlsWrapper::from_config(&config).is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig {
            enabled: true,
            ca_file: Some("/nonexistent/ca.pem".to_string()),
            cert_key_file: None,
        };
        assert!(matches!(
            TlsWrapper::from_config(&config),
            Err(RutaError::InvalidArgument { .. })
        ));
    }
}
