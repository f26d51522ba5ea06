//! Optional TLS for the wire listener, built from `SLOTBOOK_TLS_CERT` and
//! `SLOTBOOK_TLS_KEY`.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::{Config, ConfigError};

/// `None` when neither variable is set; an error when only one is.
pub fn load_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>, ConfigError> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(cert), Some(key)) => (cert, key),
        (Some(_), None) => {
            return Err(ConfigError::Incomplete {
                var: "SLOTBOOK_TLS_CERT",
                other: "SLOTBOOK_TLS_KEY",
            });
        }
        (None, Some(_)) => {
            return Err(ConfigError::Incomplete {
                var: "SLOTBOOK_TLS_KEY",
                other: "SLOTBOOK_TLS_CERT",
            });
        }
    };

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;
    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_error(cert_path, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!(cert = cert_path, "TLS enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_error(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, e))?;
    if certs.is_empty() {
        return Err(tls_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_error(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error(path, e))?
        .ok_or_else(|| tls_error(path, "no private key found"))
}

fn tls_error(path: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Tls {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
