//! mTLS session management (spec §4.2).
//!
//! Certificate/key loading is lifted directly from the sidecar proxy
//! this crate was adapted from; `dial`/`accept`/`peer_identity` are new,
//! generalizing the proxy's inline handshake calls into a reusable
//! contract shared by the Agent and the Server.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::TlsError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let path = cert_path.as_ref();
    let file = File::open(path).map_err(|source| TlsError::CertLoad {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::CertLoad {
            path: path.display().to_string(),
            source,
        })
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>, TlsError> {
    let path = key_path.as_ref();
    let file = File::open(path).map_err(|source| TlsError::CertLoad {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let key = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|source| TlsError::CertLoad {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))?;
    Ok(PrivateKeyDer::Pkcs8(key))
}

pub fn load_root_store<P: AsRef<Path>>(ca_path: P) -> Result<RootCertStore, TlsError> {
    let path = ca_path.as_ref();
    let ca_certs = cert_reader(path)?;
    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);
    if root_store.is_empty() {
        return Err(TlsError::EmptyCaBundle(path.display().to_string()));
    }
    Ok(root_store)
}

/// Build the `ServerConfig` the Server uses to `accept()` Agent
/// sessions: requires and verifies a client certificate chain rooted at
/// `ca_file` (spec §4.2 `accept`).
pub fn build_server_config(
    server_cert: impl AsRef<Path>,
    server_key: impl AsRef<Path>,
    ca_file: impl AsRef<Path>,
) -> Result<ServerConfig, TlsError> {
    let cert_chain = cert_reader(server_cert)?;
    let key = privkey_reader(server_key)?;
    let root_store = load_root_store(ca_file)?;

    let client_verifier = WebPkiClientVerifier::builder(root_store.into())
        .build()
        .map_err(|e| TlsError::Rustls(rustls::Error::General(e.to_string())))?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key)?;
    config.alpn_protocols = vec![b"tunnel/1".to_vec()];
    Ok(config)
}

/// Build the `ClientConfig` the Agent uses to `dial()` the Server:
/// presents a client certificate and verifies the Server's chain against
/// `ca_file` (spec §4.2 `dial`).
pub fn build_client_config(
    client_cert: impl AsRef<Path>,
    client_key: impl AsRef<Path>,
    ca_file: impl AsRef<Path>,
) -> Result<ClientConfig, TlsError> {
    let cert_chain = cert_reader(client_cert)?;
    let key = privkey_reader(client_key)?;
    let root_store = load_root_store(ca_file)?;

    let mut config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(root_store)
        .with_client_auth_cert(cert_chain, key)?;
    config.alpn_protocols = vec![b"tunnel/1".to_vec()];
    Ok(config)
}

/// Dial `host:port`, completing a client-side mTLS handshake before
/// returning. Both configs above are pinned to TLS 1.3 via
/// `builder_with_protocol_versions`, so a peer offering only 1.2 is
/// refused; the CA bundle and SAN check enforce the server identity.
pub async fn dial(
    host: &str,
    port: u16,
    client_config: Arc<ClientConfig>,
) -> Result<client::TlsStream<TcpStream>, TlsError> {
    let tcp = match timeout(HANDSHAKE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => return Err(TlsError::Handshake(e)),
        Err(_) => return Err(TlsError::Timeout(HANDSHAKE_TIMEOUT)),
    };
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;
    let connector = TlsConnector::from(client_config);

    match timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TlsError::Handshake(e)),
        Err(_) => Err(TlsError::Timeout(HANDSHAKE_TIMEOUT)),
    }
}

/// Accept one inbound connection, completing the server-side mTLS
/// handshake before returning. Per the pitfall documented in spec §9:
/// the handshake MUST finish before any peer-certificate introspection,
/// so `peer_identity` only ever runs on the value returned here.
pub async fn accept(
    raw_conn: TcpStream,
    server_config: Arc<ServerConfig>,
) -> Result<server::TlsStream<TcpStream>, TlsError> {
    let acceptor = TlsAcceptor::from(server_config);
    match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(raw_conn)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TlsError::Handshake(e)),
        Err(_) => Err(TlsError::Timeout(HANDSHAKE_TIMEOUT)),
    }
}

/// Best-effort peer identity for log lines only — never used for
/// authorization beyond the CA check already performed by the verifier.
pub fn peer_identity(stream: &server::TlsStream<TcpStream>) -> String {
    let (_, conn) = stream.get_ref();
    conn.peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| x509_parser::parse_x509_certificate(cert.as_ref()).ok())
        .map(|(_, parsed)| parsed.subject().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use tempfile_like::TempFile;

    // Minimal scratch-file helper: avoids pulling in `tempfile` just for
    // two PEM files in these tests.
    mod tempfile_like {
        use std::fs;
        use std::path::PathBuf;

        pub struct TempFile {
            pub path: PathBuf,
        }

        impl TempFile {
            pub fn new(name: &str, contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("tunnel-proto-test-{}-{}", std::process::id(), name));
                fs::write(&path, contents).unwrap();
                Self { path }
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = fs::remove_file(&self.path);
            }
        }
    }

    fn self_signed_ca_and_leaf() -> (String, String, String) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(vec!["test-ca".to_string()]).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        (
            ca_cert.pem(),
            leaf_cert.pem(),
            leaf_key.serialize_pem(),
        )
    }

    #[test]
    fn load_root_store_rejects_empty_bundle() {
        let empty = TempFile::new("empty-ca.pem", "");
        let err = load_root_store(&empty.path).unwrap_err();
        assert!(matches!(err, TlsError::EmptyCaBundle(_)));
    }

    #[test]
    fn server_config_builds_from_valid_materials() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (ca_pem, leaf_pem, key_pem) = self_signed_ca_and_leaf();
        let ca = TempFile::new("ca.pem", &ca_pem);
        let cert = TempFile::new("leaf.pem", &leaf_pem);
        let key = TempFile::new("key.pem", &key_pem);

        let cfg = build_server_config(&cert.path, &key.path, &ca.path);
        assert!(cfg.is_ok());
    }

    #[test]
    fn cert_reader_errors_on_missing_file() {
        let err = cert_reader("/nonexistent/path/does-not-exist.pem").unwrap_err();
        assert!(matches!(err, TlsError::CertLoad { .. }));
    }
}
