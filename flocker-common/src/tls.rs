//! Mutual-TLS configuration for both cluster channels.
//!
//! A cluster has a single self-signed CA. The control service presents the
//! control certificate; every agent and operator presents a certificate
//! issued by the same CA. Both sides verify the peer's chain against the
//! cluster CA only, so certificates from any other trust root are rejected.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid certificate material: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client verifier rejected cluster CA: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

fn cluster_roots(ca_file: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server-side config: presents `cert_file`/`key_file`, requires client
/// certificates issued by the cluster CA. Used for both the agent RPC
/// listener and the REST listener.
pub fn server_config(
    ca_file: &Path,
    cert_file: &Path,
    key_file: &Path,
) -> Result<ServerConfig, TlsError> {
    let roots = cluster_roots(ca_file)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert_file)?, load_private_key(key_file)?)?;
    Ok(config)
}

/// Client-side config: trusts only the cluster CA and presents the node (or
/// operator) certificate for client authentication.
pub fn client_config(
    ca_file: &Path,
    cert_file: &Path,
    key_file: &Path,
) -> Result<ClientConfig, TlsError> {
    let roots = cluster_roots(ca_file)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use std::fs;
    use std::path::PathBuf;

    struct TestCa {
        dir: tempfile::TempDir,
        ca: PathBuf,
        cert: PathBuf,
        key: PathBuf,
    }

    fn mint_test_ca() -> TestCa {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("cluster.crt");
        let cert = dir.path().join("node.crt");
        let key = dir.path().join("node.key");
        fs::write(&ca, ca_cert.pem()).unwrap();
        fs::write(&cert, leaf_cert.pem()).unwrap();
        fs::write(&key, leaf_key.serialize_pem()).unwrap();
        TestCa { dir, ca, cert, key }
    }

    #[test]
    fn builds_both_configs_from_pem_material() {
        let ca = mint_test_ca();
        server_config(&ca.ca, &ca.cert, &ca.key).unwrap();
        client_config(&ca.ca, &ca.cert, &ca.key).unwrap();
        drop(ca.dir);
    }

    #[test]
    fn missing_files_are_reported_with_path() {
        let missing = Path::new("/nonexistent/cluster.crt");
        match load_certs(missing) {
            Err(TlsError::Io { path, .. }) => assert!(path.contains("cluster.crt")),
            other => panic!("expected Io error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.crt");
        fs::write(&empty, "").unwrap();
        assert!(matches!(
            load_certs(&empty),
            Err(TlsError::NoCertificates(_))
        ));
    }
}
