//! TLS material for the Server Host: load a certificate/key pair from the
//! config directory, or generate a self-signed one on first run. Grounded on
//! how `ironrdp-server`'s `RdpServerSecurity::Tls(TlsAcceptor)` is assembled
//! and threaded into the accept loop (`server.rs`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::BridgeError;

const SELF_SIGNED_SANS: &[&str] = &["localhost", "127.0.0.1", "127.51.68.120"];

pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsMaterial {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join("cert.pem"),
            key_path: dir.join("key.pem"),
        }
    }
}

/// Loads the cert/key pair if present, otherwise generates and persists a
/// self-signed pair covering `SELF_SIGNED_SANS`. Either failure is a
/// `FatalStartupError`: the process cannot serve TLS without one.
pub async fn build_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, BridgeError> {
    ensure_material(material).await?;

    let cert_pem = tokio::fs::read(&material.cert_path)
        .await
        .map_err(|err| BridgeError::FatalStartup(format!("reading cert: {err}")))?;
    let key_pem = tokio::fs::read(&material.key_path)
        .await
        .map_err(|err| BridgeError::FatalStartup(format!("reading key: {err}")))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|err| BridgeError::FatalStartup(format!("parsing cert: {err}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|err| BridgeError::FatalStartup(format!("parsing key: {err}")))?
        .ok_or_else(|| BridgeError::FatalStartup("no private key found in key file".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| BridgeError::FatalStartup(format!("building tls config: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn ensure_material(material: &TlsMaterial) -> Result<(), BridgeError> {
    if tokio::fs::metadata(&material.cert_path).await.is_ok()
        && tokio::fs::metadata(&material.key_path).await.is_ok()
    {
        return Ok(());
    }

    let cert_path = material.cert_path.clone();
    let key_path = material.key_path.clone();
    tokio::task::spawn_blocking(move || generate_self_signed(&cert_path, &key_path))
        .await
        .map_err(|err| BridgeError::FatalStartup(format!("tls generation task: {err}")))?
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = cert_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| BridgeError::FatalStartup(format!("creating tls dir: {err}")))?;
    }

    let subject_alt_names: Vec<String> = SELF_SIGNED_SANS.iter().map(|s| (*s).to_owned()).collect();
    let generated = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|err| BridgeError::FatalStartup(format!("generating self-signed cert: {err}")))?;

    std::fs::write(cert_path, generated.cert.pem())
        .map_err(|err| BridgeError::FatalStartup(format!("writing cert: {err}")))?;
    std::fs::write(key_path, generated.signing_key.serialize_pem())
        .map_err(|err| BridgeError::FatalStartup(format!("writing key: {err}")))?;
    Ok(())
}
