//! TLS material for the two RDP legs.
//!
//! The client leg terminates TLS with the gateway's own certificate,
//! generated under `<data>/tls/` on first use. The backend leg accepts
//! whatever certificate the backend presents; the routing table, not the
//! certificate, pins which host we talk to.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::{self, pki_types};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tracing::info;

use crate::error::{MitmError, RdpResult};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Shared TLS configuration for both legs.
pub struct TlsContext {
    pub server: Arc<rustls::ServerConfig>,
    pub client: Arc<rustls::ClientConfig>,
}

impl TlsContext {
    /// Load the gateway certificate from `dir`, generating a self-signed
    /// one on first use.
    pub fn load_or_generate(dir: &Path) -> RdpResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| MitmError::Tls(format!("create {}: {e}", dir.display())))?;
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if !cert_path.exists() || !key_path.exists() {
            generate_certificate(&cert_path, &key_path)?;
        }

        let certs = load_certs(&cert_path)?;
        let key = load_key(&key_path)?;

        let server = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| MitmError::Tls(format!("server config: {e}")))?;

        let mut client = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();
        client.resumption = rustls::client::Resumption::disabled();

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
}

fn generate_certificate(cert_path: &Path, key_path: &Path) -> RdpResult<()> {
    info!(cert = %cert_path.display(), "generating RDP TLS certificate");
    let certified = rcgen::generate_simple_self_signed(vec!["glacis-gateway".to_string()])
        .map_err(|e| MitmError::Tls(format!("certificate generation: {e}")))?;

    write_private(cert_path, certified.cert.pem().as_bytes())?;
    write_private(key_path, certified.key_pair.serialize_pem().as_bytes())?;
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> RdpResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| MitmError::Tls(format!("create {}: {e}", path.display())))?;
    file.write_all(contents)
        .map_err(|e| MitmError::Tls(format!("write {}: {e}", path.display())))?;
    Ok(())
}

fn load_certs(path: &Path) -> RdpResult<Vec<pki_types::CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| MitmError::Tls(format!("read {}: {e}", path.display())))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    let certs = certs.map_err(|e| MitmError::Tls(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(MitmError::Tls(format!("{} holds no certificate", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> RdpResult<pki_types::PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| MitmError::Tls(format!("read {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| MitmError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| MitmError::Tls(format!("{} holds no private key", path.display())))
}

/// Backend certificates are not verified; identity comes from the routing
/// table.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _: &pki_types::CertificateDer<'_>,
        _: &[pki_types::CertificateDer<'_>],
        _: &pki_types::ServerName<'_>,
        _: &[u8],
        _: pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &pki_types::CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &pki_types::CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = TlsContext::load_or_generate(dir.path()).expect("generate");
        drop(first);
        // Second load must reuse the persisted material, not regenerate.
        let reloaded = TlsContext::load_or_generate(dir.path());
        assert!(reloaded.is_ok());
    }

    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = TlsContext::load_or_generate(dir.path()).expect("generate");
        let mode = std::fs::metadata(dir.path().join(KEY_FILE))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
