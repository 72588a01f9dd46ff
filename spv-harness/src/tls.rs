//! Reading back the self-signed TLS material a node or wallet writes into its
//! data directory after startup, and trusting exactly that certificate.
//!
//! The files appear asynchronously relative to process start, and may be
//! observed half written, so every read goes through [`retry_until`] and only
//! fully parseable PEM is accepted.
//!
//! Both daemons issue their certificate with the CA flag set so that it can
//! sign itself. webpki refuses such a certificate as a server end-entity, so
//! trust is pinned to the certificate bytes rather than built from a chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WantsClientCert;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ConfigBuilder, DigitallySignedStruct, SignatureScheme,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::retry::retry_until;

/// ALPN id gRPC is negotiated under.
pub const ALPN_H2: &[u8] = b"h2";

/// PEM material that cannot be turned into a TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The bytes are not PEM.
    #[error("invalid PEM: {0}")]
    Pem(#[from] pem::PemError),
    /// No block with a usable tag.
    #[error("no {0} PEM block")]
    Missing(&'static str),
    /// rustls refused the material.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Certificate and private key read back from a wallet's data directory.
#[derive(Clone)]
pub struct TlsMaterial {
    /// The wallet's self-signed certificate, PEM encoded.
    pub cert_pem: Vec<u8>,
    /// Private key matching `cert_pem`, PEM encoded.
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Mutual TLS settings for gRPC: trust exactly the wallet's certificate
    /// and present it, with its key, as the client identity.
    pub fn client_config(&self) -> std::result::Result<ClientConfig, TlsError> {
        let chain = certificates(&self.cert_pem)?;
        let key = private_key(&self.key_pem)?;
        let mut config = pinned_builder(chain[0].clone())?.with_client_auth_cert(chain, key)?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(config)
    }
}

/// Server-authenticated settings trusting exactly the first certificate in
/// `cert_pem`.
pub fn pinned_client_config(cert_pem: &[u8]) -> std::result::Result<ClientConfig, TlsError> {
    let mut chain = certificates(cert_pem)?;
    Ok(pinned_builder(chain.swap_remove(0))?.with_no_client_auth())
}

fn pinned_builder(
    pinned: CertificateDer<'static>,
) -> std::result::Result<ConfigBuilder<ClientConfig, WantsClientCert>, TlsError> {
    let provider = Arc::new(ring::default_provider());
    let verifier = PinnedCertVerifier {
        pinned,
        provider: provider.clone(),
    };
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier)))
}

/// Accepts one server certificate, byte for byte. Handshake signatures are
/// still verified against it.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!("server presented a certificate other than the pinned one");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn certificates(
    pem_bytes: &[u8],
) -> std::result::Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = pem::parse_many(pem_bytes)?
        .into_iter()
        .filter(|block| is_certificate(block.tag()))
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(TlsError::Missing("CERTIFICATE"));
    }
    Ok(certs)
}

fn private_key(pem_bytes: &[u8]) -> std::result::Result<PrivateKeyDer<'static>, TlsError> {
    pem::parse_many(pem_bytes)?
        .into_iter()
        .find_map(|block| {
            let der = block.contents().to_vec();
            match block.tag() {
                "EC PRIVATE KEY" => Some(PrivateKeyDer::Sec1(der.into())),
                "PRIVATE KEY" => Some(PrivateKeyDer::Pkcs8(der.into())),
                "RSA PRIVATE KEY" => Some(PrivateKeyDer::Pkcs1(der.into())),
                _ => None,
            }
        })
        .ok_or(TlsError::Missing("PRIVATE KEY"))
}

/// Paths of a certificate/key pair.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    /// PEM certificate.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

impl TlsPaths {
    /// The `rpc.cert`/`rpc.key` pair inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join("rpc.cert"),
            key: dir.join("rpc.key"),
        }
    }
}

/// Wait until both certificate and key are readable and parse as PEM.
pub async fn read_tls_material(
    paths: &TlsPaths,
    interval: Duration,
    deadline: Duration,
    data_dir: &Path,
) -> Result<TlsMaterial> {
    let material = retry_until(interval, deadline, move || async move {
        let cert_pem = load_pem(&paths.cert, is_certificate).await?;
        let key_pem = load_pem(&paths.key, is_private_key).await?;
        Ok::<_, String>(TlsMaterial { cert_pem, key_pem })
    })
    .await
    .map_err(|e| {
        HarnessError::setup(
            format!(
                "unable to read TLS material after {} attempts: {}",
                e.attempts,
                e.last_error.unwrap_or_else(|| "read timed out".into())
            ),
            data_dir,
        )
    })?;
    info!("Loaded TLS material from {}", paths.cert.display());
    Ok(material)
}

/// Wait until the certificate alone is readable; used for node RPC where no
/// client identity is needed.
pub async fn read_certificate(
    path: &Path,
    interval: Duration,
    deadline: Duration,
    data_dir: &Path,
) -> Result<Vec<u8>> {
    retry_until(interval, deadline, || load_pem(path, is_certificate))
        .await
        .map_err(|e| {
            HarnessError::setup(
                format!(
                    "unable to read certificate {}: {}",
                    path.display(),
                    e.last_error.unwrap_or_else(|| "read timed out".into())
                ),
                data_dir,
            )
        })
}

fn is_certificate(tag: &str) -> bool {
    tag == "CERTIFICATE"
}

fn is_private_key(tag: &str) -> bool {
    tag.ends_with("PRIVATE KEY")
}

async fn load_pem(path: &Path, accept: fn(&str) -> bool) -> std::result::Result<Vec<u8>, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("unable to read {}: {e}", path.display()))?;
    let blocks = pem::parse_many(&bytes)
        .map_err(|e| format!("{} is not valid PEM yet: {e}", path.display()))?;
    if !blocks.iter().any(|b| accept(b.tag())) {
        debug!("{} has {} PEM blocks but none usable", path.display(), blocks.len());
        return Err(format!("{} holds no usable PEM block", path.display()));
    }
    Ok(bytes)
}
