// Self-signed TLS identities shaped like the ones the daemons write: a
// single certificate for localhost that also carries the CA flag.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, SanType};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::TestResult;

/// One generated certificate and its private key.
pub struct TlsFixture {
    pub cert_pem: String,
    pub key_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl TlsFixture {
    /// A fresh CA-flagged certificate for `localhost` and `127.0.0.1`.
    pub fn ca_flagged() -> TestResult<Self> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key)?;
        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: key.serialize_der(),
        })
    }

    /// Server side of the identity, ring provider, no client auth.
    pub fn server_config(&self) -> TestResult<ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], key)?;
        Ok(config)
    }

    /// Write `rpc.cert` and `rpc.key` into `dir`, key first. Each file is
    /// renamed into place so readers never see a partial write.
    pub async fn write_to(&self, dir: &Path) -> TestResult<()> {
        tokio::fs::create_dir_all(dir).await?;
        for (name, contents) in [("rpc.key", &self.key_pem), ("rpc.cert", &self.cert_pem)] {
            let tmp = dir.join(format!("{name}.tmp"));
            tokio::fs::write(&tmp, contents).await?;
            tokio::fs::rename(&tmp, dir.join(name)).await?;
        }
        Ok(())
    }
}
