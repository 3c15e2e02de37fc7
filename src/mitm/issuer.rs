//! Per-host leaf certificate issuance signed by the configured root CA.

use rcgen::{
    CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
    SanType, SerialNumber,
};
use rand::Rng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    MissingCertificate(String),

    #[error("parsing root certificate: {0}")]
    InvalidRoot(String),

    #[error("parsing root private key: {0}")]
    InvalidKey(String),

    #[error("invalid host for SAN: {0}")]
    InvalidHost(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),
}

/// A minted leaf: the chain served to clients plus its private key.
pub struct LeafIdentity {
    /// `[leaf DER, root DER]` in handshake order.
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub not_after: time::OffsetDateTime,
}

/// Mints per-host certificates signed by the root CA held in memory for the
/// process lifetime.
pub struct LeafIssuer {
    root_der: CertificateDer<'static>,
    root_cert: rcgen::Certificate,
    root_key: KeyPair,
    subject: DistinguishedName,
}

impl LeafIssuer {
    /// Load the root certificate and private key from PEM files.
    pub fn from_pem_files(ca_path: &str, key_path: &str) -> Result<Self, IssuerError> {
        let ca_pem = std::fs::read_to_string(ca_path).map_err(|source| IssuerError::Io {
            path: ca_path.to_string(),
            source,
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|source| IssuerError::Io {
            path: key_path.to_string(),
            source,
        })?;
        Self::from_pem(&ca_pem, &key_pem)
            .map_err(|e| match e {
                IssuerError::MissingCertificate(_) => {
                    IssuerError::MissingCertificate(ca_path.to_string())
                }
                other => other,
            })
    }

    /// Build an issuer from in-memory PEM material.
    pub fn from_pem(ca_pem: &str, key_pem: &str) -> Result<Self, IssuerError> {
        let root_der = rustls_pemfile::certs(&mut ca_pem.as_bytes())
            .next()
            .ok_or_else(|| IssuerError::MissingCertificate(String::new()))?
            .map_err(|e| IssuerError::InvalidRoot(e.to_string()))?;

        let root_key =
            KeyPair::from_pem(key_pem).map_err(|e| IssuerError::InvalidKey(e.to_string()))?;

        let root_params = CertificateParams::from_ca_cert_pem(ca_pem)
            .map_err(|e| IssuerError::InvalidRoot(e.to_string()))?;
        let subject = root_params.distinguished_name.clone();

        // Re-signing the parsed params yields an issuer template whose subject
        // matches the on-disk root; leaves signed against it chain back to the
        // original root key.
        let root_cert = root_params
            .self_signed(&root_key)
            .map_err(|e| IssuerError::InvalidRoot(e.to_string()))?;

        Ok(Self {
            root_der,
            root_cert,
            root_key,
            subject,
        })
    }

    /// Mint a leaf for `host` with a DNS or IP SAN by host shape.
    pub fn issue(&self, host: &str) -> Result<LeafIdentity, IssuerError> {
        if host.is_empty() {
            return Err(IssuerError::InvalidHost("host must not be empty".to_string()));
        }

        let mut params = CertificateParams::default();
        // Browsers validate the SAN, not the subject; the root's subject is a
        // serviceable placeholder.
        params.distinguished_name = self.subject.clone();
        params.serial_number = Some(random_serial());

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::hours(24);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|e: rcgen::Error| IssuerError::InvalidHost(e.to_string()))?,
            ),
        }];

        let leaf_key =
            KeyPair::generate().map_err(|e| IssuerError::Generation(e.to_string()))?;
        let not_after = params.not_after;
        let cert = params
            .signed_by(&leaf_key, &self.root_cert, &self.root_key)
            .map_err(|e| IssuerError::Generation(e.to_string()))?;

        Ok(LeafIdentity {
            chain: vec![cert.der().clone(), self.root_der.clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
            not_after,
        })
    }
}

/// Random 128-bit serial number.
fn random_serial() -> SerialNumber {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    SerialNumber::from(bytes.to_vec())
}

/// Test-only helper to mint a throwaway root CA as PEM.
#[cfg(test)]
pub(crate) mod testutil {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose};

    pub(crate) fn test_root_pem() -> (String, String) {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "wiretap test root");
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}
