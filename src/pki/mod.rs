//! Key and certificate handling for edge node client credentials
//!
//! The operator generates a fresh RSA-2048 key per device, wraps its public
//! half in a PKCS#10 request whose subject CN is the device uuid, and later
//! checks that the certificate handed back by the signer really is for that
//! uuid and that key.
//!
//! # Key handling
//!
//! - Keys are generated in-process and never written to disk
//! - Every PEM copy of the private key lives in a [`Zeroizing`] buffer
//! - The delivered key is PKCS#1 (`RSA PRIVATE KEY`), which is what the
//!   device-side bootstrap script expects

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, PublicKeyData};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

/// RSA modulus size for device keys
pub const RSA_KEY_BITS: usize = 2048;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// RSA key could not be generated
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// CSR generation failed
    #[error("CSR generation failed: {0}")]
    CsrGenerationFailed(String),

    /// Certificate or PEM parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Issued certificate is not for the requested subject or key
    #[error("issued certificate mismatch: {0}")]
    CertificateMismatch(String),
}

/// Result of a key or certificate operation
pub type Result<T> = std::result::Result<T, PkiError>;

impl From<PkiError> for crate::Error {
    fn from(e: PkiError) -> Self {
        crate::Error::pki(e.to_string())
    }
}

/// PEM-encoded private key, wiped from memory on drop
pub type PrivateKeyPem = Zeroizing<String>;

/// DER body of the first PEM block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Extract the subject common name from a PEM certificate
pub fn certificate_common_name(cert_pem: &str) -> Result<String> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| PkiError::ParseError("certificate has no common name".to_string()));
    cn
}

/// Device certificate request: a fresh key pair plus a CSR for it
///
/// The private key stays inside this value until it is packaged for
/// delivery.
pub struct NodeCertRequest {
    common_name: String,
    key_pem: PrivateKeyPem,
    /// DER SubjectPublicKeyInfo of the generated key
    public_key_der: Vec<u8>,
    csr_pem: String,
}

impl NodeCertRequest {
    /// Generate a new RSA key and a CSR with `CN=<uuid>`
    pub fn new(uuid: &str) -> Result<Self> {
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate RSA key: {}", e))
        })?;

        // rcgen cannot generate RSA keys; it loads this one from PKCS#8
        let pkcs8_pem = rsa_key.to_pkcs8_pem(LineEnding::LF).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to encode key as PKCS#8: {}", e))
        })?;
        let key_pair = KeyPair::from_pem(&pkcs8_pem).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to load RSA key: {}", e))
        })?;

        let key_pem = rsa_key.to_pkcs1_pem(LineEnding::LF).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to encode key as PKCS#1: {}", e))
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(uuid.to_string()));
        params.distinguished_name = dn;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CsrGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CsrGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            common_name: uuid.to_string(),
            key_pem,
            public_key_der: key_pair.subject_public_key_info(),
            csr_pem,
        })
    }

    /// Get the CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Get the private key as PKCS#1 PEM
    pub fn private_key_pem(&self) -> &PrivateKeyPem {
        &self.key_pem
    }

    /// Consume the request, keeping only the private key
    pub fn into_private_key(self) -> PrivateKeyPem {
        self.key_pem
    }

    /// Check that an issued certificate belongs to this request
    ///
    /// The subject CN must equal the requested uuid and the certified public
    /// key must be the one generated here.
    pub fn check_issued(&self, cert_pem: &str) -> Result<()> {
        let der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("");
        if cn != self.common_name {
            return Err(PkiError::CertificateMismatch(format!(
                "expected CN '{}', got '{}'",
                self.common_name, cn
            )));
        }

        if cert.public_key().raw != self.public_key_der.as_slice() {
            return Err(PkiError::CertificateMismatch(
                "certificate does not certify the generated key".to_string(),
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for NodeCertRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCertRequest")
            .field("common_name", &self.common_name)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}
