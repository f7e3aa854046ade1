//! Certificate authority operations for cluster identities.
//!
//! The bootstrap run owns a single on-disk CA (`ca-key.pem` / `ca.pem` under
//! the configured certificate directory) that signs every identity in the
//! cluster: the apiserver, each worker, and the local admin. The CA is the
//! trust root - a certificate is valid for the cluster exactly when its
//! issuer is this CA.
//!
//! All key and certificate material lives on disk so that a re-run can reuse
//! it; nothing is held only in memory. File permissions are not restricted
//! here - the orchestrator tightens them once material lands on a remote
//! host.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::{debug, info};

/// CA private key file name under the output directory
pub const CA_KEY_FILE: &str = "ca-key.pem";

/// CA certificate file name under the output directory
pub const CA_CERT_FILE: &str = "ca.pem";

/// CA certificate validity (10000 days)
pub const CA_VALIDITY_DAYS: i64 = 10_000;

/// Default leaf certificate validity (1 year)
pub const LEAF_VALIDITY_DAYS: i64 = 365;

const CA_COMMON_NAME: &str = "kube-ca";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// CA not initialized
    #[error("CA not initialized: run CA creation before issuing certificates")]
    CaNotInitialized,

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Invalid subject-alternative-name entry
    #[error("invalid SAN entry: {0}")]
    InvalidSan(String),

    /// Certificate or key parsing error
    #[error("parse error: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Compute a certificate validity window starting now
fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

/// Subject-alternative-name entries for an issued certificate.
#[derive(Debug, Clone, Default)]
pub struct SanConfig {
    /// DNS names the certificate is valid for
    pub dns_names: Vec<String>,
    /// IP addresses the certificate is valid for
    pub ip_addrs: Vec<IpAddr>,
}

impl SanConfig {
    /// A SAN set containing only the given IP addresses
    pub fn ips(ip_addrs: Vec<IpAddr>) -> Self {
        Self {
            dns_names: Vec::new(),
            ip_addrs,
        }
    }
}

/// Paths to an issued key/certificate pair.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Private key path (`<identity>-key.pem`)
    pub key_path: PathBuf,
    /// Signed certificate path (`<identity>.pem`)
    pub cert_path: PathBuf,
}

/// The cluster certificate authority, addressed by its on-disk material.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    key_path: PathBuf,
    cert_path: PathBuf,
}

/// Removes the transient CSR file on drop, success or failure.
struct CsrFile(PathBuf);

impl Drop for CsrFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

impl CertificateAuthority {
    /// Create the CA under `output_dir`, or reuse the material already there.
    ///
    /// Idempotent by file existence: when both `ca-key.pem` and `ca.pem`
    /// exist the call is a no-op returning the existing paths. Otherwise a
    /// fresh key pair and self-signed certificate (CN=kube-ca, 10000 days)
    /// are generated and written.
    pub fn create(output_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        let key_path = output_dir.join(CA_KEY_FILE);
        let cert_path = output_dir.join(CA_CERT_FILE);

        if key_path.exists() && cert_path.exists() {
            debug!(dir = %output_dir.display(), "reusing existing CA material");
            return Ok(Self {
                key_path,
                cert_path,
            });
        }

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(CA_COMMON_NAME.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        std::fs::write(&key_path, key_pair.serialize_pem())?;
        std::fs::write(&cert_path, cert.pem())?;
        info!(dir = %output_dir.display(), "generated cluster CA");

        Ok(Self {
            key_path,
            cert_path,
        })
    }

    /// Path to the CA private key
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Path to the CA certificate (for distribution to nodes)
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Issue a certificate for `identity`, signed by this CA.
    ///
    /// Generates a fresh private key and CSR every call - leaf material is
    /// never reused, since SAN entries are derived from current node IPs.
    /// Writes `<identity>-key.pem` and `<identity>.pem` next to the CA and
    /// returns both paths. The intermediate `<identity>.csr` is removed on
    /// all exit paths.
    ///
    /// The subject is `CN=kube-<identity>` for the apiserver and admin
    /// identities and `CN=<identity>` otherwise (worker identities already
    /// carry the node name).
    ///
    /// Issuing without CA material on disk is a programmer error: the
    /// orchestrator must always create the CA first. Fails fast with
    /// [`PkiError::CaNotInitialized`].
    pub fn issue(
        &self,
        identity: &str,
        san: Option<&SanConfig>,
        validity_days: i64,
    ) -> Result<IssuedCertificate> {
        if !self.key_path.exists() || !self.cert_path.exists() {
            return Err(PkiError::CaNotInitialized);
        }

        let dir = self
            .cert_path
            .parent()
            .ok_or_else(|| PkiError::ParseError("CA path has no parent directory".to_string()))?;
        let key_path = dir.join(format!("{}-key.pem", identity));
        let cert_path = dir.join(format!("{}.pem", identity));
        let csr_path = dir.join(format!("{}.csr", identity));

        let ca_key_pem = std::fs::read_to_string(&self.key_path)?;
        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let ca_cert_pem = std::fs::read_to_string(&self.cert_path)?;

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate key for {}: {}", identity, e))
        })?;

        let common_name = match identity {
            "apiserver" | "admin" => format!("kube-{}", identity),
            _ => identity.to_string(),
        };

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name));
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let (not_before, not_after) = compute_validity(validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        if let Some(san) = san {
            let mut names = Vec::new();
            for dns in &san.dns_names {
                let name = Ia5String::try_from(dns.clone())
                    .map_err(|_| PkiError::InvalidSan(dns.clone()))?;
                names.push(SanType::DnsName(name));
            }
            for ip in &san.ip_addrs {
                names.push(SanType::IpAddress(*ip));
            }
            params.subject_alt_names = names;
        }

        // The CSR exists on disk only for the duration of this call.
        let csr = params.serialize_request(&leaf_key).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;
        std::fs::write(&csr_path, csr_pem)?;
        let _csr_guard = CsrFile(csr_path);

        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                identity, e
            ))
        })?;

        std::fs::write(&key_path, leaf_key.serialize_pem())?;
        std::fs::write(&cert_path, cert.pem())?;
        info!(identity, cert = %cert_path.display(), "issued certificate");

        Ok(IssuedCertificate {
            key_path,
            cert_path,
        })
    }
}
