//! Root certificate authority.
//!
//! Generates and holds the self-signed root key pair and certificate used to
//! sign per-host leaf certificates. The authority is an explicit value owned
//! by the proxy's composition root; generation failure is fatal to startup
//! since interception is impossible without it.

use std::time::Duration as StdDuration;

use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, CrlDistributionPoint, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use ::time::{Duration, OffsetDateTime};
use x509_parser::prelude::*;

use crate::codec::{self, Credentials};
use crate::error::{CertError, Result};

/// Serials are confined to a positive 48-bit space.
pub(crate) const SERIAL_MASK: u64 = 0x7FFF_FFFF_FFFF;

/// Key pair algorithm used for generated certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    /// 2048-bit RSA, signed with SHA-256.
    #[default]
    Rsa2048,
    /// NIST P-256 ECDSA, signed with SHA-256.
    EcdsaP256,
}

/// Configuration for certificate generation.
#[derive(Debug, Clone)]
pub struct CertConfig {
    /// Validity duration of the root certificate.
    pub validity: StdDuration,
    /// Optional CRL distribution point URL added to the root certificate.
    pub crl_distribution_point: Option<String>,
    /// Key pair algorithm for root and leaf keys.
    pub key_algorithm: KeyAlgorithm,
}

impl CertConfig {
    /// Creates a configuration with the given root validity.
    pub fn new(validity: StdDuration) -> Self {
        Self {
            validity,
            crl_distribution_point: None,
            key_algorithm: KeyAlgorithm::default(),
        }
    }

    /// Sets the CRL distribution point URL.
    pub fn with_crl_distribution_point(mut self, url: impl Into<String>) -> Self {
        self.crl_distribution_point = Some(url.into());
        self
    }

    /// Sets the key pair algorithm.
    pub fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }
}

impl Default for CertConfig {
    fn default() -> Self {
        // 825 days, above the longest leaf validity the root will sign plus
        // clock-skew tolerance.
        Self::new(StdDuration::from_secs(825 * 24 * 60 * 60))
    }
}

/// The root authority: self-signed certificate plus private key.
#[derive(Debug, Clone)]
pub struct RootAuthority {
    credentials: Credentials,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl RootAuthority {
    /// Generates a new root authority.
    ///
    /// The certificate subject carries fixed organization fields plus a
    /// locality derived from a non-reversible hash of local machine
    /// identifiers, stable across runs on the same machine.
    pub fn generate(config: &CertConfig) -> Result<Self> {
        let key_pkcs8 = generate_key_pkcs8(config.key_algorithm)?;
        let key_pair = load_key_pair(&key_pkcs8)?;

        let not_before = OffsetDateTime::now_utc();
        let validity = Duration::try_from(config.validity)
            .map_err(|_| CertError::IllegalArgument("root validity out of range".into()))?;
        let not_after = not_before + validity;

        let mut params = CertificateParams::default();
        params.distinguished_name = root_subject();
        params.serial_number = Some(SerialNumber::from(
            (rand::thread_rng().gen::<u64>() & SERIAL_MASK).to_be_bytes().to_vec(),
        ));
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
            KeyUsagePurpose::CrlSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::Any,
        ];
        if let Some(url) = &config.crl_distribution_point {
            params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: vec![url.clone()],
            }];
        }

        let certificate = params
            .self_signed(&key_pair)
            .map_err(CertError::generation)?;

        tracing::info!("Generated root CA certificate, valid until {}", not_after);

        Ok(Self {
            credentials: Credentials::new(key_pkcs8, vec![certificate.der().to_vec()])?,
            not_before,
            not_after,
        })
    }

    /// Restores an authority from an existing credential container.
    ///
    /// Used for the persisted blob and for user-supplied PEM roots; the
    /// private key and certificate are validated before use.
    pub fn from_credentials(credentials: Credentials) -> Result<Self> {
        load_key_pair(credentials.private_key_der())?;

        let (_, certificate) = X509Certificate::from_der(credentials.certificate_der())
            .map_err(|e| CertError::IllegalArgument(format!("invalid root certificate: {e}")))?;
        if !certificate.is_ca() {
            return Err(CertError::IllegalArgument(
                "root certificate is not a certificate authority".into(),
            ));
        }
        let validity = certificate.validity();
        let not_before = validity.not_before.to_datetime();
        let not_after = validity.not_after.to_datetime();

        Ok(Self {
            credentials,
            not_before,
            not_after,
        })
    }

    /// Serializes the authority into an opaque text blob.
    pub fn serialize(&self) -> Result<String> {
        codec::to_blob(&self.credentials)
    }

    /// Restores an authority from a blob produced by [`serialize`].
    ///
    /// [`serialize`]: Self::serialize
    pub fn deserialize(blob: &str) -> Result<Self> {
        Self::from_credentials(codec::from_blob(blob)?)
    }

    /// Restores an authority from PEM contents holding a certificate and a
    /// private key section.
    pub fn from_pem(contents: &str) -> Result<Self> {
        Self::from_credentials(codec::from_pem(contents)?)
    }

    /// Writes the certificate and private key as PEM.
    pub fn to_pem(&self) -> String {
        codec::to_pem(&self.credentials)
    }

    /// Writes only the certificate as PEM, for client trust installation.
    pub fn certificate_pem(&self) -> String {
        codec::certificate_to_pem(&self.credentials)
    }

    /// Returns the credential container.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns the certificate DER.
    pub fn certificate_der(&self) -> &[u8] {
        self.credentials.certificate_der()
    }

    /// Returns the private key as PKCS#8 DER.
    pub fn private_key_der(&self) -> &[u8] {
        self.credentials.private_key_der()
    }

    /// Start of the certificate validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the certificate validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Total validity duration of the root certificate.
    pub fn validity(&self) -> StdDuration {
        (self.not_after - self.not_before)
            .try_into()
            .unwrap_or(StdDuration::ZERO)
    }
}

/// Builds the fixed root subject with the anonymized locality.
fn root_subject() -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, "Tapwire Root CA");
    name.push(DnType::LocalityName, machine_locality());
    name.push(DnType::OrganizationName, "Tapwire");
    name.push(DnType::OrganizationalUnitName, "Tapwire Root CA");
    name.push(DnType::CountryName, "xx");
    name
}

/// Hashes local machine identifiers into a short hex value.
///
/// Keeps anonymity while letting users distinguish authorities generated on
/// different machines.
fn machine_locality() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let home = directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().display().to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update(home.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Generates a new private key as PKCS#8 DER.
pub(crate) fn generate_key_pkcs8(algorithm: KeyAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        KeyAlgorithm::Rsa2048 => {
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
                .map_err(CertError::generation)?;
            let document = key.to_pkcs8_der().map_err(CertError::generation)?;
            Ok(document.as_bytes().to_vec())
        }
        KeyAlgorithm::EcdsaP256 => {
            let key_pair = KeyPair::generate().map_err(CertError::generation)?;
            Ok(key_pair.serialize_der())
        }
    }
}

/// Loads a signing key pair from PKCS#8 DER, detecting the algorithm.
pub(crate) fn load_key_pair(key_pkcs8: &[u8]) -> Result<KeyPair> {
    KeyPair::try_from(key_pkcs8).map_err(CertError::generation)
}
