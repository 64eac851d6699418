//! Per-host leaf certificate synthesis.
//!
//! The [`LeafCertService`] synthesizes host certificates signed by the root
//! authority and memoizes them by identity: structurally equal identities
//! always yield the same container, so synthesis happens at most once per
//! distinct host for the lifetime of the proxy session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use ::time::{Duration, OffsetDateTime};
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    SanType, SerialNumber,
};
use rustls_pki_types::CertificateDer;
use x509_parser::prelude::*;

use crate::codec::Credentials;
use crate::error::{CertError, Result};
use crate::identity::{CertIdentity, SanKind};
use crate::root::{generate_key_pkcs8, load_key_pair, CertConfig, RootAuthority, SERIAL_MASK};

/// OID of the subjectAlternativeName extension (2.5.29.17).
const SUBJECT_ALT_NAME_OID: &[u64] = &[2, 5, 29, 17];

/// Leaf certificates are back-dated by 30 days to tolerate clock skew
/// between client, proxy and server.
const START_ADJUSTMENT: Duration = Duration::days(30);

/// Serial seeds stay within 40 bits, leaving the counter 2^46 increments of
/// headroom below [`SERIAL_MASK`] so it cannot wrap within a process.
const SERIAL_SEED_MASK: u64 = 0xFF_FFFF_FFFF;

/// Synthesizes and caches leaf certificates signed by a root authority.
pub struct LeafCertService {
    root: Arc<RootAuthority>,
    config: CertConfig,
    issuer: Issuer<'static, KeyPair>,
    // Single coarse lock: synthesis is rare relative to request volume, so
    // correctness wins over throughput.
    cache: Mutex<HashMap<CertIdentity, Arc<Credentials>>>,
    serial: AtomicU64,
    generated: AtomicUsize,
}

impl LeafCertService {
    /// Creates a service signing with the given root authority.
    pub fn new(root: Arc<RootAuthority>, config: CertConfig) -> Result<Self> {
        let root_key = load_key_pair(root.private_key_der())?;
        let root_der = CertificateDer::from(root.certificate_der().to_vec());
        let issuer =
            Issuer::from_ca_cert_der(&root_der, root_key).map_err(CertError::generation)?;

        // Random seed so serials never repeat across restarts, bounded well
        // below the serial mask so the increment cannot wrap.
        let seed = rand::thread_rng().gen::<u64>() & SERIAL_SEED_MASK;

        Ok(Self {
            root,
            config,
            issuer,
            cache: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(seed),
            generated: AtomicUsize::new(0),
        })
    }

    /// Returns the root authority certificates are signed with.
    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    /// Number of certificates synthesized so far.
    pub fn generated_count(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    /// Returns the credential container for the given identity.
    ///
    /// A cache hit returns the previously produced container; a miss
    /// synthesizes a new certificate under the generation lock. Entries are
    /// never evicted during a session, the key space is bounded by the number
    /// of distinct intercepted hosts.
    pub fn generate(&self, identity: &CertIdentity) -> Result<Arc<Credentials>> {
        let mut cache = self.cache.lock();
        if let Some(credentials) = cache.get(identity) {
            tracing::trace!(?identity, "leaf certificate cache hit");
            return Ok(Arc::clone(credentials));
        }

        tracing::debug!(?identity, "synthesizing leaf certificate");
        let credentials = Arc::new(self.synthesize(identity)?);
        cache.insert(identity.clone(), Arc::clone(&credentials));
        self.generated.fetch_add(1, Ordering::Relaxed);
        Ok(credentials)
    }

    fn synthesize(&self, identity: &CertIdentity) -> Result<Credentials> {
        let key_pkcs8 = generate_key_pkcs8(self.config.key_algorithm)?;
        let leaf_key = load_key_pair(&key_pkcs8)?;

        let mut params = CertificateParams::default();
        let mut subject = rcgen::DistinguishedName::new();
        if let Some(common_name) = identity.common_name() {
            subject.push(DnType::CommonName, common_name);
        }
        subject.push(DnType::OrganizationalUnitName, "Tapwire Proxy");
        subject.push(DnType::OrganizationName, "Tapwire");
        subject.push(DnType::CountryName, "xx");
        params.distinguished_name = subject;

        params.is_ca = IsCa::ExplicitNoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(
            self.next_serial().to_be_bytes().to_vec(),
        ));

        let now = OffsetDateTime::now_utc();
        params.not_before = now - START_ADJUSTMENT;
        // The forward bound never exceeds the root's own remaining validity.
        let root_validity = Duration::try_from(self.root.validity())
            .map_err(|_| CertError::Generation("root validity out of range".into()))?;
        params.not_after = (now + root_validity - START_ADJUSTMENT).min(self.root.not_after());

        if !identity.subject_alt_names().is_empty() {
            if identity.common_name().is_some() {
                params.subject_alt_names = san_types(identity)?;
            } else {
                // Without a common name the alternative names are the only
                // identity: mark the extension critical so clients that
                // ignore the CN are forced to match a SAN.
                let mut extension = CustomExtension::from_oid_content(
                    SUBJECT_ALT_NAME_OID,
                    encode_general_names(identity)?,
                );
                extension.set_criticality(true);
                params.custom_extensions.push(extension);
            }
        }

        let certificate = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(CertError::generation)?;
        let leaf_der = certificate.der().to_vec();

        self.verify_against_root(&leaf_der)?;

        Credentials::new(
            key_pkcs8,
            vec![leaf_der, self.root.certificate_der().to_vec()],
        )
    }

    /// Self-check: the produced leaf must verify against the root public key
    /// and be currently valid.
    fn verify_against_root(&self, leaf_der: &[u8]) -> Result<()> {
        let (_, leaf) =
            X509Certificate::from_der(leaf_der).map_err(CertError::generation)?;
        let (_, root) = X509Certificate::from_der(self.root.certificate_der())
            .map_err(CertError::generation)?;

        leaf.verify_signature(Some(root.public_key()))
            .map_err(|e| CertError::Generation(format!("leaf failed root verification: {e}")))?;
        if !leaf.validity().is_valid() {
            return Err(CertError::Generation(
                "synthesized leaf certificate is not currently valid".into(),
            ));
        }
        Ok(())
    }

    fn next_serial(&self) -> u64 {
        // Monotonic within the process; the random seed keeps serials from
        // repeating across restarts, defeating clients that cache by serial.
        // The seed bound guarantees the sum stays below the mask.
        (self.serial.fetch_add(1, Ordering::Relaxed) + 1) & SERIAL_MASK
    }
}

impl std::fmt::Debug for LeafCertService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertService")
            .field("cached", &self.cache.lock().len())
            .field("generated", &self.generated_count())
            .finish()
    }
}

/// Converts the identity SAN list into rcgen entries (non-critical path).
fn san_types(identity: &CertIdentity) -> Result<Vec<SanType>> {
    identity
        .subject_alt_names()
        .iter()
        .map(|entry| match entry.kind() {
            SanKind::Dns => {
                let name = Ia5String::try_from(entry.value()).map_err(|e| {
                    CertError::IllegalArgument(format!("invalid DNS name: {e}"))
                })?;
                Ok(SanType::DnsName(name))
            }
            SanKind::Ip => entry
                .ip_addr()
                .map(SanType::IpAddress)
                .ok_or_else(|| {
                    CertError::IllegalArgument(format!(
                        "invalid IP address: {}",
                        entry.value()
                    ))
                }),
        })
        .collect()
}

/// DER-encodes the identity SAN list as a GeneralNames sequence, used when
/// the extension must be marked critical.
fn encode_general_names(identity: &CertIdentity) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    for entry in identity.subject_alt_names() {
        match entry.kind() {
            SanKind::Dns => {
                // dNSName [2] IA5String
                content.push(0x82);
                push_der_length(&mut content, entry.value().len());
                content.extend_from_slice(entry.value().as_bytes());
            }
            SanKind::Ip => {
                // iPAddress [7] OCTET STRING
                let addr = entry.ip_addr().ok_or_else(|| {
                    CertError::IllegalArgument(format!("invalid IP address: {}", entry.value()))
                })?;
                let octets = match addr {
                    std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
                    std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
                };
                content.push(0x87);
                push_der_length(&mut content, octets.len());
                content.extend_from_slice(&octets);
            }
        }
    }

    let mut encoded = vec![0x30];
    push_der_length(&mut encoded, content.len());
    encoded.extend_from_slice(&content);
    Ok(encoded)
}

fn push_der_length(buf: &mut Vec<u8>, length: usize) {
    if length < 0x80 {
        buf.push(length as u8);
    } else if length < 0x100 {
        buf.push(0x81);
        buf.push(length as u8);
    } else {
        buf.push(0x82);
        buf.push((length >> 8) as u8);
        buf.push(length as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SanEntry;
    use crate::root::KeyAlgorithm;

    fn test_service() -> LeafCertService {
        let config = CertConfig::default().with_key_algorithm(KeyAlgorithm::EcdsaP256);
        let root = Arc::new(RootAuthority::generate(&config).unwrap());
        LeafCertService::new(root, config).unwrap()
    }

    fn parse(der: &[u8]) -> X509Certificate<'_> {
        X509Certificate::from_der(der).unwrap().1
    }

    #[test]
    fn equal_identities_share_one_container() {
        let service = test_service();
        let a = service
            .generate(&CertIdentity::for_host("example.org"))
            .unwrap();
        let b = service
            .generate(&CertIdentity::for_host("example.org"))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(service.generated_count(), 1);
    }

    #[test]
    fn concurrent_generation_synthesizes_once() {
        let service = Arc::new(test_service());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            handles.push(std::thread::spawn(move || {
                service
                    .generate(&CertIdentity::for_host("example.org"))
                    .unwrap()
            }));
        }
        let containers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(service.generated_count(), 1);
        for container in &containers[1..] {
            assert!(Arc::ptr_eq(&containers[0], container));
        }
    }

    #[test]
    fn distinct_identities_get_distinct_certificates() {
        let service = test_service();
        let a = service
            .generate(&CertIdentity::for_host("a.example.org"))
            .unwrap();
        let b = service
            .generate(&CertIdentity::for_host("b.example.org"))
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(service.generated_count(), 2);
    }

    #[test]
    fn serials_are_strictly_increasing() {
        let service = test_service();
        let a = service
            .generate(&CertIdentity::for_host("a.example.org"))
            .unwrap();
        let b = service
            .generate(&CertIdentity::for_host("b.example.org"))
            .unwrap();

        let serial_a = parse(a.certificate_der()).serial.clone();
        let serial_b = parse(b.certificate_der()).serial.clone();
        assert!(serial_b > serial_a);
    }

    #[test]
    fn serial_seed_leaves_increment_headroom() {
        for _ in 0..32 {
            let service = test_service();
            let seed = service.serial.load(std::sync::atomic::Ordering::Relaxed);
            assert!(seed <= SERIAL_SEED_MASK);
        }
        assert!(SERIAL_SEED_MASK < SERIAL_MASK);
    }

    #[test]
    fn san_is_critical_without_common_name() {
        let service = test_service();
        let identity =
            CertIdentity::new(None, vec![SanEntry::ip("192.0.2.10".parse().unwrap())]).unwrap();
        let credentials = service.generate(&identity).unwrap();

        let cert = parse(credentials.certificate_der());
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(san.critical);
        assert!(matches!(
            &san.value.general_names[0],
            GeneralName::IPAddress(octets) if *octets == [192, 0, 2, 10]
        ));
    }

    #[test]
    fn san_is_not_critical_with_common_name() {
        let service = test_service();
        let credentials = service
            .generate(&CertIdentity::for_host("example.org"))
            .unwrap();

        let cert = parse(credentials.certificate_der());
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(!san.critical);
    }

    #[test]
    fn leaf_validity_stays_within_root_window() {
        let service = test_service();
        let credentials = service
            .generate(&CertIdentity::for_host("example.org"))
            .unwrap();

        let cert = parse(credentials.certificate_der());
        let not_before = cert.validity().not_before.to_datetime();
        let not_after = cert.validity().not_after.to_datetime();

        let now = OffsetDateTime::now_utc();
        assert!(not_before <= now - Duration::days(29));
        assert!(not_after <= service.root().not_after());
        assert!(cert.validity().is_valid());
    }

    #[test]
    fn generated_leaf_verifies_against_root() {
        // Identity {commonName: "example.org"} with the default 825-day root.
        let service = test_service();
        let credentials = service
            .generate(&CertIdentity::for_host("example.org"))
            .unwrap();

        let cert = parse(credentials.certificate_der());
        assert!(cert.subject().to_string().contains("CN=example.org"));

        let root_cert = parse(service.root().certificate_der());
        assert_eq!(cert.issuer(), root_cert.subject());

        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(!san.critical);
        assert!(matches!(
            &san.value.general_names[0],
            GeneralName::DNSName("example.org")
        ));

        assert!(cert.verify_signature(Some(root_cert.public_key())).is_ok());
    }

    #[test]
    fn chain_holds_leaf_then_root() {
        let service = test_service();
        let credentials = service
            .generate(&CertIdentity::for_host("example.org"))
            .unwrap();

        assert_eq!(credentials.chain_der().len(), 2);
        assert_eq!(
            credentials.chain_der()[1].as_slice(),
            service.root().certificate_der()
        );
    }

    #[test]
    fn general_names_encoding_is_valid_der() {
        let identity = CertIdentity::new(
            None,
            vec![
                SanEntry::dns("example.org"),
                SanEntry::ip("192.0.2.10".parse().unwrap()),
            ],
        )
        .unwrap();
        let encoded = encode_general_names(&identity).unwrap();

        // SEQUENCE, definite length, then the two tagged entries.
        assert_eq!(encoded[0], 0x30);
        assert_eq!(encoded[1] as usize, encoded.len() - 2);
        assert_eq!(encoded[2], 0x82);
        assert_eq!(encoded[3] as usize, "example.org".len());
    }

    #[test]
    fn long_der_lengths_use_multi_byte_form() {
        let mut buf = Vec::new();
        push_der_length(&mut buf, 0x7F);
        assert_eq!(buf, vec![0x7F]);

        buf.clear();
        push_der_length(&mut buf, 0x80);
        assert_eq!(buf, vec![0x81, 0x80]);

        buf.clear();
        push_der_length(&mut buf, 0x1234);
        assert_eq!(buf, vec![0x82, 0x12, 0x34]);
    }
}
