//! TLS acceptor setup and SNI-driven certificate selection.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tapwire_cert::{CertIdentity, LeafCertService};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::{ServerConfig, TlsProtocol};
use crate::error::{ProxyError, Result};

/// Picks the impersonation certificate for a handshake.
///
/// The SNI host drives the choice; a connection without SNI falls back to
/// the configured fallback host (for intercepted tunnels, the CONNECT
/// authority) and finally to the listening address itself. Whatever is
/// picked first is bound for the rest of this resolver's lifetime, so one
/// resolver must be built per accepted connection.
pub struct SniCertResolver {
    service: Arc<LeafCertService>,
    fallback_host: Option<String>,
    listen_addr: IpAddr,
    bound: OnceCell<Arc<CertifiedKey>>,
}

impl fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("fallback_host", &self.fallback_host)
            .field("listen_addr", &self.listen_addr)
            .finish_non_exhaustive()
    }
}

impl SniCertResolver {
    /// Creates a resolver for one connection accepted on `listen_addr`.
    pub fn new(service: Arc<LeafCertService>, listen_addr: IpAddr) -> Self {
        Self {
            service,
            fallback_host: None,
            listen_addr,
            bound: OnceCell::new(),
        }
    }

    /// Sets the host to impersonate when the client sends no SNI.
    pub fn with_fallback_host(mut self, host: impl Into<String>) -> Self {
        self.fallback_host = Some(host.into());
        self
    }

    fn identity_for(&self, server_name: Option<&str>) -> CertIdentity {
        match server_name {
            Some(name) => CertIdentity::for_host(name),
            None => match &self.fallback_host {
                Some(host) => CertIdentity::for_host(host),
                None => CertIdentity::for_address(self.listen_addr),
            },
        }
    }

    fn certified_key(&self, identity: &CertIdentity) -> Result<Arc<CertifiedKey>> {
        let credentials = self.service.generate(identity)?;
        let chain: Vec<CertificateDer<'static>> = credentials
            .chain_der()
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            credentials.private_key_der().to_vec(),
        ));
        let signing_key =
            any_supported_type(&key).map_err(|e| ProxyError::Tls(format!("unusable key: {e}")))?;
        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let result = self.bound.get_or_try_init(|| {
            let identity = self.identity_for(client_hello.server_name());
            debug!(?identity, "resolving impersonation certificate");
            self.certified_key(&identity)
        });
        match result {
            Ok(key) => Some(key.clone()),
            Err(error) => {
                // Fails this handshake only; the next connection retries.
                warn!(%error, "certificate resolution failed");
                None
            }
        }
    }
}

/// Builds a TLS acceptor offering the configured protocol versions, serving
/// certificates from the given resolver. Only HTTP/1.1 is spoken inside the
/// tunnel, so that is the only ALPN protocol offered.
pub fn build_tls_acceptor(
    config: &ServerConfig,
    resolver: Arc<SniCertResolver>,
) -> Result<TlsAcceptor> {
    let versions: Vec<&'static rustls::SupportedProtocolVersion> = config
        .tls_protocols()
        .iter()
        .map(|protocol| match protocol {
            TlsProtocol::Tlsv1_2 => &rustls::version::TLS12,
            TlsProtocol::Tlsv1_3 => &rustls::version::TLS13,
        })
        .collect();
    if versions.is_empty() {
        return Err(ProxyError::Config(
            "no TLS protocol versions enabled".to_string(),
        ));
    }
    let mut tls_config = rustls::ServerConfig::builder_with_protocol_versions(&versions)
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tapwire_cert::{CertConfig, KeyAlgorithm, RootAuthority, SanKind};

    use super::*;

    fn service() -> Arc<LeafCertService> {
        let config = CertConfig::new(Duration::from_secs(825 * 24 * 60 * 60))
            .with_key_algorithm(KeyAlgorithm::EcdsaP256);
        let root = Arc::new(RootAuthority::generate(&config).unwrap());
        Arc::new(LeafCertService::new(root, config).unwrap())
    }

    #[test]
    fn sni_host_drives_identity() {
        let resolver = SniCertResolver::new(service(), IpAddr::from([127, 0, 0, 1]));
        let identity = resolver.identity_for(Some("example.org"));
        assert_eq!(identity.common_name(), Some("example.org"));
    }

    #[test]
    fn missing_sni_falls_back_to_configured_host() {
        let resolver = SniCertResolver::new(service(), IpAddr::from([127, 0, 0, 1]))
            .with_fallback_host("tunnel.example.org");
        let identity = resolver.identity_for(None);
        assert_eq!(identity.common_name(), Some("tunnel.example.org"));
    }

    #[test]
    fn missing_sni_without_fallback_uses_listen_address() {
        let resolver = SniCertResolver::new(service(), IpAddr::from([192, 0, 2, 1]));
        let identity = resolver.identity_for(None);
        assert_eq!(identity.common_name(), None);
        assert_eq!(identity.subject_alt_names().len(), 1);
        assert_eq!(identity.subject_alt_names()[0].kind(), SanKind::Ip);
        assert_eq!(identity.subject_alt_names()[0].value(), "192.0.2.1");
    }

    #[test]
    fn certified_key_carries_leaf_and_root() {
        let resolver = SniCertResolver::new(service(), IpAddr::from([127, 0, 0, 1]));
        let identity = CertIdentity::for_host("example.org");
        let key = resolver.certified_key(&identity).unwrap();
        assert_eq!(key.cert.len(), 2);
    }

    #[test]
    fn repeated_resolution_reuses_cached_credentials() {
        let service = service();
        let resolver = SniCertResolver::new(service.clone(), IpAddr::from([127, 0, 0, 1]));
        let identity = CertIdentity::for_host("example.org");
        resolver.certified_key(&identity).unwrap();
        resolver.certified_key(&identity).unwrap();
        assert_eq!(service.generated_count(), 1);
    }

    #[test]
    fn acceptor_requires_at_least_one_protocol() {
        let resolver = Arc::new(SniCertResolver::new(service(), IpAddr::from([127, 0, 0, 1])));
        let config = ServerConfig::default().with_tls_protocols(Vec::new());
        assert!(matches!(
            build_tls_acceptor(&config, resolver),
            Err(ProxyError::Config(_))
        ));
    }
}
