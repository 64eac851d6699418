//! Server configuration.

use std::net::IpAddr;
use std::time::Duration;

use regex::Regex;

use crate::alias::{Alias, PassThrough};

/// Which surfaces a server exposes.
///
/// Recursive requests (requests addressed to the proxy itself) are answered
/// locally when the mode includes the API surface and refused when it does
/// not; forwarding is only performed when the mode includes the proxy
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// Answer recursive requests locally and forward the rest.
    #[default]
    ApiAndProxy,
    /// Only answer recursive requests; refuse to forward.
    Api,
    /// Only forward; recursive requests are refused.
    Proxy,
}

impl ServerMode {
    /// Whether recursive requests are served locally.
    pub fn has_api(self) -> bool {
        matches!(self, Self::ApiAndProxy | Self::Api)
    }

    /// Whether non-recursive requests are forwarded.
    pub fn has_proxy(self) -> bool {
        matches!(self, Self::ApiAndProxy | Self::Proxy)
    }
}

/// TLS protocol versions the server may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocol {
    /// TLS 1.2
    Tlsv1_2,
    /// TLS 1.3
    Tlsv1_3,
}

/// Configuration for a single listening server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    address: IpAddr,
    port: u16,
    mode: ServerMode,
    tls_protocols: Vec<TlsProtocol>,
    behind_nat: bool,
    remove_accept_encoding: bool,
    decode_response: bool,
    aliases: Vec<Alias>,
    pass_throughs: Vec<PassThrough>,
    global_exclusions: Vec<Regex>,
    session_exclusions: Vec<Regex>,
    serialise: bool,
    read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            mode: ServerMode::default(),
            tls_protocols: vec![TlsProtocol::Tlsv1_2, TlsProtocol::Tlsv1_3],
            behind_nat: false,
            remove_accept_encoding: true,
            decode_response: true,
            aliases: Vec::new(),
            pass_throughs: Vec::new(),
            global_exclusions: Vec::new(),
            session_exclusions: Vec::new(),
            serialise: false,
            read_timeout: Duration::from_secs(20),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration listening on the given address and port.
    /// Port 0 asks the system for an ephemeral port at bind time.
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            ..Self::default()
        }
    }

    /// Sets the server mode.
    pub fn with_mode(mut self, mode: ServerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the TLS protocol versions offered to clients.
    pub fn with_tls_protocols(mut self, protocols: Vec<TlsProtocol>) -> Self {
        self.tls_protocols = protocols;
        self
    }

    /// Marks the server as reachable through NAT, so externally addressed
    /// requests may still be recursive.
    pub fn with_behind_nat(mut self, behind_nat: bool) -> Self {
        self.behind_nat = behind_nat;
        self
    }

    /// Sets whether `Accept-Encoding` is stripped from forwarded requests.
    pub fn with_remove_accept_encoding(mut self, remove: bool) -> Self {
        self.remove_accept_encoding = remove;
        self
    }

    /// Sets whether compressed response bodies are decoded.
    pub fn with_decode_response(mut self, decode: bool) -> Self {
        self.decode_response = decode;
        self
    }

    /// Sets the host aliases the server answers to.
    pub fn with_aliases(mut self, aliases: Vec<Alias>) -> Self {
        self.aliases = aliases;
        self
    }

    /// Sets the pass-through rules.
    pub fn with_pass_throughs(mut self, pass_throughs: Vec<PassThrough>) -> Self {
        self.pass_throughs = pass_throughs;
        self
    }

    /// Sets the installation-wide exclusion patterns.
    pub fn with_global_exclusions(mut self, exclusions: Vec<Regex>) -> Self {
        self.global_exclusions = exclusions;
        self
    }

    /// Sets the per-session exclusion patterns.
    pub fn with_session_exclusions(mut self, exclusions: Vec<Regex>) -> Self {
        self.session_exclusions = exclusions;
        self
    }

    /// Sets whether non-excluded messages are processed one at a time.
    pub fn with_serialise(mut self, serialise: bool) -> Self {
        self.serialise = serialise;
        self
    }

    /// Sets how long an idle connection is kept before being closed.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// The listening address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The server mode.
    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// The TLS protocol versions offered to clients.
    pub fn tls_protocols(&self) -> &[TlsProtocol] {
        &self.tls_protocols
    }

    /// Whether `Accept-Encoding` is stripped from forwarded requests.
    pub fn remove_accept_encoding(&self) -> bool {
        self.remove_accept_encoding
    }

    /// Whether compressed response bodies are decoded.
    pub fn decode_response(&self) -> bool {
        self.decode_response
    }

    /// Whether non-excluded messages are processed one at a time.
    pub fn serialise(&self) -> bool {
        self.serialise
    }

    /// How long an idle connection is kept before being closed.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Tests a request URI against the global and session exclusion
    /// patterns. Excluded messages skip most handlers and never take the
    /// serialisation lock.
    pub fn is_excluded(&self, uri: &str) -> bool {
        self.global_exclusions
            .iter()
            .chain(self.session_exclusions.iter())
            .any(|pattern| pattern.is_match(uri))
    }

    /// Tests a tunnel authority against the pass-through rules.
    pub fn is_pass_through(&self, authority: &str) -> bool {
        self.pass_throughs.iter().any(|rule| rule.matches(authority))
    }

    /// Tests whether a request addressed to `host:port` targets this server
    /// itself rather than a remote host.
    pub fn is_recursive_target(&self, host: &str, port: u16) -> bool {
        if port != self.port {
            return false;
        }
        if self.aliases.iter().any(|alias| alias.matches(host)) {
            return true;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                ip == self.address
                    || (self.address.is_unspecified() && ip.is_loopback())
                    || self.behind_nat
            }
            Err(_) => {
                host.eq_ignore_ascii_case("localhost")
                    && (self.address.is_loopback() || self.address.is_unspecified())
            }
        }
    }
}
