//! Identity descriptor for leaf certificate requests.
//!
//! A [`CertIdentity`] names the subject a synthesized certificate must cover:
//! an optional common name plus an ordered list of subject alternative names.
//! Equality is structural, so the leaf cache can key on it directly.

use std::net::IpAddr;

use crate::error::{CertError, Result};

/// Kind of a subject alternative name entry.
///
/// The numeric values mirror the X.509 GeneralName type codes and are part of
/// the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SanKind {
    /// DNS name (GeneralName type 2).
    Dns = 2,
    /// IP address (GeneralName type 7).
    Ip = 7,
}

/// A single subject alternative name entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SanEntry {
    kind: SanKind,
    value: String,
}

impl SanEntry {
    /// Creates a DNS name entry.
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: SanKind::Dns,
            value: value.into(),
        }
    }

    /// Creates an IP address entry.
    pub fn ip(addr: IpAddr) -> Self {
        Self {
            kind: SanKind::Ip,
            value: addr.to_string(),
        }
    }

    /// Returns the kind of this entry.
    pub fn kind(&self) -> SanKind {
        self.kind
    }

    /// Returns the entry value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Parses the value of an IP entry.
    pub(crate) fn ip_addr(&self) -> Option<IpAddr> {
        match self.kind {
            SanKind::Ip => self.value.parse().ok(),
            SanKind::Dns => None,
        }
    }
}

/// Descriptor of the identity a leaf certificate must be generated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertIdentity {
    common_name: Option<String>,
    subject_alt_names: Vec<SanEntry>,
}

impl CertIdentity {
    /// Creates a new identity.
    ///
    /// Returns [`CertError::IllegalArgument`] if neither a common name nor at
    /// least one alternative name is given.
    pub fn new(common_name: Option<String>, subject_alt_names: Vec<SanEntry>) -> Result<Self> {
        if common_name.is_none() && subject_alt_names.is_empty() {
            return Err(CertError::IllegalArgument(
                "commonName is absent and no subjectAlternativeNames are specified".into(),
            ));
        }
        Ok(Self {
            common_name,
            subject_alt_names,
        })
    }

    /// Builds the identity for a requested host name.
    ///
    /// An IP-shaped host becomes an identity with a single IP alternative name
    /// and no common name; a DNS name becomes the common name plus a matching
    /// DNS alternative name.
    pub fn for_host(host: &str) -> Self {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Self {
                common_name: None,
                subject_alt_names: vec![SanEntry::ip(addr)],
            };
        }
        Self {
            common_name: Some(host.to_string()),
            subject_alt_names: vec![SanEntry::dns(host)],
        }
    }

    /// Builds the identity for a listening address, used when a client sends
    /// no server name at all.
    pub fn for_address(addr: IpAddr) -> Self {
        Self {
            common_name: None,
            subject_alt_names: vec![SanEntry::ip(addr)],
        }
    }

    /// Returns the common name, if any.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Returns the ordered alternative name list.
    pub fn subject_alt_names(&self) -> &[SanEntry] {
        &self.subject_alt_names
    }
}
