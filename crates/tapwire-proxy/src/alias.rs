//! Host aliases and pass-through rules.

use regex::Regex;

use crate::error::{ProxyError, Result};

/// An additional name the proxy answers to.
///
/// Requests addressed to an enabled alias are treated as requests to the
/// proxy itself rather than forwarded, exactly as if they had used the
/// listening address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    name: String,
    enabled: bool,
}

impl Alias {
    /// Creates an enabled alias for the given host name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }

    /// Sets whether the alias is active.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The aliased host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the alias is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Tests a host name against this alias. Host names are compared
    /// case-insensitively; a disabled alias matches nothing.
    pub fn matches(&self, host: &str) -> bool {
        self.enabled && self.name.eq_ignore_ascii_case(host)
    }
}

/// A rule excluding matching authorities from interception.
///
/// Tunnels whose `host:port` authority matches an enabled rule are relayed
/// byte for byte without TLS interception.
#[derive(Debug, Clone)]
pub struct PassThrough {
    authority: Regex,
    enabled: bool,
}

impl PassThrough {
    /// Creates an enabled pass-through rule from an authority pattern.
    pub fn new(pattern: &str) -> Result<Self> {
        let authority = Regex::new(pattern)
            .map_err(|e| ProxyError::Config(format!("invalid pass-through pattern: {e}")))?;
        Ok(Self {
            authority,
            enabled: true,
        })
    }

    /// Sets whether the rule is active.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The authority pattern.
    pub fn pattern(&self) -> &str {
        self.authority.as_str()
    }

    /// Whether the rule is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Tests a `host:port` authority against this rule. A disabled rule
    /// matches nothing.
    pub fn matches(&self, authority: &str) -> bool {
        self.enabled && self.authority.is_match(authority)
    }
}
