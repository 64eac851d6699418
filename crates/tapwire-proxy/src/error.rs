//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Certificate error.
    #[error("certificate error: {0}")]
    Cert(#[from] tapwire_cert::CertError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed HTTP data received from a client.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Invalid server configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
