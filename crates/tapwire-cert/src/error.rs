//! Error types for certificate generation and encoding.

use thiserror::Error;

/// Certificate error type.
#[derive(Debug, Error)]
pub enum CertError {
    /// Cryptographic or encoding failure while generating a certificate.
    ///
    /// Fatal for the root authority (interception is impossible without it),
    /// scoped to the requesting connection for leaf certificates.
    #[error("failed to generate certificate: {0}")]
    Generation(String),

    /// Failure while serializing or restoring a credential container.
    #[error("failed to encode or decode credentials: {0}")]
    Codec(String),

    /// A caller-supplied value that cannot be used, such as an identity with
    /// neither common name nor alternative names, or malformed PEM data.
    #[error("invalid argument: {0}")]
    IllegalArgument(String),
}

impl CertError {
    pub(crate) fn generation(e: impl std::fmt::Display) -> Self {
        Self::Generation(e.to_string())
    }

    pub(crate) fn codec(e: impl std::fmt::Display) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Result type for certificate operations.
pub type Result<T> = std::result::Result<T, CertError>;
