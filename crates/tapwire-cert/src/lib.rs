//! Tapwire certificate core.
//!
//! Everything needed to impersonate intercepted hosts: a locally generated
//! [`RootAuthority`], the [`LeafCertService`] that synthesizes and caches
//! per-host certificates signed by it, the [`CertIdentity`] descriptor the
//! leaves are requested for, and the codec that turns credential containers
//! into portable blobs and PEM.
//!
//! The crate is runtime-agnostic; all synthesis is synchronous CPU-bound
//! cryptography, cached so the steady-state cost is one synthesis per
//! distinct intercepted host.

mod codec;
mod error;
mod identity;
mod leaf;
mod root;

pub use codec::{
    certificate_to_pem, extract_certificate, extract_private_key, from_blob, from_pem, to_blob,
    to_pem, Credentials, BEGIN_CERTIFICATE_TOKEN, BEGIN_PRIVATE_KEY_TOKEN,
    END_CERTIFICATE_TOKEN, END_PRIVATE_KEY_TOKEN,
};
pub use error::{CertError, Result};
pub use identity::{CertIdentity, SanEntry, SanKind};
pub use leaf::LeafCertService;
pub use root::{CertConfig, KeyAlgorithm, RootAuthority};
