//! Local certificate authority and wildcard leaf certificates.
//!
//! A self-signed root is created once per certificate directory. Each
//! configured domain suffix gets a wildcard leaf signed by that root, which
//! the TLS entry point serves based on the client's SNI.

mod authority;
mod resolver;
mod store;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use authority::CertificateAuthority;
pub use resolver::SniCertResolver;
pub use store::{run_renewal_loop, CertificateMetadata, CertificateStore, CA_CERT_FILE, CA_KEY_FILE};

#[derive(Debug, Error)]
pub enum CertError {
    /// No CA could be loaded or generated.
    #[error("certificate authority unavailable: {0}")]
    Unavailable(String),

    #[error("invalid domain suffix '{0}'")]
    InvalidSuffix(String),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),
}

impl CertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// An issued wildcard certificate for one domain suffix.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pub domain_suffix: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("domain_suffix", &self.domain_suffix)
            .field("not_after", &self.not_after)
            .field("key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}
