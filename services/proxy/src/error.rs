//! Error types shared across the proxy.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::certs::CertError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("backend {target} unreachable: {source}")]
    BackendUnreachable {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the lifecycle surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("proxy is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("admin API failed to bind {addr}: {source}")]
    Admin {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ControlError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyRunning => 1,
            Self::Cert(_) | Self::Proxy(_) | Self::Admin { .. } => 2,
        }
    }
}
