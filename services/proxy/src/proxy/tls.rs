//! TLS termination for the `websecure` entry point.

use std::sync::Arc;

use rustls::crypto::ring;
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::certs::SniCertResolver;
use crate::error::ProxyError;

/// Build an acceptor that picks certificates through `resolver`.
///
/// Only HTTP/1.1 is offered over ALPN.
pub fn build_tls_acceptor(resolver: Arc<SniCertResolver>) -> Result<TlsAcceptor, ProxyError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
