//! SNI-based certificate selection for the TLS entry point.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use super::{CertError, Certificate};
use crate::proxy::normalize_hostname;

#[derive(Clone)]
struct ResolverEntry {
    suffix: String,
    key: Arc<CertifiedKey>,
}

/// Picks the wildcard certificate whose suffix best matches the SNI.
///
/// The first installed suffix is the fallback for clients that send no SNI
/// or a name outside every configured suffix.
#[derive(Default)]
pub struct SniCertResolver {
    entries: ArcSwap<Vec<ResolverEntry>>,
}

impl fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.load();
        f.debug_struct("SniCertResolver")
            .field(
                "suffixes",
                &entries.iter().map(|e| e.suffix.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn parse_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, CertError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidMaterial(format!("certificate PEM: {e}")))
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, CertError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| CertError::InvalidMaterial(format!("private key PEM: {e}")))?
        .ok_or_else(|| CertError::InvalidMaterial("no private key found".to_string()))
}

impl SniCertResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the certificate for `cert.domain_suffix`.
    ///
    /// The served chain is the leaf followed by the CA certificate.
    pub fn install(&self, cert: &Certificate, ca_pem: &str) -> Result<(), CertError> {
        let mut chain = parse_chain(&cert.cert_pem)?;
        if chain.is_empty() {
            return Err(CertError::InvalidMaterial(
                "certificate PEM holds no certificates".to_string(),
            ));
        }
        chain.extend(parse_chain(ca_pem)?);

        let key = parse_key(&cert.key_pem)?;
        let signing_key = any_supported_type(&key)
            .map_err(|e| CertError::InvalidMaterial(format!("unsupported key: {e}")))?;

        let entry = ResolverEntry {
            suffix: cert.domain_suffix.clone(),
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
        };

        self.entries.rcu(|current| {
            let mut next = current.as_ref().clone();
            match next.iter_mut().find(|e| e.suffix == entry.suffix) {
                Some(existing) => *existing = entry.clone(),
                None => next.push(entry.clone()),
            }
            next
        });

        info!(
            domain_suffix = %cert.domain_suffix,
            not_after = %cert.not_after,
            "Certificate installed"
        );
        Ok(())
    }

    /// Suffixes with an installed certificate, in install order.
    pub fn suffixes(&self) -> Vec<String> {
        self.entries.load().iter().map(|e| e.suffix.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Select the certificate for a server name.
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let entries = self.entries.load();

        if let Some(name) = server_name {
            let name = normalize_hostname(name);
            let best = entries
                .iter()
                .filter(|e| {
                    name == e.suffix
                        || name
                            .strip_suffix(e.suffix.as_str())
                            .is_some_and(|prefix| prefix.ends_with('.'))
                })
                .max_by_key(|e| e.suffix.len());
            if let Some(entry) = best {
                debug!(sni = %name, domain_suffix = %entry.suffix, "Certificate selected");
                return Some(Arc::clone(&entry.key));
            }
            debug!(sni = %name, "No suffix matches SNI; using default certificate");
        }

        let fallback = entries.first().map(|e| Arc::clone(&e.key));
        if fallback.is_none() {
            warn!("No certificate installed");
        }
        fallback
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}
