//! On-disk certificate storage.
//!
//! Layout of the certificate directory:
//!
//! ```text
//! ca.pem              root certificate (share with clients to trust)
//! ca-key.pem          root private key (0600)
//! <suffix>.pem        leaf certificate
//! <suffix>-key.pem    leaf private key (0600)
//! <suffix>.json       leaf metadata (not_after)
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{CertError, Certificate, CertificateAuthority, SniCertResolver};
use crate::proxy::{is_valid_hostname, normalize_hostname};

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca-key.pem";

/// Default leaf validity.
pub const DEFAULT_VALIDITY_DAYS: i64 = 730;

/// Default renewal window.
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// Sidecar written next to each leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    pub domain_suffix: String,
    pub not_after: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

/// Issues and caches leaf certificates under one directory.
#[derive(Debug)]
pub struct CertificateStore {
    dir: PathBuf,
    validity: Duration,
    renew_before: Duration,
    authority: Mutex<Option<Arc<CertificateAuthority>>>,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_validity(
            dir,
            Duration::days(DEFAULT_VALIDITY_DAYS),
            Duration::days(DEFAULT_RENEW_BEFORE_DAYS),
        )
    }

    pub fn with_validity(dir: impl Into<PathBuf>, validity: Duration, renew_before: Duration) -> Self {
        Self {
            dir: dir.into(),
            validity,
            renew_before,
            authority: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// PEM of the root clients must trust.
    pub fn ca_certificate_pem(&self) -> Result<String, CertError> {
        Ok(self.authority()?.cert_pem().to_string())
    }

    /// Return a valid certificate for `suffix`, issuing one when the stored
    /// certificate is missing, unreadable, or inside the renewal window.
    pub fn ensure_certificate(&self, suffix: &str) -> Result<Certificate, CertError> {
        let suffix = normalize_hostname(suffix);
        if !is_valid_hostname(&suffix) {
            return Err(CertError::InvalidSuffix(suffix));
        }

        let authority = self.authority()?;

        match self.load_leaf(&suffix) {
            Ok(Some(cert)) => {
                let remaining = cert.not_after - Utc::now();
                if remaining > self.renew_before {
                    debug!(
                        domain_suffix = %suffix,
                        not_after = %cert.not_after,
                        "Stored certificate is current"
                    );
                    return Ok(cert);
                }
                info!(
                    domain_suffix = %suffix,
                    not_after = %cert.not_after,
                    "Certificate inside renewal window; reissuing"
                );
            }
            Ok(None) => info!(domain_suffix = %suffix, "No stored certificate; issuing"),
            Err(e) => warn!(domain_suffix = %suffix, error = %e, "Stored certificate unusable; reissuing"),
        }

        let cert = authority.issue_leaf(&suffix, self.validity)?;
        self.persist_leaf(&cert)?;
        info!(
            domain_suffix = %suffix,
            not_after = %cert.not_after,
            "Certificate issued"
        );
        Ok(cert)
    }

    /// Read stored metadata for `suffix` without issuing anything.
    pub fn metadata(&self, suffix: &str) -> Result<Option<CertificateMetadata>, CertError> {
        let path = self.dir.join(format!("{}.json", normalize_hostname(suffix)));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| CertError::io(&path, e))?;
        let meta = serde_json::from_str(&raw)
            .map_err(|e| CertError::InvalidMaterial(format!("{}: {e}", path.display())))?;
        Ok(Some(meta))
    }

    fn authority(&self) -> Result<Arc<CertificateAuthority>, CertError> {
        let mut guard = self.authority.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(authority) = guard.as_ref() {
            return Ok(Arc::clone(authority));
        }

        let authority = Arc::new(
            self.load_or_create_authority()
                .map_err(|e| CertError::Unavailable(e.to_string()))?,
        );
        *guard = Some(Arc::clone(&authority));
        Ok(authority)
    }

    fn load_or_create_authority(&self) -> Result<CertificateAuthority, CertError> {
        let cert_path = self.dir.join(CA_CERT_FILE);
        let key_path = self.dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path).map_err(|e| CertError::io(&cert_path, e))?;
            let key_pem = fs::read_to_string(&key_path).map_err(|e| CertError::io(&key_path, e))?;
            let authority = CertificateAuthority::load(&cert_pem, &key_pem)?;
            info!(dir = %self.dir.display(), "Loaded local CA");
            return Ok(authority);
        }

        fs::create_dir_all(&self.dir).map_err(|e| CertError::io(&self.dir, e))?;
        let authority = CertificateAuthority::generate()?;
        write_secret_file(&key_path, authority.key_pem().as_bytes())?;
        write_public_file(&cert_path, authority.cert_pem().as_bytes())?;
        info!(
            dir = %self.dir.display(),
            ca = %cert_path.display(),
            "Generated local CA; add it to your trust store to avoid browser warnings"
        );
        Ok(authority)
    }

    fn leaf_paths(&self, suffix: &str) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.dir.join(format!("{suffix}.pem")),
            self.dir.join(format!("{suffix}-key.pem")),
            self.dir.join(format!("{suffix}.json")),
        )
    }

    fn load_leaf(&self, suffix: &str) -> Result<Option<Certificate>, CertError> {
        let (cert_path, key_path, _) = self.leaf_paths(suffix);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        let Some(meta) = self.metadata(suffix)? else {
            return Ok(None);
        };

        let cert_pem = fs::read_to_string(&cert_path).map_err(|e| CertError::io(&cert_path, e))?;
        let key_pem = fs::read_to_string(&key_path).map_err(|e| CertError::io(&key_path, e))?;

        Ok(Some(Certificate {
            domain_suffix: meta.domain_suffix,
            cert_pem,
            key_pem,
            not_after: meta.not_after,
        }))
    }

    fn persist_leaf(&self, cert: &Certificate) -> Result<(), CertError> {
        fs::create_dir_all(&self.dir).map_err(|e| CertError::io(&self.dir, e))?;
        let (cert_path, key_path, meta_path) = self.leaf_paths(&cert.domain_suffix);

        let meta = CertificateMetadata {
            domain_suffix: cert.domain_suffix.clone(),
            not_after: cert.not_after,
            issued_at: Utc::now(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| CertError::InvalidMaterial(format!("metadata: {e}")))?;

        write_secret_file(&key_path, cert.key_pem.as_bytes())?;
        write_public_file(&cert_path, cert.cert_pem.as_bytes())?;
        // Metadata last: a leaf only counts as stored once its sidecar exists.
        write_public_file(&meta_path, &meta_json)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `contents` atomically with owner-only permissions.
fn write_secret_file(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    write_atomic(path, contents, true)
}

fn write_public_file(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    write_atomic(path, contents, false)
}

fn write_atomic(path: &Path, contents: &[u8], secret: bool) -> Result<(), CertError> {
    let tmp = temp_path(path);
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if secret { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = secret;

    let mut file = options.open(&tmp).map_err(|e| CertError::io(&tmp, e))?;
    file.write_all(contents).map_err(|e| CertError::io(&tmp, e))?;
    file.sync_all().map_err(|e| CertError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| CertError::io(path, e))
}

/// Periodically re-ensure each suffix and hot-swap renewed certificates.
pub async fn run_renewal_loop(
    store: Arc<CertificateStore>,
    resolver: Arc<SniCertResolver>,
    domains: Vec<String>,
    interval: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already ensured everything.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ca_pem = match store.ca_certificate_pem() {
                    Ok(pem) => pem,
                    Err(e) => {
                        warn!(error = %e, "Certificate renewal skipped");
                        continue;
                    }
                };
                for suffix in &domains {
                    let result = store
                        .ensure_certificate(suffix)
                        .and_then(|cert| resolver.install(&cert, &ca_pem));
                    if let Err(e) = result {
                        warn!(domain_suffix = %suffix, error = %e, "Certificate renewal failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Certificate renewal loop stopping");
                    return;
                }
            }
        }
    }
}
