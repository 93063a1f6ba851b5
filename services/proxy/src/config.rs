//! Proxy configuration.
//!
//! Everything is env-driven (`HOSTGATE_*`); the CLI maps its flags onto the
//! same variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;

use crate::discovery::{HttpSourceConfig, LabelConfig, DEFAULT_LABEL_PREFIX};
use crate::proxy::{is_valid_hostname, normalize_hostname, EntryPoint, DEFAULT_MAX_CONNECTIONS};

pub const DEFAULT_WEB_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_WEBSECURE_ADDR: &str = "127.0.0.1:8443";
pub const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:8081";

/// Where backends come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryConfig {
    /// Routes only change through an embedded source.
    None,
    /// Poll a JSON manifest.
    File { path: PathBuf, poll_interval: Duration },
    /// Tail a registry events feed.
    Http(HttpSourceConfig),
}

/// Background health probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Consecutive failures before a service is deregistered.
    pub max_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            max_failures: 5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Plaintext entry point.
    pub web_addr: SocketAddr,

    /// TLS entry point.
    pub websecure_addr: SocketAddr,

    /// Serve the TLS entry point at all.
    pub websecure_enabled: bool,

    /// Admin API address; `None` disables it.
    pub admin_addr: Option<SocketAddr>,

    /// Domain suffixes to issue wildcard certificates for. The first one is
    /// served to clients without SNI.
    pub domains: Vec<String>,

    /// Certificate directory.
    pub cert_dir: PathBuf,

    /// Leaf certificate validity.
    pub cert_validity: chrono::Duration,

    /// Reissue when less validity than this remains.
    pub renew_before: chrono::Duration,

    /// How often to check certificates for renewal.
    pub renewal_check_interval: Duration,

    pub discovery: DiscoveryConfig,

    pub labels: LabelConfig,

    /// Deadline for TLS handshake plus first request head.
    pub header_timeout: Duration,

    /// Upper bound for the first request head.
    pub max_header_bytes: usize,

    pub connect_timeout: Duration,

    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,

    /// Drain period on stop before connections are force-closed.
    pub shutdown_grace: Duration,

    /// Maximum concurrent connections per entry point.
    pub max_connections: usize,

    pub health: HealthConfig,

    /// Redirect TLS routes hit over `web` to `websecure`.
    pub redirect_to_https: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_addr: parse_default(DEFAULT_WEB_ADDR),
            websecure_addr: parse_default(DEFAULT_WEBSECURE_ADDR),
            websecure_enabled: true,
            admin_addr: Some(parse_default(DEFAULT_ADMIN_ADDR)),
            domains: vec!["localhost".to_string()],
            cert_dir: default_cert_dir(),
            cert_validity: chrono::Duration::days(730),
            renew_before: chrono::Duration::days(30),
            renewal_check_interval: Duration::from_secs(12 * 60 * 60),
            discovery: DiscoveryConfig::None,
            labels: LabelConfig::default(),
            header_timeout: Duration::from_secs(10),
            max_header_bytes: crate::proxy::DEFAULT_MAX_HEAD_BYTES,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
            shutdown_grace: Duration::from_secs(5),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            health: HealthConfig::default(),
            redirect_to_https: false,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

fn parse_default(addr: &str) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// `<data dir>/certs`, or `./.hostgate/certs` when no home directory exists.
pub fn default_cert_dir() -> PathBuf {
    ProjectDirs::from("dev", "hostgate", "hostgate")
        .map(|dirs| dirs.data_dir().join("certs"))
        .unwrap_or_else(|| PathBuf::from(".hostgate").join("certs"))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{name} must be a boolean (got '{other}')."),
    }
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    let ms: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{name} must be an integer (milliseconds)."))?;
    Ok(Duration::from_millis(ms))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let addr = |name: &str, default: SocketAddr| -> Result<SocketAddr> {
            var(name)
                .map(|v| v.trim().parse::<SocketAddr>())
                .transpose()
                .with_context(|| format!("{name} must be a socket address (e.g. 127.0.0.1:8080)."))
                .map(|v| v.unwrap_or(default))
        };
        let flag = |name: &str, default: bool| -> Result<bool> {
            var(name)
                .map(|v| parse_bool(name, &v))
                .transpose()
                .map(|v| v.unwrap_or(default))
        };
        let millis = |name: &str, default: Duration| -> Result<Duration> {
            var(name)
                .map(|v| parse_millis(name, &v))
                .transpose()
                .map(|v| v.unwrap_or(default))
        };
        let days = |name: &str, default: chrono::Duration| -> Result<chrono::Duration> {
            var(name)
                .map(|v| v.trim().parse::<i64>())
                .transpose()
                .with_context(|| format!("{name} must be an integer (days)."))
                .map(|v| v.map(chrono::Duration::days).unwrap_or(default))
        };

        let web_addr = addr("HOSTGATE_WEB_ADDR", defaults.web_addr)?;
        let websecure_addr = addr("HOSTGATE_WEBSECURE_ADDR", defaults.websecure_addr)?;
        let websecure_enabled = flag("HOSTGATE_WEBSECURE_ENABLED", defaults.websecure_enabled)?;

        let admin_addr = match var("HOSTGATE_ADMIN_ADDR") {
            Some(v) if matches!(v.trim(), "off" | "none" | "disabled") => None,
            Some(v) => Some(
                v.trim()
                    .parse()
                    .context("HOSTGATE_ADMIN_ADDR must be a socket address or 'off'.")?,
            ),
            None => defaults.admin_addr,
        };

        let domains = match var("HOSTGATE_DOMAINS") {
            Some(raw) => {
                let mut domains = Vec::new();
                for domain in raw.split(',').map(normalize_hostname).filter(|d| !d.is_empty()) {
                    if !is_valid_hostname(&domain) {
                        bail!("HOSTGATE_DOMAINS contains an invalid domain suffix '{domain}'.");
                    }
                    if !domains.contains(&domain) {
                        domains.push(domain);
                    }
                }
                if domains.is_empty() {
                    bail!("HOSTGATE_DOMAINS must list at least one domain suffix.");
                }
                domains
            }
            None => defaults.domains,
        };

        let cert_dir = var("HOSTGATE_CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cert_dir);
        let cert_validity = days("HOSTGATE_CERT_VALIDITY_DAYS", defaults.cert_validity)?;
        let renew_before = days("HOSTGATE_CERT_RENEW_BEFORE_DAYS", defaults.renew_before)?;
        if cert_validity <= chrono::Duration::zero() {
            bail!("HOSTGATE_CERT_VALIDITY_DAYS must be positive.");
        }
        if renew_before < chrono::Duration::zero() {
            bail!("HOSTGATE_CERT_RENEW_BEFORE_DAYS must not be negative.");
        }
        if renew_before >= cert_validity {
            bail!(
                "HOSTGATE_CERT_RENEW_BEFORE_DAYS ({}) must be smaller than HOSTGATE_CERT_VALIDITY_DAYS ({}).",
                renew_before.num_days(),
                cert_validity.num_days()
            );
        }
        let renewal_check_interval = millis(
            "HOSTGATE_CERT_CHECK_INTERVAL_MS",
            defaults.renewal_check_interval,
        )?
        .max(Duration::from_secs(1));

        let poll_interval = millis("HOSTGATE_DISCOVERY_POLL_INTERVAL_MS", Duration::from_secs(1))?
            .max(Duration::from_millis(50));
        let discovery = match var("HOSTGATE_DISCOVERY").as_deref().map(str::trim) {
            None | Some("none") => DiscoveryConfig::None,
            Some("file") => {
                let path = var("HOSTGATE_DISCOVERY_FILE")
                    .map(PathBuf::from)
                    .context("HOSTGATE_DISCOVERY=file requires HOSTGATE_DISCOVERY_FILE.")?;
                DiscoveryConfig::File {
                    path,
                    poll_interval,
                }
            }
            Some("http") => {
                let url = var("HOSTGATE_DISCOVERY_URL")
                    .context("HOSTGATE_DISCOVERY=http requires HOSTGATE_DISCOVERY_URL.")?;
                let fetch_limit: i64 = var("HOSTGATE_DISCOVERY_LIMIT")
                    .map(|v| v.trim().parse::<i64>())
                    .transpose()
                    .context("HOSTGATE_DISCOVERY_LIMIT must be an integer.")?
                    .unwrap_or(200)
                    .clamp(1, 200);
                DiscoveryConfig::Http(HttpSourceConfig {
                    url,
                    poll_interval,
                    fetch_limit,
                    state_file: var("HOSTGATE_DISCOVERY_STATE_FILE").map(PathBuf::from),
                    token: var("HOSTGATE_DISCOVERY_TOKEN"),
                })
            }
            Some(other) => bail!("HOSTGATE_DISCOVERY must be one of file, http, none (got '{other}')."),
        };

        let default_entry_points = match var("HOSTGATE_LABEL_DEFAULT_ENTRYPOINTS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<EntryPoint>().map_err(anyhow::Error::msg))
                .collect::<Result<Vec<_>>>()
                .context("HOSTGATE_LABEL_DEFAULT_ENTRYPOINTS must list web and/or websecure.")?,
            None => defaults.labels.default_entry_points.clone(),
        };
        let labels = LabelConfig {
            prefix: var("HOSTGATE_LABEL_PREFIX").unwrap_or_else(|| DEFAULT_LABEL_PREFIX.to_string()),
            default_entry_points,
            exposed_by_default: flag("HOSTGATE_EXPOSED_BY_DEFAULT", defaults.labels.exposed_by_default)?,
        };

        let header_timeout = millis("HOSTGATE_HEADER_TIMEOUT_MS", defaults.header_timeout)?
            .max(Duration::from_millis(10));
        let max_header_bytes: usize = var("HOSTGATE_MAX_HEADER_BYTES")
            .map(|v| v.trim().parse::<usize>())
            .transpose()
            .context("HOSTGATE_MAX_HEADER_BYTES must be an integer.")?
            .unwrap_or(defaults.max_header_bytes)
            .clamp(1024, 1024 * 1024);
        let connect_timeout = millis("HOSTGATE_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?
            .max(Duration::from_millis(10));
        let idle_timeout = match var("HOSTGATE_IDLE_TIMEOUT_MS") {
            Some(v) if v.trim() == "0" => None,
            Some(v) => Some(parse_millis("HOSTGATE_IDLE_TIMEOUT_MS", &v)?),
            None => defaults.idle_timeout,
        };
        let shutdown_grace = millis("HOSTGATE_SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?;
        let max_connections: usize = var("HOSTGATE_MAX_CONNECTIONS")
            .map(|v| v.trim().parse::<usize>())
            .transpose()
            .context("HOSTGATE_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(defaults.max_connections)
            .max(1);

        let health = HealthConfig {
            enabled: flag("HOSTGATE_HEALTH_ENABLED", defaults.health.enabled)?,
            interval: millis("HOSTGATE_HEALTH_INTERVAL_MS", defaults.health.interval)?
                .max(Duration::from_millis(100)),
            max_failures: var("HOSTGATE_HEALTH_MAX_FAILURES")
                .map(|v| v.trim().parse::<u32>())
                .transpose()
                .context("HOSTGATE_HEALTH_MAX_FAILURES must be an integer.")?
                .unwrap_or(defaults.health.max_failures)
                .max(1),
        };

        let redirect_to_https = flag("HOSTGATE_REDIRECT_TO_HTTPS", defaults.redirect_to_https)?;

        let log_level = var("HOSTGATE_LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_format = match var("HOSTGATE_LOG_FORMAT") {
            Some(v) => v.parse().map_err(anyhow::Error::msg)?,
            None => defaults.log_format,
        };

        Ok(Self {
            web_addr,
            websecure_addr,
            websecure_enabled,
            admin_addr,
            domains,
            cert_dir,
            cert_validity,
            renew_before,
            renewal_check_interval,
            discovery,
            labels,
            header_timeout,
            max_header_bytes,
            connect_timeout,
            idle_timeout,
            shutdown_grace,
            max_connections,
            health,
            redirect_to_https,
            log_level,
            log_format,
        })
    }

    /// Primary domain suffix, served when no SNI matches.
    pub fn primary_domain(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or("localhost")
    }
}
