//! Start command: run the proxy in the foreground.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Args;
use hostgate_proxy::config::{Config, DiscoveryConfig, LogFormat};
use hostgate_proxy::discovery::HttpSourceConfig;
use hostgate_proxy::proxy::{is_valid_hostname, normalize_hostname};
use hostgate_proxy::{logging, run_until_shutdown, Proxy};

use crate::client::AdminClient;
use crate::error::CliError;
use crate::output::print_info;

use super::CommandContext;

/// Run the proxy until Ctrl+C or `hostgate stop`.
///
/// Settings come from `HOSTGATE_*` variables; flags override them.
#[derive(Debug, Args)]
pub struct StartCommand {
    /// Plaintext entry point address.
    #[arg(long)]
    web_addr: Option<SocketAddr>,

    /// TLS entry point address.
    #[arg(long)]
    websecure_addr: Option<SocketAddr>,

    /// Disable the TLS entry point.
    #[arg(long)]
    no_tls: bool,

    /// Domain suffix to issue a wildcard certificate for (repeatable).
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Certificate directory.
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Poll this JSON service manifest for backends.
    #[arg(long, conflicts_with = "discovery_url")]
    discovery_file: Option<PathBuf>,

    /// Tail this registry events feed for backends.
    #[arg(long)]
    discovery_url: Option<String>,

    /// Redirect TLS routes hit over plain HTTP to HTTPS.
    #[arg(long)]
    redirect_to_https: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty or json).
    #[arg(long)]
    log_format: Option<String>,
}

impl StartCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let admin_addr = ctx.admin_addr()?;
        let config = Config::from_env().map_err(CliError::Config)?;
        let config = self.apply(config, admin_addr).map_err(CliError::Config)?;

        if let Some(addr) = config.admin_addr {
            let client = AdminClient::new(addr)?;
            if client.is_up().await {
                return Err(CliError::AlreadyRunning(client.base_url().to_string()).into());
            }
        }

        logging::init(&config.log_level, config.log_format);

        print_info(&format!("Serving http://{}", config.web_addr));
        if config.websecure_enabled {
            print_info(&format!(
                "Serving https://{} for *.{}",
                config.websecure_addr,
                config.domains.join(", *.")
            ));
        }

        let proxy = Proxy::from_config(config).map_err(CliError::Config)?;
        run_until_shutdown(Arc::new(proxy))
            .await
            .map_err(CliError::Control)?;
        Ok(())
    }

    fn apply(self, mut config: Config, admin_addr: Option<SocketAddr>) -> Result<Config> {
        config.admin_addr = admin_addr;

        if let Some(addr) = self.web_addr {
            config.web_addr = addr;
        }
        if let Some(addr) = self.websecure_addr {
            config.websecure_addr = addr;
        }
        if self.no_tls {
            config.websecure_enabled = false;
        }
        if self.redirect_to_https {
            config.redirect_to_https = true;
        }

        if !self.domains.is_empty() {
            let mut domains = Vec::new();
            for domain in self.domains.iter().map(|d| normalize_hostname(d)) {
                if !is_valid_hostname(&domain) {
                    return Err(anyhow!("invalid domain suffix '{domain}'"));
                }
                if !domains.contains(&domain) {
                    domains.push(domain);
                }
            }
            config.domains = domains;
        }

        if let Some(dir) = self.cert_dir {
            config.cert_dir = dir;
        }

        let poll_interval = match &config.discovery {
            DiscoveryConfig::File { poll_interval, .. } => *poll_interval,
            DiscoveryConfig::Http(http) => http.poll_interval,
            DiscoveryConfig::None => Duration::from_secs(1),
        };
        if let Some(path) = self.discovery_file {
            config.discovery = DiscoveryConfig::File {
                path,
                poll_interval,
            };
        }
        if let Some(url) = self.discovery_url {
            let mut http = HttpSourceConfig::new(url);
            http.poll_interval = poll_interval;
            config.discovery = DiscoveryConfig::Http(http);
        }

        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format.parse::<LogFormat>().map_err(|e| anyhow!(e))?;
        }

        Ok(config)
    }
}
