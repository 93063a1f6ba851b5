//! hostgate daemon
//!
//! Loads configuration from `HOSTGATE_*` variables, starts both entry points
//! and the admin API, and runs until Ctrl+C or `POST /shutdown`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use hostgate_proxy::{logging, run_until_shutdown, Config, Proxy};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env().context("invalid configuration") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hostgated: {e:#}");
            return ExitCode::from(2);
        }
    };

    logging::init(&config.log_level, config.log_format);

    info!("Starting hostgate proxy");
    info!(
        web_addr = %config.web_addr,
        websecure_addr = %config.websecure_addr,
        websecure_enabled = config.websecure_enabled,
        admin_addr = ?config.admin_addr,
        cert_dir = %config.cert_dir.display(),
        domains = ?config.domains,
        "Configuration loaded"
    );

    let proxy = match Proxy::from_config(config) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!(error = %e, "Failed to create discovery source");
            return ExitCode::from(2);
        }
    };

    match run_until_shutdown(proxy).await {
        Ok(()) => {
            info!("hostgate proxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "hostgate proxy failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
