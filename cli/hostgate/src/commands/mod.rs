//! CLI commands.

mod cert;
mod routes;
mod start;
mod status;
mod stop;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::client::AdminClient;
use crate::error::CliError;
use crate::output::OutputFormat;

/// hostgate - local development proxy with hostname routing and HTTPS.
#[derive(Debug, Parser)]
#[command(name = "hostgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Admin API address of the proxy, or "off".
    #[arg(
        long,
        global = true,
        env = "HOSTGATE_ADMIN_ADDR",
        default_value = hostgate_proxy::config::DEFAULT_ADMIN_ADDR
    )]
    admin_addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the proxy in the foreground.
    Start(start::StartCommand),

    /// Stop a running proxy.
    Stop(stop::StopCommand),

    /// Show listener, discovery and certificate state.
    Status(status::StatusCommand),

    /// List the current route table.
    Routes(routes::RoutesCommand),

    /// Manage local certificates.
    Cert(cert::CertCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            format: OutputFormat::parse(&self.format),
            admin_addr: self.admin_addr,
        };

        match self.command {
            Commands::Start(cmd) => cmd.run(ctx).await,
            Commands::Stop(cmd) => cmd.run(ctx).await,
            Commands::Status(cmd) => cmd.run(ctx).await,
            Commands::Routes(cmd) => cmd.run(ctx).await,
            Commands::Cert(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("hostgate {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    admin_addr: String,
}

impl CommandContext {
    /// The admin address, or `None` when disabled.
    pub fn admin_addr(&self) -> Result<Option<SocketAddr>> {
        let value = self.admin_addr.trim();
        if matches!(value.to_ascii_lowercase().as_str(), "off" | "none" | "disabled") {
            return Ok(None);
        }
        let addr = value
            .parse()
            .with_context(|| format!("Invalid admin address '{value}'"))?;
        Ok(Some(addr))
    }

    /// Client for the running proxy's admin API.
    pub fn client(&self) -> Result<AdminClient> {
        match self.admin_addr()? {
            Some(addr) => AdminClient::new(addr),
            None => Err(CliError::AdminDisabled.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(admin_addr: &str) -> CommandContext {
        CommandContext {
            format: OutputFormat::Table,
            admin_addr: admin_addr.to_string(),
        }
    }

    #[test]
    fn test_admin_addr_off() {
        assert_eq!(context("off").admin_addr().unwrap(), None);
        assert!(context("OFF").client().is_err());
    }

    #[test]
    fn test_admin_addr_parse() {
        let addr = context("127.0.0.1:9000").admin_addr().unwrap();
        assert_eq!(addr, Some("127.0.0.1:9000".parse().unwrap()));
        assert!(context("nope").admin_addr().is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["hostgate", "--format", "json", "routes"]).unwrap();
        assert!(matches!(cli.command, Commands::Routes(_)));
        assert_eq!(cli.format, "json");

        assert!(Cli::try_parse_from(["hostgate", "bogus"]).is_err());
    }
}
