//! Cert commands: issue and inspect local certificates.
//!
//! These work on the certificate directory directly and do not need a
//! running proxy.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use hostgate_proxy::certs::{CertificateMetadata, CertificateStore, CA_CERT_FILE};
use hostgate_proxy::config::Config;
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_info, print_output, print_success, OutputFormat};

use super::CommandContext;

/// Cert command.
#[derive(Debug, Args)]
pub struct CertCommand {
    #[command(subcommand)]
    command: CertSubcommand,
}

#[derive(Debug, Subcommand)]
enum CertSubcommand {
    /// Issue or renew wildcard certificates (creates the local CA if needed).
    Ensure(CertArgs),

    /// Show stored certificates.
    Show(ShowArgs),
}

#[derive(Debug, Args)]
struct CertArgs {
    /// Domain suffix (repeatable). Defaults to HOSTGATE_DOMAINS.
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Certificate directory. Defaults to HOSTGATE_CERT_DIR.
    #[arg(long)]
    cert_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[command(flatten)]
    target: CertArgs,

    /// Print the CA certificate PEM instead of the table.
    #[arg(long)]
    ca_pem: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct CertRow {
    #[tabled(rename = "Domain")]
    domain: String,
    #[tabled(rename = "Issued")]
    issued_at: String,
    #[tabled(rename = "Expires")]
    not_after: String,
    #[tabled(rename = "Days left")]
    days_left: i64,
}

impl CertRow {
    fn new(meta: &CertificateMetadata, now: DateTime<Utc>) -> Self {
        Self {
            domain: format!("*.{}", meta.domain_suffix),
            issued_at: meta.issued_at.format("%Y-%m-%d").to_string(),
            not_after: meta.not_after.format("%Y-%m-%d").to_string(),
            days_left: (meta.not_after - now).num_days(),
        }
    }
}

/// Store and domain list from flags, falling back to the environment.
fn resolve(args: CertArgs) -> Result<(CertificateStore, Vec<String>)> {
    let config = Config::from_env().map_err(CliError::Config)?;
    let dir = args.cert_dir.unwrap_or(config.cert_dir);
    let domains = if args.domains.is_empty() {
        config.domains
    } else {
        args.domains
    };
    let store = CertificateStore::with_validity(dir, config.cert_validity, config.renew_before);
    Ok((store, domains))
}

fn ca_path(dir: &Path) -> PathBuf {
    dir.join(CA_CERT_FILE)
}

impl CertCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            CertSubcommand::Ensure(args) => ensure(args, ctx.format),
            CertSubcommand::Show(args) => show(args, ctx.format),
        }
    }
}

fn ensure(args: CertArgs, format: OutputFormat) -> Result<()> {
    let (store, domains) = resolve(args)?;

    let now = Utc::now();
    let mut rows = Vec::with_capacity(domains.len());
    for domain in &domains {
        let cert = store
            .ensure_certificate(domain)
            .map_err(|e| CliError::Control(e.into()))?;
        if let Some(meta) = store
            .metadata(&cert.domain_suffix)
            .map_err(|e| CliError::Control(e.into()))?
        {
            rows.push(CertRow::new(&meta, now));
        }
    }

    print_output(&rows, format);
    if format == OutputFormat::Table {
        print_success(&format!("{} certificate(s) ready", rows.len()));
        print_info(&format!(
            "Trust {} in your browser or OS to avoid warnings",
            ca_path(store.dir()).display()
        ));
    }
    Ok(())
}

fn show(args: ShowArgs, format: OutputFormat) -> Result<()> {
    let ca_pem = args.ca_pem;
    let (store, domains) = resolve(args.target)?;
    let ca = ca_path(store.dir());

    if ca_pem {
        if !ca.exists() {
            return Err(anyhow::anyhow!(
                "no local CA in {} (run `hostgate cert ensure`)",
                store.dir().display()
            ));
        }
        print!("{}", std::fs::read_to_string(&ca)?);
        return Ok(());
    }

    let now = Utc::now();
    let mut rows = Vec::new();
    for domain in &domains {
        match store.metadata(domain) {
            Ok(Some(meta)) => rows.push(CertRow::new(&meta, now)),
            Ok(None) => {}
            Err(e) => return Err(CliError::Control(e.into()).into()),
        }
    }

    print_output(&rows, format);
    if format == OutputFormat::Table {
        println!();
        print_info(&format!("Certificate directory: {}", store.dir().display()));
    }
    Ok(())
}
