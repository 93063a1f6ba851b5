//! Error handling and display for the CLI.

use colored::Colorize;
use hostgate_proxy::ControlError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("hostgate is not running (admin API at {0} is unreachable)")]
    NotRunning(String),

    #[error("hostgate is already running (admin API at {0} answered)")]
    AlreadyRunning(String),

    #[error("the admin API is disabled (HOSTGATE_ADMIN_ADDR=off)")]
    AdminDisabled,

    #[error("Admin API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Control(e) => e.exit_code() as u8,
            Self::Config(_) => 2,
            Self::NotRunning(_)
            | Self::AlreadyRunning(_)
            | Self::AdminDisabled
            | Self::Api { .. }
            | Self::Network(_)
            | Self::Other(_) => 1,
        }
    }
}

/// Exit code for any command failure.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(cli_err) => cli_err.exit_code(),
        None => match err.downcast_ref::<ControlError>() {
            Some(control) => control.exit_code() as u8,
            None => 1,
        },
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NotRunning(_) => {
                eprintln!("\n{}", "Hint: Start the proxy with `hostgate start`.".yellow());
            }
            CliError::AlreadyRunning(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Stop the running instance with `hostgate stop`, or pick another --admin-addr."
                        .yellow()
                );
            }
            CliError::Control(ControlError::Cert(_)) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check that the certificate directory is writable, or use --no-tls.".yellow()
                );
            }
            CliError::Control(ControlError::Proxy(_)) | CliError::Control(ControlError::Admin { .. }) => {
                eprintln!(
                    "\n{}",
                    "Hint: Another process may be using the port. Use --web-addr or --websecure-addr."
                        .yellow()
                );
            }
            _ => {}
        }
    }
}
