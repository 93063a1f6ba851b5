//! Stop command.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use hostgate_proxy::admin::ShutdownResponse;

use crate::error::CliError;
use crate::output::{print_info, print_success, print_warning};

use super::CommandContext;

/// Stop a running proxy through its admin API.
#[derive(Debug, Args)]
pub struct StopCommand {
    /// Seconds to wait for the proxy to exit.
    #[arg(long, default_value = "15")]
    timeout: u64,
}

impl StopCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;

        let response: ShutdownResponse = client.post("/shutdown").await?;
        if !response.accepted {
            return Err(CliError::NotRunning(client.base_url().to_string()).into());
        }
        print_info("Shutdown requested; draining connections");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.timeout);
        while tokio::time::Instant::now() < deadline {
            if !client.is_up().await {
                print_success("hostgate stopped");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        print_warning("hostgate is still shutting down");
        Ok(())
    }
}
