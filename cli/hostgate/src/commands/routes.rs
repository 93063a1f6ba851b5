//! Routes command.

use anyhow::Result;
use clap::Args;
use hostgate_proxy::admin::RouteView;
use serde::Serialize;
use tabled::Tabled;

use crate::output::print_output;

use super::CommandContext;

/// List the current route table.
#[derive(Debug, Args)]
pub struct RoutesCommand {
    /// Only show routes for this service.
    #[arg(long)]
    service: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct RouteRow {
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Entry point")]
    entry_point: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Service")]
    service_id: String,
    #[tabled(rename = "Router")]
    router: String,
    #[tabled(rename = "TLS")]
    tls: bool,
}

impl From<RouteView> for RouteRow {
    fn from(route: RouteView) -> Self {
        Self {
            host: route.host,
            entry_point: route.entry_point.to_string(),
            target: route.target,
            service_id: route.service_id,
            router: route.router,
            tls: route.tls,
        }
    }
}

impl RoutesCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let routes: Vec<RouteView> = client.get("/routes").await?;

        let rows: Vec<RouteRow> = routes
            .into_iter()
            .filter(|route| {
                self.service
                    .as_deref()
                    .is_none_or(|service| route.service_id == service)
            })
            .map(RouteRow::from)
            .collect();

        print_output(&rows, ctx.format);
        Ok(())
    }
}
