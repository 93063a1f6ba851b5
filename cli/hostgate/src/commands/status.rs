//! Status command.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use hostgate_proxy::discovery::DiscoveryHealth;
use hostgate_proxy::{ListenerStatus, ProxyStatus};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, print_single, OutputFormat};

use super::CommandContext;

/// Show the state of a running proxy.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Show skipped services and certificate details.
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct ListenerRow {
    #[tabled(rename = "Entry point")]
    entry_point: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Healthy")]
    healthy: bool,
    #[tabled(rename = "Active")]
    active: u64,
    #[tabled(rename = "Accepted")]
    accepted: u64,
    #[tabled(rename = "Rejected")]
    rejected: u64,
    #[tabled(rename = "Routed")]
    routed: u64,
    #[tabled(rename = "Unrouted")]
    unrouted: u64,
    #[tabled(rename = "Backend errors")]
    backend_failed: u64,
    #[tabled(rename = "Bytes in")]
    bytes_in: String,
    #[tabled(rename = "Bytes out")]
    bytes_out: String,
}

/// Compact byte count, e.g. `1.5 MiB`.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

impl From<&ListenerStatus> for ListenerRow {
    fn from(listener: &ListenerStatus) -> Self {
        Self {
            entry_point: listener.entry_point.to_string(),
            address: listener.address.to_string(),
            healthy: listener.healthy,
            active: listener.active_connections,
            accepted: listener.counters.accepted,
            rejected: listener.counters.rejected,
            routed: listener.counters.routes_matched,
            unrouted: listener.counters.routes_failed,
            backend_failed: listener.counters.backend_failed,
            bytes_in: format_bytes(listener.counters.bytes_to_backend),
            bytes_out: format_bytes(listener.counters.bytes_from_backend),
        }
    }
}

fn describe_health(health: &DiscoveryHealth) -> String {
    match health {
        DiscoveryHealth::Idle => "idle".dimmed().to_string(),
        DiscoveryHealth::Healthy => "healthy".green().to_string(),
        DiscoveryHealth::Degraded {
            consecutive_failures,
        } => format!("degraded ({consecutive_failures} failures)").yellow().to_string(),
        DiscoveryHealth::Ended => "ended".red().to_string(),
    }
}

impl StatusCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let status: ProxyStatus = client.get("/status").await?;

        if ctx.format == OutputFormat::Json {
            print_single(&status);
            return Ok(());
        }

        let running = if status.stopping {
            "stopping (draining connections)".yellow().bold()
        } else if status.running {
            "running".green().bold()
        } else {
            "stopped".red().bold()
        };
        println!("{} {}", "Proxy:".bold(), running);
        println!(
            "{} {} routes across {} services",
            "Routes:".bold(),
            status.route_count,
            status.service_count
        );

        let source = status.discovery.source.as_deref().unwrap_or("none");
        println!(
            "{} {} ({})",
            "Discovery:".bold(),
            source,
            describe_health(&status.discovery.health)
        );
        if let Some(error) = &status.discovery.last_error {
            println!("  {} {}", "last error:".dimmed(), error);
        }
        println!();

        let rows: Vec<ListenerRow> = status.listeners.iter().map(ListenerRow::from).collect();
        print_output(&rows, OutputFormat::Table);

        if self.verbose {
            if !status.certificates.is_empty() {
                println!();
                println!("{}", "Certificates:".bold());
                for cert in &status.certificates {
                    println!(
                        "  *.{}  expires {}",
                        cert.domain_suffix,
                        cert.not_after.format("%Y-%m-%d")
                    );
                }
            }
            if !status.discovery.skipped_services.is_empty() {
                println!();
                println!("{}", "Skipped services:".bold());
                for (service, reason) in &status.discovery.skipped_services {
                    println!("  {}: {}", service, reason.yellow());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostgate_proxy::{EntryPoint, ListenerCounters};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_listener_row_carries_counters() {
        let listener = ListenerStatus {
            entry_point: EntryPoint::Web,
            address: "127.0.0.1:8080".parse().unwrap(),
            healthy: true,
            active_connections: 2,
            counters: ListenerCounters {
                accepted: 10,
                rejected: 1,
                routes_matched: 7,
                routes_failed: 2,
                backend_failed: 3,
                bytes_to_backend: 2048,
                ..ListenerCounters::default()
            },
        };
        let row = ListenerRow::from(&listener);
        assert_eq!(row.entry_point, "web");
        assert_eq!(row.accepted, 10);
        assert_eq!(row.unrouted, 2);
        assert_eq!(row.backend_failed, 3);
        assert_eq!(row.bytes_in, "2.0 KiB");
    }

    #[test]
    fn test_listener_status_json_is_flat() {
        let json = serde_json::json!({
            "entry_point": "websecure",
            "address": "127.0.0.1:8443",
            "healthy": true,
            "active_connections": 0,
            "accepted": 4,
            "closed": 4,
            "rejected": 0,
            "routes_matched": 3,
            "routes_failed": 1,
            "backend_connected": 3,
            "backend_failed": 0,
            "bytes_to_backend": 100,
            "bytes_from_backend": 200
        });
        let listener: ListenerStatus = serde_json::from_value(json).unwrap();
        assert_eq!(listener.counters.routes_failed, 1);
        assert_eq!(listener.counters.bytes_from_backend, 200);
    }
}
