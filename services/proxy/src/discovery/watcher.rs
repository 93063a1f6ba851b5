//! Applies discovery events to the route table.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use super::{parse_service, DiscoveryEvent, LabelConfig, ServiceDescriptor};
use crate::proxy::SharedRouteTable;

/// Health of the discovery stream as seen by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiscoveryHealth {
    /// No stream attached, or nothing received yet.
    Idle,
    Healthy,
    /// The source is retrying; routes stay as last applied.
    Degraded { consecutive_failures: u32 },
    /// The stream finished.
    Ended,
}

/// Point-in-time view of the discovery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Name of the attached source, if any.
    pub source: Option<String>,
    pub health: DiscoveryHealth,
    pub last_error: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
    /// Services whose labels were rejected, with the reason.
    pub skipped_services: BTreeMap<String, String>,
}

impl Default for DiscoveryReport {
    fn default() -> Self {
        Self {
            source: None,
            health: DiscoveryHealth::Idle,
            last_error: None,
            last_event_at: None,
            skipped_services: BTreeMap::new(),
        }
    }
}

/// Shared, lock-free discovery status.
#[derive(Debug, Default)]
pub struct DiscoveryStatus {
    report: ArcSwap<DiscoveryReport>,
}

impl DiscoveryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> DiscoveryReport {
        self.report.load().as_ref().clone()
    }

    fn update(&self, f: impl Fn(&mut DiscoveryReport)) {
        self.report.rcu(|current| {
            let mut next = current.as_ref().clone();
            f(&mut next);
            next
        });
    }
}

/// Consumes one discovery stream and keeps the route table in sync.
pub struct Watcher {
    routes: SharedRouteTable,
    labels: LabelConfig,
    status: Arc<DiscoveryStatus>,
}

impl Watcher {
    pub fn new(routes: SharedRouteTable, labels: LabelConfig, status: Arc<DiscoveryStatus>) -> Self {
        Self {
            routes,
            labels,
            status,
        }
    }

    /// Apply a single event.
    pub fn apply(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Registered(service) => self.register(&service),
            DiscoveryEvent::Deregistered { service_id } => {
                self.routes.deregister(&service_id);
                self.status.update(|report| {
                    report.skipped_services.remove(&service_id);
                    report.last_event_at = Some(Utc::now());
                });
            }
            DiscoveryEvent::Degraded {
                reason,
                consecutive_failures,
            } => {
                self.status.update(|report| {
                    report.health = DiscoveryHealth::Degraded {
                        consecutive_failures,
                    };
                    report.last_error = Some(reason.clone());
                });
            }
            DiscoveryEvent::Recovered => {
                info!("Discovery source recovered");
                self.status.update(|report| {
                    report.health = DiscoveryHealth::Healthy;
                });
            }
        }
    }

    fn register(&self, service: &ServiceDescriptor) {
        let service_id = service.service_id.as_str();
        let skipped = match parse_service(service, &self.labels) {
            Ok(routes) if routes.is_empty() => {
                self.routes.deregister(service_id);
                None
            }
            Ok(routes) => {
                self.routes.register_service(service_id, routes);
                None
            }
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Skipping service with invalid labels");
                self.routes.deregister(service_id);
                Some(e.to_string())
            }
        };

        self.status.update(|report| {
            if !matches!(report.health, DiscoveryHealth::Degraded { .. }) {
                report.health = DiscoveryHealth::Healthy;
            }
            report.last_event_at = Some(Utc::now());
            match &skipped {
                Some(reason) => {
                    report
                        .skipped_services
                        .insert(service_id.to_string(), reason.clone());
                }
                None => {
                    report.skipped_services.remove(service_id);
                }
            }
        });
    }

    /// Consume `events` until the stream ends or shutdown is signalled.
    pub async fn run(
        self,
        source: String,
        mut events: BoxStream<'static, DiscoveryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.status.update(|report| report.source = Some(source.clone()));
        info!(source = %source, "Discovery watcher started");

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(event) => self.apply(event),
                        None => {
                            warn!(source = %source, "Discovery stream ended; keeping current routes");
                            self.status.update(|report| report.health = DiscoveryHealth::Ended);
                            return;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(source = %source, "Discovery watcher stopping");
                        return;
                    }
                }
            }
        }
    }
}
