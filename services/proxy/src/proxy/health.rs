//! Backend health tracking.
//!
//! Failures are counted per target address, from both forwarding attempts
//! and the background prober. A service whose target reaches the failure
//! threshold is deregistered; it comes back only when discovery registers
//! it again.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::registry::SharedRouteTable;

/// Default consecutive failures before a service is deregistered.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

#[derive(Debug)]
pub struct HealthTracker {
    failures: Mutex<HashMap<SocketAddr, u32>>,
    max_failures: u32,
}

impl HealthTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            max_failures: max_failures.max(1),
        }
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn record_success(&self, target: SocketAddr) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if failures.remove(&target).is_some() {
            debug!(target = %target, "Backend healthy again");
        }
    }

    /// Count a failure. Returns true once the threshold is reached.
    pub fn record_failure(&self, target: SocketAddr) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(target).or_insert(0);
        *count += 1;
        *count >= self.max_failures
    }

    pub fn failures(&self, target: SocketAddr) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.get(&target).copied().unwrap_or(0)
    }

    pub fn forget(&self, target: SocketAddr) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.remove(&target);
    }

    /// Drop counters for targets no longer routed to.
    fn retain(&self, live: &HashSet<SocketAddr>) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.retain(|target, _| live.contains(target));
    }
}

/// Probe one round of targets. Returns the services deregistered.
pub async fn probe_once(
    routes: &SharedRouteTable,
    tracker: &HealthTracker,
    connect_timeout: Duration,
) -> Vec<String> {
    let targets = routes.targets();
    let live: HashSet<SocketAddr> = targets.iter().map(|(_, addr)| *addr).collect();
    tracker.retain(&live);

    let mut unhealthy: Vec<(String, SocketAddr)> = Vec::new();
    let mut probed: HashMap<SocketAddr, bool> = HashMap::new();

    for (service_id, target) in targets {
        let healthy = match probed.get(&target) {
            Some(healthy) => *healthy,
            None => {
                let healthy = matches!(
                    tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await,
                    Ok(Ok(_))
                );
                let exhausted = if healthy {
                    tracker.record_success(target);
                    false
                } else {
                    tracker.record_failure(target)
                };
                probed.insert(target, !exhausted);
                if !healthy {
                    debug!(
                        service_id = %service_id,
                        target = %target,
                        failures = tracker.failures(target),
                        "Health probe failed"
                    );
                }
                !exhausted
            }
        };
        if !healthy {
            unhealthy.push((service_id, target));
        }
    }

    let mut removed = Vec::new();
    for (service_id, target) in unhealthy {
        tracker.forget(target);
        // Discovery may have moved the service while the probes ran.
        if routes.deregister_target(&service_id, target) == 0 {
            continue;
        }
        warn!(
            service_id = %service_id,
            target = %target,
            max_failures = tracker.max_failures(),
            "Backend failed health checks; service deregistered"
        );
        if !removed.contains(&service_id) {
            removed.push(service_id);
        }
    }
    removed
}

/// Probe every routed target on `interval` until shutdown.
pub async fn run_health_prober(
    routes: SharedRouteTable,
    tracker: Arc<HealthTracker>,
    interval: Duration,
    connect_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_ms = interval.as_millis() as u64,
        max_failures = tracker.max_failures(),
        "Health prober started"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                probe_once(&routes, &tracker, connect_timeout).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Health prober stopping");
                    return;
                }
            }
        }
    }
}
