//! Service manifest file source.
//!
//! Polls a JSON manifest and emits the difference from the previous poll:
//!
//! ```json
//! { "services": [ { "service_id": "web", "address": "127.0.0.1", "labels": { ... } } ] }
//! ```
//!
//! A missing or unreadable file is treated as a transient registry outage:
//! routes already applied stay in place and the source retries with backoff.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{backoff_delay, DiscoveryEvent, DiscoverySource, ServiceDescriptor};

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    services: Vec<ServiceDescriptor>,
}

/// Discovery source backed by a manifest file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }
}

struct PollState {
    path: PathBuf,
    poll_interval: Duration,
    known: BTreeMap<String, ServiceDescriptor>,
    pending: VecDeque<DiscoveryEvent>,
    consecutive_failures: u32,
    first_poll: bool,
}

impl PollState {
    async fn poll(&mut self) {
        if !self.first_poll {
            let delay = if self.consecutive_failures > 0 {
                backoff_delay(self.poll_interval, self.consecutive_failures)
            } else {
                self.poll_interval
            };
            tokio::time::sleep(delay).await;
        }
        self.first_poll = false;

        match read_manifest(&self.path).await {
            Ok(services) => {
                if self.consecutive_failures > 0 {
                    self.consecutive_failures = 0;
                    self.pending.push_back(DiscoveryEvent::Recovered);
                }
                self.diff(services);
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Failed to read service manifest; retrying"
                );
                self.pending.push_back(DiscoveryEvent::Degraded {
                    reason: format!("{e:#}"),
                    consecutive_failures: self.consecutive_failures,
                });
            }
        }
    }

    fn diff(&mut self, services: Vec<ServiceDescriptor>) {
        let mut next = BTreeMap::new();
        for service in services {
            next.insert(service.service_id.clone(), service);
        }

        for service_id in self.known.keys() {
            if !next.contains_key(service_id) {
                self.pending.push_back(DiscoveryEvent::Deregistered {
                    service_id: service_id.clone(),
                });
            }
        }

        for (service_id, service) in &next {
            if self.known.get(service_id) != Some(service) {
                self.pending
                    .push_back(DiscoveryEvent::Registered(service.clone()));
            }
        }

        if !self.pending.is_empty() {
            debug!(
                path = %self.path.display(),
                changes = self.pending.len(),
                "Service manifest changed"
            );
        }
        self.known = next;
    }
}

async fn read_manifest(path: &Path) -> Result<Vec<ServiceDescriptor>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let manifest: Manifest = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(manifest.services)
}

impl DiscoverySource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent> {
        let state = PollState {
            path: self.path.clone(),
            poll_interval: self.poll_interval,
            known: BTreeMap::new(),
            pending: VecDeque::new(),
            consecutive_failures: 0,
            first_poll: true,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                state.poll().await;
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(services: &[(&str, &str)]) -> String {
        let services: Vec<serde_json::Value> = services
            .iter()
            .map(|(id, host)| {
                serde_json::json!({
                    "service_id": id,
                    "address": "127.0.0.1",
                    "labels": {
                        "traefik.http.routers.app.rule": format!("Host(`{host}`)"),
                        "traefik.http.services.app.loadbalancer.server.port": "3000",
                    }
                })
            })
            .collect();
        serde_json::json!({ "services": services }).to_string()
    }

    #[tokio::test]
    async fn test_file_source_emits_diffs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(&path, manifest(&[("a", "a.localhost"), ("b", "b.localhost")])).unwrap();

        let source = FileSource::new(&path, Duration::from_millis(20));
        let mut events = source.subscribe();

        let mut registered = Vec::new();
        for _ in 0..2 {
            match events.next().await {
                Some(DiscoveryEvent::Registered(service)) => registered.push(service.service_id),
                other => panic!("Expected Registered, got {:?}", other),
            }
        }
        assert_eq!(registered, vec!["a", "b"]);

        std::fs::write(&path, manifest(&[("b", "b2.localhost")])).unwrap();

        assert_eq!(
            events.next().await,
            Some(DiscoveryEvent::Deregistered {
                service_id: "a".to_string()
            })
        );
        match events.next().await {
            Some(DiscoveryEvent::Registered(service)) => {
                assert_eq!(service.service_id, "b");
                assert!(service.labels.values().any(|v| v.contains("b2.localhost")));
            }
            other => panic!("Expected Registered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_degrades_then_recovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("services.json");

        let source = FileSource::new(&path, Duration::from_millis(10));
        let mut events = source.subscribe();

        match events.next().await {
            Some(DiscoveryEvent::Degraded {
                consecutive_failures,
                ..
            }) => assert_eq!(consecutive_failures, 1),
            other => panic!("Expected Degraded, got {:?}", other),
        }

        std::fs::write(&path, manifest(&[("a", "a.localhost")])).unwrap();

        loop {
            match events.next().await {
                Some(DiscoveryEvent::Degraded { .. }) => continue,
                Some(DiscoveryEvent::Recovered) => break,
                other => panic!("Expected Recovered, got {:?}", other),
            }
        }
        assert!(matches!(
            events.next().await,
            Some(DiscoveryEvent::Registered(_))
        ));
    }
}
