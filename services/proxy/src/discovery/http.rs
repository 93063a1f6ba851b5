//! Registry events feed source.
//!
//! Tails an append-only events endpoint:
//!
//! ```text
//! GET {url}?after_event_id={cursor}&limit={limit}
//! -> { "items": [ { "event_id": 7, "event_type": "service.registered", "payload": {...} } ],
//!      "next_after_event_id": 7 }
//! ```
//!
//! `service.registered` carries a [`ServiceDescriptor`]; `service.deregistered`
//! carries `{ "service_id": "..." }`. Other event types are skipped.
//!
//! The last applied event id can be persisted to a state file together with
//! the services it describes. A restarted source first replays the stored
//! services, then resumes the feed after the stored cursor.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{backoff_delay, DiscoveryEvent, DiscoverySource, ServiceDescriptor};

/// Events feed settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    /// Full URL of the events endpoint.
    pub url: String,
    /// Delay between polls once caught up.
    pub poll_interval: Duration,
    /// Max events per request.
    pub fetch_limit: i64,
    /// Optional file persisting the last applied event id and the live services.
    pub state_file: Option<PathBuf>,
    /// Optional bearer token.
    pub token: Option<String>,
}

impl HttpSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            poll_interval: Duration::from_secs(1),
            fetch_limit: 200,
            state_file: None,
            token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    items: Vec<EventItem>,
    next_after_event_id: i64,
}

#[derive(Debug, Deserialize)]
struct EventItem {
    event_id: i64,
    event_type: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DeregisteredPayload {
    service_id: String,
}

/// Discovery source that tails a registry events feed over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    config: HttpSourceConfig,
    client: reqwest::Client,
}

impl HttpEventSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let raw = token.trim();
            let bearer = if raw.starts_with("Bearer ") || raw.starts_with("bearer ") {
                raw.to_string()
            } else {
                format!("Bearer {raw}")
            };
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer).context("Invalid discovery token format")?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("hostgate/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { config, client })
    }
}

/// State file format version.
const STATE_VERSION: u32 = 1;

/// Feed position plus the services registered up to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FeedSnapshot {
    version: u32,
    cursor: i64,
    services: BTreeMap<String, ServiceDescriptor>,
}

impl Default for FeedSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cursor: 0,
            services: BTreeMap::new(),
        }
    }
}

fn load_snapshot(path: &Path) -> Result<FeedSnapshot> {
    if !path.exists() {
        debug!(path = %path.display(), "No discovery state file, starting fresh");
        return Ok(FeedSnapshot::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let snapshot: FeedSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse state file {}", path.display()))?;

    if snapshot.version != STATE_VERSION {
        warn!(
            file_version = snapshot.version,
            current_version = STATE_VERSION,
            "Discovery state version mismatch, starting fresh"
        );
        return Ok(FeedSnapshot::default());
    }

    info!(
        path = %path.display(),
        cursor = snapshot.cursor,
        service_count = snapshot.services.len(),
        "Loaded discovery state"
    );
    Ok(snapshot)
}

/// Write-to-temp then rename, so readers never see a partial file.
fn save_snapshot(path: &Path, snapshot: &FeedSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    let content =
        serde_json::to_string_pretty(snapshot).context("Failed to serialize discovery state")?;
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move state file into place ({})", path.display()))?;

    Ok(())
}

async fn fetch_events(
    client: &reqwest::Client,
    url: &str,
    after_event_id: i64,
    limit: i64,
) -> Result<EventsResponse> {
    let resp = client
        .get(url)
        .query(&[("after_event_id", after_event_id), ("limit", limit)])
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!(
            "events query failed (status={}): {}",
            status,
            body
        ));
    }

    Ok(resp.json::<EventsResponse>().await?)
}

/// Translate one feed item. `Ok(None)` means the item is not a service event.
fn translate_event(item: EventItem) -> Result<Option<DiscoveryEvent>> {
    let event = match item.event_type.as_str() {
        "service.registered" => {
            let payload = item.payload.context("service.registered missing payload")?;
            let service: ServiceDescriptor = serde_json::from_value(payload)
                .context("invalid service.registered payload JSON")?;
            DiscoveryEvent::Registered(service)
        }
        "service.deregistered" => {
            let payload = item
                .payload
                .context("service.deregistered missing payload")?;
            let payload: DeregisteredPayload = serde_json::from_value(payload)
                .context("invalid service.deregistered payload JSON")?;
            DiscoveryEvent::Deregistered {
                service_id: payload.service_id,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

struct FeedState {
    config: HttpSourceConfig,
    client: reqwest::Client,
    /// `None` until the state file has been loaded.
    snapshot: Option<FeedSnapshot>,
    pending: VecDeque<DiscoveryEvent>,
    consecutive_failures: u32,
    caught_up: bool,
}

impl FeedState {
    /// Current cursor. The first call loads the state file and queues a
    /// `Registered` event for every stored service.
    fn cursor(&mut self) -> i64 {
        if let Some(snapshot) = &self.snapshot {
            return snapshot.cursor;
        }
        let snapshot = match &self.config.state_file {
            Some(path) => load_snapshot(path).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring unreadable discovery state; starting from the beginning");
                FeedSnapshot::default()
            }),
            None => FeedSnapshot::default(),
        };
        self.pending.extend(
            snapshot
                .services
                .values()
                .cloned()
                .map(DiscoveryEvent::Registered),
        );
        let cursor = snapshot.cursor;
        self.snapshot = Some(snapshot);
        cursor
    }

    fn apply(&mut self, event: &DiscoveryEvent) {
        let Some(snapshot) = self.snapshot.as_mut() else {
            return;
        };
        match event {
            DiscoveryEvent::Registered(service) => {
                snapshot
                    .services
                    .insert(service.service_id.clone(), service.clone());
            }
            DiscoveryEvent::Deregistered { service_id } => {
                snapshot.services.remove(service_id);
            }
            DiscoveryEvent::Degraded { .. } | DiscoveryEvent::Recovered => {}
        }
    }

    async fn poll(&mut self) {
        if self.consecutive_failures > 0 {
            tokio::time::sleep(backoff_delay(
                self.config.poll_interval,
                self.consecutive_failures,
            ))
            .await;
        } else if self.caught_up {
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let cursor = self.cursor();
        let resp = match fetch_events(
            &self.client,
            &self.config.url,
            cursor,
            self.config.fetch_limit,
        )
        .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %e,
                    cursor,
                    consecutive_failures = self.consecutive_failures,
                    "Failed to fetch discovery events; retrying"
                );
                self.pending.push_back(DiscoveryEvent::Degraded {
                    reason: format!("{e:#}"),
                    consecutive_failures: self.consecutive_failures,
                });
                return;
            }
        };

        if self.consecutive_failures > 0 {
            self.consecutive_failures = 0;
            self.pending.push_back(DiscoveryEvent::Recovered);
        }

        self.caught_up = resp.items.is_empty();
        let mut next_cursor = cursor;
        for item in resp.items {
            next_cursor = item.event_id;
            let event_id = item.event_id;
            let event_type = item.event_type.clone();
            match translate_event(item) {
                Ok(Some(event)) => {
                    self.apply(&event);
                    self.pending.push_back(event);
                }
                Ok(None) => {}
                Err(e) => warn!(event_id, event_type = %event_type, error = %e, "Skipping malformed discovery event"),
            }
        }
        next_cursor = resp.next_after_event_id.max(next_cursor);

        if next_cursor == cursor {
            return;
        }
        debug!(cursor = next_cursor, "Discovery cursor advanced");
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.cursor = next_cursor;
            if let Some(path) = &self.config.state_file {
                if let Err(e) = save_snapshot(path, snapshot) {
                    warn!(error = %e, "Failed to persist discovery state");
                }
            }
        }
    }
}

impl DiscoverySource for HttpEventSource {
    fn name(&self) -> &str {
        "http"
    }

    fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent> {
        let state = FeedState {
            config: self.config.clone(),
            client: self.client.clone(),
            snapshot: None,
            pending: VecDeque::new(),
            consecutive_failures: 0,
            caught_up: false,
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
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use axum::{extract::Query, routing::get, Json, Router};
    use tempfile::tempdir;

    use super::*;

    fn feed_page(last_event_id: i64, after: i64) -> serde_json::Value {
        let all = vec![
            serde_json::json!({
                "event_id": 1,
                "event_type": "service.registered",
                "payload": { "service_id": "web", "address": "127.0.0.1", "labels": {} }
            }),
            serde_json::json!({ "event_id": 2, "event_type": "build.finished" }),
            serde_json::json!({
                "event_id": 3,
                "event_type": "service.deregistered",
                "payload": { "service_id": "web" }
            }),
        ];
        let items: Vec<_> = all
            .into_iter()
            .filter(|item| {
                let id = item["event_id"].as_i64().unwrap_or(0);
                id > after && id <= last_event_id
            })
            .collect();
        let next = items
            .last()
            .and_then(|item| item["event_id"].as_i64())
            .unwrap_or(after);
        serde_json::json!({ "items": items, "next_after_event_id": next })
    }

    /// Serves events 1..=`last_event_id` of a fixed feed.
    async fn serve_feed(last_event_id: i64) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/events",
            get(move |Query(params): Query<HashMap<String, i64>>| async move {
                let after = params.get("after_event_id").copied().unwrap_or(0);
                Json(feed_page(last_event_id, after))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("discovery.json");
        assert_eq!(load_snapshot(&path).unwrap(), FeedSnapshot::default());

        let mut snapshot = FeedSnapshot {
            cursor: 42,
            ..FeedSnapshot::default()
        };
        snapshot.services.insert(
            "web".to_string(),
            ServiceDescriptor {
                service_id: "web".to_string(),
                address: "127.0.0.1".to_string(),
                labels: BTreeMap::new(),
            },
        );
        save_snapshot(&path, &snapshot).unwrap();
        assert_eq!(load_snapshot(&path).unwrap(), snapshot);

        fs::write(&path, "not-json").unwrap();
        assert!(load_snapshot(&path).is_err());
    }

    #[test]
    fn test_snapshot_version_mismatch_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("discovery.json");
        fs::write(&path, r#"{"version":99,"cursor":7,"services":{}}"#).unwrap();
        assert_eq!(load_snapshot(&path).unwrap(), FeedSnapshot::default());
    }

    #[test]
    fn test_translate_event_skips_unrelated_types() {
        let item = EventItem {
            event_id: 9,
            event_type: "route.created".to_string(),
            payload: None,
        };
        assert!(translate_event(item).unwrap().is_none());

        let item = EventItem {
            event_id: 10,
            event_type: "service.registered".to_string(),
            payload: None,
        };
        assert!(translate_event(item).is_err());
    }

    #[tokio::test]
    async fn test_feed_emits_service_events_and_persists_state() {
        let addr = serve_feed(3).await;
        let dir = tempdir().unwrap();
        let state_file = dir.path().join("discovery.json");

        let mut config = HttpSourceConfig::new(format!("http://{addr}/events"));
        config.poll_interval = Duration::from_millis(20);
        config.state_file = Some(state_file.clone());

        let source = HttpEventSource::new(config).unwrap();
        let mut events = source.subscribe();

        match events.next().await {
            Some(DiscoveryEvent::Registered(service)) => assert_eq!(service.service_id, "web"),
            other => panic!("Expected Registered, got {:?}", other),
        }
        assert_eq!(
            events.next().await,
            Some(DiscoveryEvent::Deregistered {
                service_id: "web".to_string()
            })
        );
        let snapshot = load_snapshot(&state_file).unwrap();
        assert_eq!(snapshot.cursor, 3);
        assert!(snapshot.services.is_empty());
    }

    #[tokio::test]
    async fn test_restart_replays_services_registered_before_cursor() {
        // Feed stops after the registration, so "web" is still live.
        let addr = serve_feed(1).await;
        let dir = tempdir().unwrap();
        let state_file = dir.path().join("discovery.json");

        let mut config = HttpSourceConfig::new(format!("http://{addr}/events"));
        config.poll_interval = Duration::from_millis(20);
        config.state_file = Some(state_file.clone());

        let first = HttpEventSource::new(config.clone()).unwrap();
        let mut events = first.subscribe();
        match events.next().await {
            Some(DiscoveryEvent::Registered(service)) => assert_eq!(service.service_id, "web"),
            other => panic!("Expected Registered, got {:?}", other),
        }
        drop(events);
        assert_eq!(load_snapshot(&state_file).unwrap().cursor, 1);

        let second = HttpEventSource::new(config).unwrap();
        let mut events = second.subscribe();
        let replayed = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .unwrap();
        match replayed {
            Some(DiscoveryEvent::Registered(service)) => assert_eq!(service.service_id, "web"),
            other => panic!("Expected replayed Registered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_feed_degrades() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = HttpSourceConfig::new(format!("http://{addr}/events"));
        config.poll_interval = Duration::from_millis(10);
        let source = HttpEventSource::new(config).unwrap();
        let mut events = source.subscribe();

        match events.next().await {
            Some(DiscoveryEvent::Degraded {
                consecutive_failures,
                ..
            }) => assert_eq!(consecutive_failures, 1),
            other => panic!("Expected Degraded, got {:?}", other),
        }
    }
}
