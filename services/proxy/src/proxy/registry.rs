//! Route registry and hostname resolution.
//!
//! Routes map a host pattern on an entry point to a backend target:
//! - Exact hostnames are looked up directly
//! - Wildcard patterns (`*.suffix`) match exactly one extra DNS label
//! - Exact matches win over wildcards; among wildcards the longest suffix wins
//! - Hostnames normalized to lowercase, port stripped, trailing dot trimmed
//! - A `(host pattern, entry point)` pair is owned by at most one route;
//!   a newer registration replaces the older one and is logged as a conflict
//!
//! Writers are serialized and publish a fresh snapshot with a single pointer
//! swap, so `resolve` never blocks and never observes a half-applied update.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A named listening address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryPoint {
    /// Plaintext HTTP.
    #[serde(rename = "web")]
    Web,
    /// TLS-terminating HTTPS.
    #[serde(rename = "websecure")]
    WebSecure,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 2] = [EntryPoint::Web, EntryPoint::WebSecure];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Web => "web",
            EntryPoint::WebSecure => "websecure",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(EntryPoint::Web),
            "websecure" => Ok(EntryPoint::WebSecure),
            other => Err(other.to_string()),
        }
    }
}

/// Normalize a hostname for matching.
///
/// - Strip a `:port` suffix (IPv6 literals in brackets are kept intact)
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    let trimmed = hostname.trim();
    let without_port = if let Some(rest) = trimmed.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &trimmed[..end + 2],
            None => trimmed,
        }
    } else {
        match trimmed.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
                host
            }
            _ => trimmed,
        }
    };
    without_port.to_lowercase().trim_end_matches('.').to_string()
}

/// True if `label` is a single DNS label of `[a-zA-Z0-9-]+`.
pub fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// True if `host` is a dot-separated sequence of DNS labels.
pub fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty() && host.len() <= 253 && host.split('.').all(is_dns_label)
}

/// Hostname pattern a route answers for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostPattern {
    /// A literal hostname.
    Exact(String),
    /// Any single label followed by `.suffix`.
    Wildcard { suffix: String },
}

impl HostPattern {
    pub fn exact(hostname: &str) -> Self {
        HostPattern::Exact(normalize_hostname(hostname))
    }

    pub fn wildcard(suffix: &str) -> Self {
        HostPattern::Wildcard {
            suffix: normalize_hostname(suffix),
        }
    }

    /// Check whether a normalized hostname matches this pattern.
    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            HostPattern::Exact(host) => host == hostname,
            HostPattern::Wildcard { suffix } => wildcard_matches(suffix, hostname),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, HostPattern::Wildcard { .. })
    }
}

fn wildcard_matches(suffix: &str, hostname: &str) -> bool {
    let Some(prefix) = hostname.strip_suffix(suffix) else {
        return false;
    };
    let Some(label) = prefix.strip_suffix('.') else {
        return false;
    };
    is_dns_label(label)
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Exact(host) => f.write_str(host),
            HostPattern::Wildcard { suffix } => write!(f, "*.{suffix}"),
        }
    }
}

impl FromStr for HostPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pattern, host) = match s.strip_prefix("*.") {
            Some(suffix) => (HostPattern::wildcard(suffix), suffix),
            None => (HostPattern::exact(s), s),
        };
        if !is_valid_hostname(&normalize_hostname(host)) {
            return Err(format!("invalid host pattern '{s}'"));
        }
        Ok(pattern)
    }
}

impl Serialize for HostPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Service that registered this route.
    pub service_id: String,
    /// Router name from the service's labels.
    pub router: String,
    pub host: HostPattern,
    pub target: SocketAddr,
    pub entry_point: EntryPoint,
    pub tls_enabled: bool,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            entry_point: self.entry_point,
            host: self.host.clone(),
        }
    }
}

/// Uniqueness key of a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub entry_point: EntryPoint,
    pub host: HostPattern,
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.host, self.entry_point)
    }
}

/// A registration displaced a route owned by another service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("route {key} was registered by service '{previous}', now owned by '{current}'")]
pub struct RegistryConflict {
    pub key: RouteKey,
    pub previous: String,
    pub current: String,
}

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug, Default)]
struct RouteSnapshot {
    /// Canonical route set.
    by_key: BTreeMap<RouteKey, Route>,
    /// Exact hostnames per entry point.
    exact: HashMap<EntryPoint, HashMap<String, Route>>,
    /// Wildcards per entry point, longest suffix first.
    wildcards: HashMap<EntryPoint, Vec<Route>>,
}

impl RouteSnapshot {
    fn from_routes(by_key: BTreeMap<RouteKey, Route>) -> Self {
        let mut exact: HashMap<EntryPoint, HashMap<String, Route>> = HashMap::new();
        let mut wildcards: HashMap<EntryPoint, Vec<Route>> = HashMap::new();

        for route in by_key.values() {
            match &route.host {
                HostPattern::Exact(host) => {
                    exact
                        .entry(route.entry_point)
                        .or_default()
                        .insert(host.clone(), route.clone());
                }
                HostPattern::Wildcard { .. } => {
                    wildcards
                        .entry(route.entry_point)
                        .or_default()
                        .push(route.clone());
                }
            }
        }

        for routes in wildcards.values_mut() {
            routes.sort_by(|a, b| {
                let len = |r: &Route| match &r.host {
                    HostPattern::Wildcard { suffix } => suffix.len(),
                    HostPattern::Exact(_) => 0,
                };
                len(b).cmp(&len(a))
            });
        }

        Self {
            by_key,
            exact,
            wildcards,
        }
    }

    fn resolve(&self, hostname: &str, entry_point: EntryPoint) -> Option<&Route> {
        if let Some(route) = self
            .exact
            .get(&entry_point)
            .and_then(|hosts| hosts.get(hostname))
        {
            return Some(route);
        }

        self.wildcards
            .get(&entry_point)?
            .iter()
            .find(|route| route.host.matches(hostname))
    }
}

/// Route table managing all active routes.
///
/// Uses ArcSwap for lock-free atomic updates.
/// Readers get consistent snapshots without blocking.
/// Writers are serialized and atomically swap in new snapshots.
pub struct RouteTable {
    /// Atomically swappable route snapshot.
    snapshot: ArcSwap<RouteSnapshot>,
    /// Serializes writers (single-writer discipline).
    writer: Mutex<()>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
            writer: Mutex::new(()),
        }
    }

    /// Add or replace a single route.
    pub fn register(&self, route: Route) -> Option<RegistryConflict> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load();
        let mut by_key = current.by_key.clone();

        let conflict = insert_route(&mut by_key, route);
        self.snapshot
            .store(Arc::new(RouteSnapshot::from_routes(by_key)));
        conflict
    }

    /// Replace every route owned by `service_id` with `routes` in one swap.
    pub fn register_service(&self, service_id: &str, routes: Vec<Route>) -> Vec<RegistryConflict> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load();
        let mut by_key = current.by_key.clone();
        by_key.retain(|_, route| route.service_id != service_id);

        let route_count = routes.len();
        let conflicts: Vec<RegistryConflict> = routes
            .into_iter()
            .filter_map(|route| insert_route(&mut by_key, route))
            .collect();

        self.snapshot
            .store(Arc::new(RouteSnapshot::from_routes(by_key)));

        info!(
            service_id = %service_id,
            route_count,
            conflicts = conflicts.len(),
            "Service routes registered"
        );
        conflicts
    }

    /// Remove every route registered by `service_id`.
    ///
    /// Returns the number of routes removed.
    pub fn deregister(&self, service_id: &str) -> usize {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load();
        let mut by_key = current.by_key.clone();
        let before = by_key.len();
        by_key.retain(|_, route| route.service_id != service_id);
        let removed = before - by_key.len();

        if removed > 0 {
            self.snapshot
                .store(Arc::new(RouteSnapshot::from_routes(by_key)));
            info!(service_id = %service_id, removed, "Service routes deregistered");
        } else {
            debug!(service_id = %service_id, "Deregister for service without routes");
        }
        removed
    }

    /// Remove `service_id`, but only while it still routes to `target`.
    ///
    /// A service re-registered with a different target since the caller
    /// looked is left alone. Returns the number of routes removed.
    pub fn deregister_target(&self, service_id: &str, target: SocketAddr) -> usize {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load();
        let still_routed = current
            .by_key
            .values()
            .any(|route| route.service_id == service_id && route.target == target);
        if !still_routed {
            debug!(service_id = %service_id, target = %target, "Service no longer routes to target");
            return 0;
        }

        let mut by_key = current.by_key.clone();
        let before = by_key.len();
        by_key.retain(|_, route| route.service_id != service_id);
        let removed = before - by_key.len();
        self.snapshot
            .store(Arc::new(RouteSnapshot::from_routes(by_key)));
        info!(service_id = %service_id, target = %target, removed, "Service routes deregistered");
        removed
    }

    /// Resolve a hostname on an entry point to at most one route.
    pub fn resolve(&self, hostname: &str, entry_point: EntryPoint) -> Option<Route> {
        let normalized = normalize_hostname(hostname);
        let snapshot = self.snapshot.load();
        let route = snapshot.resolve(&normalized, entry_point).cloned();

        match &route {
            Some(route) => debug!(
                hostname = %normalized,
                entry_point = %entry_point,
                service_id = %route.service_id,
                pattern = %route.host,
                "Route matched"
            ),
            None => debug!(hostname = %normalized, entry_point = %entry_point, "No route"),
        }
        route
    }

    /// All routes, ordered by entry point then host pattern.
    pub fn routes(&self) -> Vec<Route> {
        self.snapshot.load().by_key.values().cloned().collect()
    }

    /// Routes registered by one service.
    pub fn service_routes(&self, service_id: &str) -> Vec<Route> {
        self.snapshot
            .load()
            .by_key
            .values()
            .filter(|route| route.service_id == service_id)
            .cloned()
            .collect()
    }

    /// Distinct services with at least one route.
    pub fn service_ids(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let ids: BTreeSet<&str> = snapshot
            .by_key
            .values()
            .map(|route| route.service_id.as_str())
            .collect();
        ids.into_iter().map(str::to_string).collect()
    }

    /// Distinct `(service_id, target)` pairs, for health probing.
    pub fn targets(&self) -> Vec<(String, SocketAddr)> {
        let snapshot = self.snapshot.load();
        let targets: BTreeSet<(&str, SocketAddr)> = snapshot
            .by_key
            .values()
            .map(|route| (route.service_id.as_str(), route.target))
            .collect();
        targets
            .into_iter()
            .map(|(id, addr)| (id.to_string(), addr))
            .collect()
    }

    /// Get the total number of routes.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_key.len()
    }

    /// Check if the route table is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().by_key.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_route(by_key: &mut BTreeMap<RouteKey, Route>, route: Route) -> Option<RegistryConflict> {
    let key = route.key();
    let current = route.service_id.clone();
    let previous = by_key.insert(key.clone(), route)?;

    if previous.service_id == current {
        return None;
    }

    let conflict = RegistryConflict {
        key,
        previous: previous.service_id,
        current,
    };
    warn!(
        route = %conflict.key,
        previous_service = %conflict.previous,
        service_id = %conflict.current,
        "Route conflict, most recent registration wins"
    );
    Some(conflict)
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_route(service: &str, host: &str, entry_point: EntryPoint, port: u16) -> Route {
        Route {
            service_id: service.to_string(),
            router: service.to_string(),
            host: host.parse().unwrap(),
            target: SocketAddr::from(([127, 0, 0, 1], port)),
            entry_point,
            tls_enabled: entry_point == EntryPoint::WebSecure,
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Example.COM"), "example.com");
        assert_eq!(normalize_hostname("example.com."), "example.com");
        assert_eq!(normalize_hostname("app.localhost:8080"), "app.localhost");
        assert_eq!(normalize_hostname("[::1]:8443"), "[::1]");
    }

    #[test]
    fn test_host_pattern_parse_and_display() {
        let pattern: HostPattern = "*.App.Localhost".parse().unwrap();
        assert_eq!(pattern, HostPattern::wildcard("app.localhost"));
        assert_eq!(pattern.to_string(), "*.app.localhost");
        assert!("bad host!".parse::<HostPattern>().is_err());
        assert!("*.".parse::<HostPattern>().is_err());
    }

    #[test]
    fn test_wildcard_single_label() {
        let pattern = HostPattern::wildcard("app.localhost");
        assert!(pattern.matches("api.app.localhost"));
        assert!(pattern.matches("admin.app.localhost"));
        assert!(!pattern.matches("a.b.app.localhost"));
        assert!(!pattern.matches("app.localhost"));
        assert!(!pattern.matches("xapp.localhost"));
        assert!(!pattern.matches("under_score.app.localhost"));
    }

    #[test]
    fn test_exact_before_wildcard() {
        let table = RouteTable::new();
        table.register(make_route("wild", "*.app.localhost", EntryPoint::Web, 4001));
        table.register(make_route("api", "api.app.localhost", EntryPoint::Web, 4002));

        let route = table.resolve("api.app.localhost", EntryPoint::Web).unwrap();
        assert_eq!(route.service_id, "api");

        let route = table.resolve("admin.app.localhost", EntryPoint::Web).unwrap();
        assert_eq!(route.service_id, "wild");
    }

    #[test]
    fn test_longest_wildcard_suffix_wins() {
        let table = RouteTable::new();
        table.register(make_route("outer", "*.localhost", EntryPoint::Web, 4001));
        table.register(make_route("inner", "*.app.localhost", EntryPoint::Web, 4002));

        let route = table.resolve("api.app.localhost", EntryPoint::Web).unwrap();
        assert_eq!(route.service_id, "inner");

        let route = table.resolve("app.localhost", EntryPoint::Web).unwrap();
        assert_eq!(route.service_id, "outer");
    }

    #[test]
    fn test_entry_points_are_independent() {
        let table = RouteTable::new();
        table.register(make_route("a", "app.localhost", EntryPoint::Web, 4001));

        assert!(table.resolve("app.localhost", EntryPoint::Web).is_some());
        assert!(table.resolve("app.localhost", EntryPoint::WebSecure).is_none());
    }

    #[test]
    fn test_conflict_last_write_wins() {
        let table = RouteTable::new();
        assert!(table
            .register(make_route("first", "app.localhost", EntryPoint::Web, 4001))
            .is_none());

        let conflict = table
            .register(make_route("second", "app.localhost", EntryPoint::Web, 4002))
            .expect("conflict reported");
        assert_eq!(conflict.previous, "first");
        assert_eq!(conflict.current, "second");

        let route = table.resolve("app.localhost", EntryPoint::Web).unwrap();
        assert_eq!(route.service_id, "second");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_register_service_replaces_previous_routes() {
        let table = RouteTable::new();
        table.register_service(
            "svc",
            vec![
                make_route("svc", "one.localhost", EntryPoint::Web, 4001),
                make_route("svc", "two.localhost", EntryPoint::Web, 4001),
            ],
        );
        assert_eq!(table.len(), 2);

        table.register_service(
            "svc",
            vec![make_route("svc", "three.localhost", EntryPoint::Web, 4001)],
        );
        assert_eq!(table.len(), 1);
        assert!(table.resolve("one.localhost", EntryPoint::Web).is_none());
        assert!(table.resolve("three.localhost", EntryPoint::Web).is_some());
    }

    #[test]
    fn test_deregister_removes_all_service_routes() {
        let table = RouteTable::new();
        table.register_service(
            "svc",
            vec![
                make_route("svc", "app.localhost", EntryPoint::Web, 4001),
                make_route("svc", "*.app.localhost", EntryPoint::WebSecure, 4001),
            ],
        );
        table.register(make_route("other", "other.localhost", EntryPoint::Web, 4002));

        assert_eq!(table.deregister("svc"), 2);
        assert!(table.resolve("app.localhost", EntryPoint::Web).is_none());
        assert!(table
            .resolve("api.app.localhost", EntryPoint::WebSecure)
            .is_none());
        assert_eq!(table.service_ids(), vec!["other".to_string()]);
        assert_eq!(table.deregister("svc"), 0);
    }

    #[test]
    fn test_targets_are_distinct() {
        let table = RouteTable::new();
        table.register_service(
            "svc",
            vec![
                make_route("svc", "app.localhost", EntryPoint::Web, 4001),
                make_route("svc", "app.localhost", EntryPoint::WebSecure, 4001),
            ],
        );
        assert_eq!(table.targets().len(), 1);
    }

    #[test]
    fn test_route_serializes_pattern_as_string() {
        let route = make_route("svc", "*.app.localhost", EntryPoint::WebSecure, 4001);
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["host"], "*.app.localhost");
        assert_eq!(json["entry_point"], "websecure");

        let back: Route = serde_json::from_value(json).unwrap();
        assert_eq!(back, route);
    }

    proptest! {
        #[test]
        fn prop_wildcard_matches_any_single_label(label in "[a-zA-Z0-9-]{1,20}") {
            let pattern = HostPattern::wildcard("app.localhost");
            let host = normalize_hostname(&format!("{label}.app.localhost"));
            prop_assert!(pattern.matches(&host));
        }

        #[test]
        fn prop_wildcard_rejects_nested_labels(a in "[a-z0-9]{1,10}", b in "[a-z0-9]{1,10}") {
            let pattern = HostPattern::wildcard("app.localhost");
            let host = format!("{a}.{b}.app.localhost");
            prop_assert!(!pattern.matches(&host));
        }

        #[test]
        fn prop_resolution_is_unique(hosts in proptest::collection::vec("[a-c]{1,2}", 1..8)) {
            let table = RouteTable::new();
            for (i, host) in hosts.iter().enumerate() {
                table.register(make_route(
                    &format!("svc-{i}"),
                    &format!("{host}.localhost"),
                    EntryPoint::Web,
                    4000 + i as u16,
                ));
            }
            for host in &hosts {
                let name = format!("{host}.localhost");
                let matching = table
                    .routes()
                    .into_iter()
                    .filter(|r| r.entry_point == EntryPoint::Web && r.host.matches(&name))
                    .count();
                prop_assert_eq!(matching, 1);
                prop_assert!(table.resolve(&name, EntryPoint::Web).is_some());
            }
        }

        #[test]
        fn prop_mixed_patterns_resolve_like_model(
            patterns in proptest::collection::vec(
                (any::<bool>(), "[a-c]{1,2}(\\.[a-c]{1,2}){0,2}", 0usize..4),
                1..12,
            ),
            queries in proptest::collection::vec("[a-c]{1,2}(\\.[a-c]{1,2}){0,3}", 1..12),
        ) {
            let table = RouteTable::new();
            // Last write wins per pattern.
            let mut model: HashMap<HostPattern, String> = HashMap::new();
            for (i, (wild, host, service)) in patterns.iter().enumerate() {
                let host = format!("{host}.localhost");
                let raw = if *wild { format!("*.{host}") } else { host };
                let service_id = format!("svc-{service}");
                let route = make_route(&service_id, &raw, EntryPoint::Web, 4000 + i as u16);
                model.insert(route.host.clone(), service_id);
                table.register(route);
            }

            for query in &queries {
                let name = format!("{query}.localhost");
                let exact = model.get(&HostPattern::exact(&name));
                let wildcard = model
                    .iter()
                    .filter(|(pattern, _)| matches!(pattern, HostPattern::Wildcard { .. }) && pattern.matches(&name))
                    .max_by_key(|(pattern, _)| pattern.to_string().len())
                    .map(|(_, service)| service);
                let expected = exact.or(wildcard);

                let resolved = table.resolve(&name, EntryPoint::Web);
                prop_assert_eq!(resolved.as_ref().map(|r| &r.service_id), expected);
                if let Some(route) = resolved {
                    prop_assert!(route.host.matches(&name));
                    prop_assert!(table.resolve(&name, EntryPoint::WebSecure).is_none());
                }
            }
        }
    }

    #[test]
    fn test_readers_never_see_half_applied_service() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let table = RouteTable::new();
        let service_routes = |port: u16| {
            vec![
                make_route("svc", "app.localhost", EntryPoint::Web, port),
                make_route("svc", "*.app.localhost", EntryPoint::Web, port),
                make_route("svc", "app.localhost", EntryPoint::WebSecure, port),
            ]
        };
        table.register_service("svc", service_routes(5000));
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for generation in 1..=2000u16 {
                    table.register_service("svc", service_routes(5000 + generation % 2));
                }
                done.store(true, Ordering::SeqCst);
            });

            for _ in 0..4 {
                scope.spawn(|| {
                    while !done.load(Ordering::SeqCst) {
                        let routes = table.service_routes("svc");
                        assert_eq!(routes.len(), 3, "partial service visible");
                        let port = routes[0].target.port();
                        assert!(routes.iter().all(|r| r.target.port() == port));

                        assert!(table.resolve("app.localhost", EntryPoint::Web).is_some());
                        assert!(table.resolve("api.app.localhost", EntryPoint::Web).is_some());
                        assert!(table.resolve("app.localhost", EntryPoint::WebSecure).is_some());
                    }
                });
            }
        });

        assert_eq!(table.len(), 3);
    }
}
