//! Label-derived route configuration.
//!
//! Services advertise routing through Traefik-style labels:
//!
//! ```text
//! traefik.enable=true
//! traefik.http.routers.app.rule=Host(`app.localhost`) || HostRegexp(`{subdomain:[a-zA-Z0-9-]+}.app.localhost`)
//! traefik.http.routers.app.entrypoints=web,websecure
//! traefik.http.routers.app.tls=true
//! traefik.http.routers.app.service=app
//! traefik.http.services.app.loadbalancer.server.port=3000
//! ```
//!
//! The `traefik` prefix is configurable.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;

use super::rule::{parse_rule, RuleError};
use super::ServiceDescriptor;
use crate::proxy::{EntryPoint, Route};

pub const DEFAULT_LABEL_PREFIX: &str = "traefik";

/// Malformed label set for one service. Non-fatal: the service is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("service '{service_id}' is enabled but declares no router rule")]
    MissingRule { service_id: String },

    #[error("service '{service_id}' router '{router}': {source}")]
    InvalidRule {
        service_id: String,
        router: String,
        #[source]
        source: RuleError,
    },

    #[error("service '{service_id}' router '{router}': no backend port label")]
    MissingPort { service_id: String, router: String },

    #[error("service '{service_id}' label '{label}': invalid port '{value}'")]
    InvalidPort {
        service_id: String,
        label: String,
        value: String,
    },

    #[error("service '{service_id}' router '{router}': unknown entry point '{value}'")]
    UnknownEntryPoint {
        service_id: String,
        router: String,
        value: String,
    },

    #[error("service '{service_id}' label '{label}': invalid boolean '{value}'")]
    InvalidFlag {
        service_id: String,
        label: String,
        value: String,
    },

    #[error("service '{service_id}': invalid address '{address}'")]
    InvalidAddress { service_id: String, address: String },
}

/// How labels are interpreted.
#[derive(Debug, Clone)]
pub struct LabelConfig {
    /// Label namespace, `traefik` by default.
    pub prefix: String,
    /// Entry points used when a router declares none.
    pub default_entry_points: Vec<EntryPoint>,
    /// Route services that carry router labels but no `enable` label.
    pub exposed_by_default: bool,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_LABEL_PREFIX.to_string(),
            default_entry_points: EntryPoint::ALL.to_vec(),
            exposed_by_default: true,
        }
    }
}

#[derive(Debug, Default)]
struct RouterLabels<'a> {
    rule: Option<&'a str>,
    entry_points: Option<&'a str>,
    tls: Option<(&'a str, &'a str)>,
    tls_options: bool,
    service: Option<&'a str>,
}

/// Derive the routes a service asks for.
///
/// Returns an empty list when the service is not exposed.
pub fn parse_service(
    service: &ServiceDescriptor,
    config: &LabelConfig,
) -> Result<Vec<Route>, ConfigError> {
    let service_id = service.service_id.as_str();
    let enable_key = format!("{}.enable", config.prefix);
    let enabled = match service.labels.get(&enable_key) {
        Some(value) => parse_flag(service_id, &enable_key, value)?,
        None => config.exposed_by_default,
    };
    if !enabled {
        return Ok(Vec::new());
    }

    let routers_prefix = format!("{}.http.routers.", config.prefix);
    let services_prefix = format!("{}.http.services.", config.prefix);

    let mut routers: BTreeMap<&str, RouterLabels<'_>> = BTreeMap::new();
    let mut ports: BTreeMap<&str, (&str, &str)> = BTreeMap::new();

    for (key, value) in &service.labels {
        if let Some(rest) = key.strip_prefix(&routers_prefix) {
            let Some((router, field)) = rest.split_once('.') else {
                continue;
            };
            let entry = routers.entry(router).or_default();
            match field {
                "rule" => entry.rule = Some(value.as_str()),
                "entrypoints" => entry.entry_points = Some(value.as_str()),
                "tls" => entry.tls = Some((key.as_str(), value.as_str())),
                "service" => entry.service = Some(value.as_str()),
                f if f.starts_with("tls.") => entry.tls_options = true,
                _ => {}
            }
        } else if let Some(rest) = key.strip_prefix(&services_prefix) {
            if let Some(name) = rest.strip_suffix(".loadbalancer.server.port") {
                ports.insert(name, (key.as_str(), value.as_str()));
            }
        }
    }

    let has_rule = routers.values().any(|r| r.rule.is_some());
    if !has_rule {
        return if service.labels.contains_key(&enable_key) {
            Err(ConfigError::MissingRule {
                service_id: service_id.to_string(),
            })
        } else {
            Ok(Vec::new())
        };
    }

    let ip = parse_address(service_id, &service.address)?;
    let mut routes = Vec::new();

    for (router, labels) in routers {
        let Some(rule) = labels.rule else {
            continue;
        };

        let patterns = parse_rule(rule).map_err(|source| ConfigError::InvalidRule {
            service_id: service_id.to_string(),
            router: router.to_string(),
            source,
        })?;

        let port_label = ports
            .get(labels.service.unwrap_or(router))
            .or_else(|| {
                if ports.len() == 1 {
                    ports.values().next()
                } else {
                    None
                }
            })
            .ok_or_else(|| ConfigError::MissingPort {
                service_id: service_id.to_string(),
                router: router.to_string(),
            })?;
        let port = parse_port(service_id, port_label.0, port_label.1)?;

        let entry_points = match labels.entry_points {
            Some(raw) => parse_entry_points(service_id, router, raw)?,
            None => config.default_entry_points.clone(),
        };

        let tls = match labels.tls {
            Some((key, value)) => parse_flag(service_id, key, value)?,
            None => labels.tls_options,
        };

        for entry_point in entry_points {
            for host in &patterns {
                routes.push(Route {
                    service_id: service_id.to_string(),
                    router: router.to_string(),
                    host: host.clone(),
                    target: SocketAddr::new(ip, port),
                    entry_point,
                    tls_enabled: tls || entry_point == EntryPoint::WebSecure,
                });
            }
        }
    }

    Ok(routes)
}

fn parse_flag(service_id: &str, label: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            service_id: service_id.to_string(),
            label: label.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_port(service_id: &str, label: &str, value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort {
            service_id: service_id.to_string(),
            label: label.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_address(service_id: &str, address: &str) -> Result<IpAddr, ConfigError> {
    let trimmed = address.trim();
    if trimmed.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| ConfigError::InvalidAddress {
            service_id: service_id.to_string(),
            address: address.to_string(),
        })
}

fn parse_entry_points(
    service_id: &str,
    router: &str,
    raw: &str,
) -> Result<Vec<EntryPoint>, ConfigError> {
    let mut entry_points = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let entry_point = part
            .parse::<EntryPoint>()
            .map_err(|value| ConfigError::UnknownEntryPoint {
                service_id: service_id.to_string(),
                router: router.to_string(),
                value,
            })?;
        if !entry_points.contains(&entry_point) {
            entry_points.push(entry_point);
        }
    }
    if entry_points.is_empty() {
        return Err(ConfigError::UnknownEntryPoint {
            service_id: service_id.to_string(),
            router: router.to_string(),
            value: raw.to_string(),
        });
    }
    Ok(entry_points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::HostPattern;

    fn descriptor(labels: &[(&str, &str)]) -> ServiceDescriptor {
        ServiceDescriptor {
            service_id: "svc-1".to_string(),
            address: "127.0.0.1".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_full_label_set() {
        let service = descriptor(&[
            ("traefik.enable", "true"),
            (
                "traefik.http.routers.app.rule",
                "Host(`app.localhost`) || HostRegexp(`{subdomain:[a-zA-Z0-9-]+}.app.localhost`)",
            ),
            ("traefik.http.routers.app.entrypoints", "web,websecure"),
            ("traefik.http.routers.app.tls", "true"),
            ("traefik.http.services.app.loadbalancer.server.port", "3000"),
        ]);

        let routes = parse_service(&service, &LabelConfig::default()).unwrap();
        assert_eq!(routes.len(), 4);
        assert!(routes
            .iter()
            .all(|r| r.target == "127.0.0.1:3000".parse().unwrap() && r.tls_enabled));
        assert!(routes.iter().any(|r| r.entry_point == EntryPoint::Web
            && r.host == HostPattern::wildcard("app.localhost")));
    }

    #[test]
    fn test_defaults_entry_points_and_single_port() {
        let service = descriptor(&[
            ("traefik.http.routers.web.rule", "Host(`api.localhost`)"),
            ("traefik.http.services.backend.loadbalancer.server.port", "8000"),
        ]);

        let routes = parse_service(&service, &LabelConfig::default()).unwrap();
        assert_eq!(routes.len(), 2);
        let web = routes
            .iter()
            .find(|r| r.entry_point == EntryPoint::Web)
            .unwrap();
        assert!(!web.tls_enabled);
        assert_eq!(web.target.port(), 8000);
    }

    #[test]
    fn test_router_service_reference() {
        let service = descriptor(&[
            ("traefik.http.routers.a.rule", "Host(`a.localhost`)"),
            ("traefik.http.routers.a.service", "alpha"),
            ("traefik.http.routers.a.entrypoints", "web"),
            ("traefik.http.routers.b.rule", "Host(`b.localhost`)"),
            ("traefik.http.routers.b.entrypoints", "web"),
            ("traefik.http.services.alpha.loadbalancer.server.port", "1111"),
            ("traefik.http.services.b.loadbalancer.server.port", "2222"),
        ]);

        let routes = parse_service(&service, &LabelConfig::default()).unwrap();
        let port_of = |host: &str| {
            routes
                .iter()
                .find(|r| r.host == HostPattern::exact(host))
                .map(|r| r.target.port())
        };
        assert_eq!(port_of("a.localhost"), Some(1111));
        assert_eq!(port_of("b.localhost"), Some(2222));
    }

    #[test]
    fn test_disabled_and_unlabelled_services_are_ignored() {
        let disabled = descriptor(&[
            ("traefik.enable", "false"),
            ("traefik.http.routers.app.rule", "Host(`app.localhost`)"),
        ]);
        assert!(parse_service(&disabled, &LabelConfig::default())
            .unwrap()
            .is_empty());

        let plain = descriptor(&[("com.example.owner", "me")]);
        assert!(parse_service(&plain, &LabelConfig::default())
            .unwrap()
            .is_empty());

        let opt_in = LabelConfig {
            exposed_by_default: false,
            ..LabelConfig::default()
        };
        let implicit = descriptor(&[
            ("traefik.http.routers.app.rule", "Host(`app.localhost`)"),
            ("traefik.http.services.app.loadbalancer.server.port", "80"),
        ]);
        assert!(parse_service(&implicit, &opt_in).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_label_sets() {
        let missing_rule = descriptor(&[("traefik.enable", "true")]);
        assert!(matches!(
            parse_service(&missing_rule, &LabelConfig::default()),
            Err(ConfigError::MissingRule { .. })
        ));

        let bad_port = descriptor(&[
            ("traefik.http.routers.app.rule", "Host(`app.localhost`)"),
            ("traefik.http.services.app.loadbalancer.server.port", "http"),
        ]);
        assert!(matches!(
            parse_service(&bad_port, &LabelConfig::default()),
            Err(ConfigError::InvalidPort { .. })
        ));

        let no_port = descriptor(&[("traefik.http.routers.app.rule", "Host(`app.localhost`)")]);
        assert!(matches!(
            parse_service(&no_port, &LabelConfig::default()),
            Err(ConfigError::MissingPort { .. })
        ));

        let bad_rule = descriptor(&[
            ("traefik.http.routers.app.rule", "Path(`/`)"),
            ("traefik.http.services.app.loadbalancer.server.port", "80"),
        ]);
        assert!(matches!(
            parse_service(&bad_rule, &LabelConfig::default()),
            Err(ConfigError::InvalidRule { .. })
        ));

        let bad_entry = descriptor(&[
            ("traefik.http.routers.app.rule", "Host(`app.localhost`)"),
            ("traefik.http.routers.app.entrypoints", "metrics"),
            ("traefik.http.services.app.loadbalancer.server.port", "80"),
        ]);
        assert!(matches!(
            parse_service(&bad_entry, &LabelConfig::default()),
            Err(ConfigError::UnknownEntryPoint { .. })
        ));
    }

    #[test]
    fn test_custom_prefix_and_localhost_address() {
        let mut service = descriptor(&[
            ("hostgate.http.routers.app.rule", "Host(`app.localhost`)"),
            ("hostgate.http.services.app.loadbalancer.server.port", "5173"),
        ]);
        service.address = "localhost".to_string();
        let config = LabelConfig {
            prefix: "hostgate".to_string(),
            ..LabelConfig::default()
        };

        let routes = parse_service(&service, &config).unwrap();
        assert_eq!(routes[0].target, "127.0.0.1:5173".parse().unwrap());
    }
}
