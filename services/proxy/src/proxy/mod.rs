//! Hostname-routing HTTP(S) proxy.
//!
//! This module provides:
//! - Route registry with exact and single-label wildcard hosts
//! - Entry point listeners with TLS termination
//! - First-request-head parsing and forwarding headers
//! - Backend health tracking
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener (web | websecure) -> [TLS] -> Request head -> RouteTable -> Backend
//!                                                                     ^
//!                                                        discovery::Watcher
//! ```

mod health;
mod http;
mod listener;
mod registry;
mod tls;

pub use health::{probe_once, run_health_prober, HealthTracker, DEFAULT_MAX_FAILURES};
pub use http::{
    parse_head, read_request_head, HeadError, RequestHead, DEFAULT_MAX_HEAD_BYTES,
};
pub use listener::{
    ConnectionContext, ConnectionState, Listener, ListenerConfig, ListenerCounters, ListenerStats,
    ServeReport,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEADER_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use registry::{
    is_dns_label, is_valid_hostname, normalize_hostname, EntryPoint, HostPattern,
    RegistryConflict, Route, RouteKey, RouteTable, SharedRouteTable,
};
pub use tls::build_tls_acceptor;
