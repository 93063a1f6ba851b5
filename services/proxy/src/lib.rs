//! hostgate proxy
//!
//! Hostname-routing HTTP/HTTPS reverse proxy for local development:
//! - Discovers services and their routing labels from a registry
//! - Routes requests by `Host` header or SNI to the matching backend
//! - Terminates TLS with wildcard certificates from a local CA
//! - Exposes a loopback admin API for status and shutdown

pub mod admin;
pub mod certs;
pub mod config;
pub mod context;
pub mod control;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod proxy;

pub use config::Config;
pub use context::AppContext;
pub use control::{run_until_shutdown, ListenerStatus, Proxy, ProxyStatus, StopReport};
pub use error::{ControlError, ProxyError};
pub use proxy::{EntryPoint, HostPattern, ListenerCounters, Route, RouteTable, SharedRouteTable};
