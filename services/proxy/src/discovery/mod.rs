//! Backend discovery.
//!
//! A [`DiscoverySource`] turns an external service registry into a lazy,
//! unbounded stream of [`DiscoveryEvent`]s. The [`Watcher`] consumes one
//! stream, derives routes from each service's labels, and applies them to the
//! route table in arrival order.
//!
//! ## Architecture
//!
//! ```text
//! Source (file | events feed | channel) -> Watcher -> labels -> RouteTable
//! ```

mod channel;
mod file;
mod http;
pub mod labels;
pub mod rule;
mod watcher;

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use channel::ChannelSource;
pub use file::FileSource;
pub use http::{HttpEventSource, HttpSourceConfig};
pub use labels::{parse_service, ConfigError, LabelConfig, DEFAULT_LABEL_PREFIX};
pub use rule::{parse_rule, RuleError};
pub use watcher::{DiscoveryHealth, DiscoveryReport, DiscoveryStatus, Watcher};

/// Upper bound for retry backoff against a failing source.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A backend as published by the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Stable identifier across updates.
    pub service_id: String,
    /// IP address (or `localhost`) the backend listens on.
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Event emitted by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Service appeared or changed; replaces any earlier registration.
    Registered(ServiceDescriptor),
    /// Service is gone.
    Deregistered { service_id: String },
    /// The source could not reach the registry and is retrying.
    Degraded {
        reason: String,
        consecutive_failures: u32,
    },
    /// The source reached the registry again after failures.
    Recovered,
}

/// Something that can be subscribed to for discovery events.
///
/// Each subscription is independent and cannot be restarted once dropped.
pub trait DiscoverySource: Send + Sync {
    /// Short name for logs and status.
    fn name(&self) -> &str;

    /// Start a new event stream.
    fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent>;
}

/// Exponential backoff: `base * 2^(failures - 1)`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}
