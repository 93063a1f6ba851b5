//! Shared process state handed to every component.

use std::sync::Arc;

use crate::certs::{CertificateStore, SniCertResolver};
use crate::config::Config;
use crate::discovery::DiscoveryStatus;
use crate::proxy::{HealthTracker, RouteTable, SharedRouteTable};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub routes: SharedRouteTable,
    pub certs: Arc<CertificateStore>,
    pub resolver: Arc<SniCertResolver>,
    pub health: Arc<HealthTracker>,
    pub discovery: Arc<DiscoveryStatus>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        let certs = CertificateStore::with_validity(
            config.cert_dir.clone(),
            config.cert_validity,
            config.renew_before,
        );
        let health = HealthTracker::new(config.health.max_failures);

        Self {
            config: Arc::new(config),
            routes: Arc::new(RouteTable::new()),
            certs: Arc::new(certs),
            resolver: Arc::new(SniCertResolver::new()),
            health: Arc::new(health),
            discovery: Arc::new(DiscoveryStatus::new()),
        }
    }
}
