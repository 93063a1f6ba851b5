//! Proxy lifecycle: start, stop, status.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::admin;
use crate::certs::{run_renewal_loop, CertificateMetadata};
use crate::config::{Config, DiscoveryConfig};
use crate::context::AppContext;
use crate::discovery::{DiscoveryReport, DiscoverySource, FileSource, HttpEventSource, Watcher};
use crate::error::ControlError;
use crate::proxy::{
    build_tls_acceptor, run_health_prober, EntryPoint, Listener, ListenerConfig, ListenerCounters,
    ListenerStats, Route, ServeReport,
};

/// Live view of one entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub entry_point: EntryPoint,
    pub address: SocketAddr,
    /// Accept loop is running.
    pub healthy: bool,
    pub active_connections: u64,
    #[serde(flatten)]
    pub counters: ListenerCounters,
}

/// Answer to `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub running: bool,
    /// Listeners are closed and in-flight connections are draining.
    #[serde(default)]
    pub stopping: bool,
    pub listeners: Vec<ListenerStatus>,
    pub route_count: usize,
    pub service_count: usize,
    pub discovery: DiscoveryReport,
    #[serde(default)]
    pub certificates: Vec<CertificateMetadata>,
}

/// Aggregate drain result of a stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    pub drained: usize,
    pub forced: usize,
}

struct ListenerHandle {
    entry_point: EntryPoint,
    address: SocketAddr,
    stats: Arc<ListenerStats>,
    task: JoinHandle<ServeReport>,
}

struct RunningState {
    shutdown: watch::Sender<bool>,
    listeners: Vec<ListenerHandle>,
    background: JoinSet<()>,
}

/// The proxy core: entry points plus the tasks that keep routes and
/// certificates current.
pub struct Proxy {
    ctx: AppContext,
    source: Option<Arc<dyn DiscoverySource>>,
    /// Serializes start and stop. Held across the whole transition.
    lifecycle: Mutex<()>,
    /// Only held briefly, so status reads never wait on a transition.
    state: Mutex<Option<RunningState>>,
    stopping: AtomicBool,
}

impl Proxy {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            source: None,
            lifecycle: Mutex::new(()),
            state: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    /// Build a proxy with the discovery source named by `config.discovery`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let source = discovery_source(&config.discovery)?;
        let proxy = Self::new(AppContext::new(config));
        Ok(match source {
            Some(source) => proxy.with_discovery(source),
            None => proxy,
        })
    }

    /// Attach the discovery source subscribed to on each start.
    pub fn with_discovery(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Current route table.
    pub fn routes(&self) -> Vec<Route> {
        self.ctx.routes.routes()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// A stop is draining connections.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Ensure certificates, bind every entry point, then start serving.
    ///
    /// Returns the bound address of each entry point.
    pub async fn start(&self) -> Result<Vec<(EntryPoint, SocketAddr)>, ControlError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.lock().await.is_some() {
            return Err(ControlError::AlreadyRunning);
        }

        let config = Arc::clone(&self.ctx.config);

        let tls = if config.websecure_enabled {
            let ca_pem = self.ctx.certs.ca_certificate_pem()?;
            for domain in &config.domains {
                let cert = self.ctx.certs.ensure_certificate(domain)?;
                self.ctx.resolver.install(&cert, &ca_pem)?;
            }
            Some(build_tls_acceptor(Arc::clone(&self.ctx.resolver))?)
        } else {
            None
        };

        // Bind everything before serving anything, so a bind failure leaves
        // nothing running.
        let mut bound = Vec::new();
        let mut https_port = None;
        if let Some(acceptor) = tls {
            let listener = Listener::bind(
                self.listener_config(EntryPoint::WebSecure, config.websecure_addr),
                Arc::clone(&self.ctx.routes),
                Arc::clone(&self.ctx.health),
                Some(acceptor),
            )
            .await?;
            https_port = Some(listener.local_addr().port());
            bound.push(listener);
        }

        let mut web_config = self.listener_config(EntryPoint::Web, config.web_addr);
        if config.redirect_to_https {
            web_config.redirect_https_port = https_port;
        }
        let web = Listener::bind(
            web_config,
            Arc::clone(&self.ctx.routes),
            Arc::clone(&self.ctx.health),
            None,
        )
        .await?;
        bound.insert(0, web);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut addresses = Vec::with_capacity(bound.len());
        let mut listeners = Vec::with_capacity(bound.len());
        for listener in bound {
            let entry_point = listener.entry_point();
            let address = listener.local_addr();
            let stats = listener.stats();
            let task = tokio::spawn(listener.serve(shutdown_rx.clone(), config.shutdown_grace));
            addresses.push((entry_point, address));
            listeners.push(ListenerHandle {
                entry_point,
                address,
                stats,
                task,
            });
        }

        let mut background = JoinSet::new();

        if let Some(source) = &self.source {
            let watcher = Watcher::new(
                Arc::clone(&self.ctx.routes),
                config.labels.clone(),
                Arc::clone(&self.ctx.discovery),
            );
            let events = source.subscribe();
            background.spawn(watcher.run(source.name().to_string(), events, shutdown_rx.clone()));
        }

        if config.websecure_enabled {
            background.spawn(run_renewal_loop(
                Arc::clone(&self.ctx.certs),
                Arc::clone(&self.ctx.resolver),
                config.domains.clone(),
                config.renewal_check_interval,
                shutdown_rx.clone(),
            ));
        }

        if config.health.enabled {
            background.spawn(run_health_prober(
                Arc::clone(&self.ctx.routes),
                Arc::clone(&self.ctx.health),
                config.health.interval,
                config.connect_timeout,
                shutdown_rx.clone(),
            ));
        }

        info!(
            listeners = ?addresses,
            discovery = self.source.as_ref().map(|s| s.name()).unwrap_or("none"),
            domains = ?config.domains,
            "Proxy started"
        );

        *self.state.lock().await = Some(RunningState {
            shutdown: shutdown_tx,
            listeners,
            background,
        });
        Ok(addresses)
    }

    fn listener_config(&self, entry_point: EntryPoint, bind_addr: SocketAddr) -> ListenerConfig {
        let config = &self.ctx.config;
        let mut listener = ListenerConfig::new(entry_point, bind_addr);
        listener.max_connections = config.max_connections;
        listener.header_timeout = config.header_timeout;
        listener.max_header_bytes = config.max_header_bytes;
        listener.connect_timeout = config.connect_timeout;
        listener.idle_timeout = config.idle_timeout;
        listener
    }

    /// Stop accepting, drain for the grace period, then force-close.
    ///
    /// Returns `false` when the proxy was not running.
    pub async fn stop(&self) -> bool {
        self.shutdown().await.is_some()
    }

    /// Like [`Proxy::stop`], reporting how connections ended.
    pub async fn shutdown(&self) -> Option<StopReport> {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self.state.lock().await.take()?;
        info!("Stopping proxy");

        self.stopping.store(true, Ordering::SeqCst);
        // Listeners and background tasks share one grace deadline.
        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_grace;
        let _ = running.shutdown.send(true);

        let mut report = StopReport::default();
        for handle in running.listeners {
            match handle.task.await {
                Ok(serve) => {
                    report.drained += serve.drained;
                    report.forced += serve.forced;
                }
                Err(e) => error!(entry_point = %handle.entry_point, error = %e, "Listener task failed"),
            }
        }

        let mut background = running.background;
        let finished = tokio::time::timeout_at(deadline, async {
            while background.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !finished {
            warn!("Background tasks did not stop in time; aborting");
            background.abort_all();
            while background.join_next().await.is_some() {}
        }

        self.stopping.store(false, Ordering::SeqCst);
        info!(drained = report.drained, forced = report.forced, "Proxy stopped");
        Some(report)
    }

    pub async fn status(&self) -> ProxyStatus {
        let state = self.state.lock().await;
        let listeners = state
            .as_ref()
            .map(|running| {
                running
                    .listeners
                    .iter()
                    .map(|handle| ListenerStatus {
                        entry_point: handle.entry_point,
                        address: handle.address,
                        healthy: handle.stats.is_serving() && !handle.task.is_finished(),
                        active_connections: handle.stats.active(),
                        counters: handle.stats.counters(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let certificates = if self.ctx.config.websecure_enabled {
            self.ctx
                .config
                .domains
                .iter()
                .filter_map(|domain| self.ctx.certs.metadata(domain).ok().flatten())
                .collect()
        } else {
            Vec::new()
        };

        ProxyStatus {
            running: state.is_some(),
            stopping: self.is_stopping(),
            listeners,
            route_count: self.ctx.routes.len(),
            service_count: self.ctx.routes.service_ids().len(),
            discovery: self.ctx.discovery.report(),
            certificates,
        }
    }
}

fn discovery_source(config: &DiscoveryConfig) -> anyhow::Result<Option<Arc<dyn DiscoverySource>>> {
    Ok(match config {
        DiscoveryConfig::None => None,
        DiscoveryConfig::File {
            path,
            poll_interval,
        } => Some(Arc::new(FileSource::new(path.clone(), *poll_interval))),
        DiscoveryConfig::Http(http) => Some(Arc::new(HttpEventSource::new(http.clone())?)),
    })
}

/// Start the proxy and the admin API, then run until Ctrl+C or an admin
/// shutdown request.
pub async fn run_until_shutdown(proxy: Arc<Proxy>) -> Result<(), ControlError> {
    proxy.start().await?;

    let shutdown = Arc::new(Notify::new());
    let (admin_stop_tx, admin_stop_rx) = watch::channel(false);

    let admin_task = match proxy.context().config.admin_addr {
        Some(addr) => {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(source) => {
                    proxy.stop().await;
                    return Err(ControlError::Admin { addr, source });
                }
            };
            info!(addr = %addr, "Admin API listening");
            let app = admin::router(admin::AdminState {
                proxy: Arc::clone(&proxy),
                shutdown: Arc::clone(&shutdown),
            });
            Some(tokio::spawn(admin::serve(listener, app, admin_stop_rx)))
        }
        None => None,
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = shutdown.notified() => {
            info!("Shutdown requested through admin API");
        }
    }

    proxy.stop().await;

    let _ = admin_stop_tx.send(true);
    if let Some(task) = admin_task {
        if let Ok(Err(e)) = task.await {
            error!(error = %e, "Admin API error");
        }
    }
    Ok(())
}
