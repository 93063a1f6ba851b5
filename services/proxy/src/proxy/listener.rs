//! Entry point listeners and connection handling.
//!
//! Each listener accepts connections for one entry point, terminates TLS when
//! configured, reads the first request head, and routes the whole connection
//! by its Host header:
//!
//! - no usable Host: `400 Bad Request`
//! - no matching route: `404 Not Found`
//! - backend connect failure: `502 Bad Gateway`
//! - otherwise the head is replayed to the backend and bytes are relayed
//!   both ways until either side closes or the idle timeout fires
//!
//! Routing is per connection; later requests on a keep-alive connection go
//! to the same backend.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::health::HealthTracker;
use super::http::{
    is_routable_host, read_request_head, redirect_response, simple_response, HeadError,
    DEFAULT_MAX_HEAD_BYTES,
};
use super::registry::{EntryPoint, Route, SharedRouteTable};
use crate::error::ProxyError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed for the TLS handshake and the request head.
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(300));

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub entry_point: EntryPoint,
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Deadline for the TLS handshake and for the first request head.
    pub header_timeout: Duration,
    /// Upper bound for the first request head.
    pub max_header_bytes: usize,
    /// Deadline for connecting to a backend.
    pub connect_timeout: Duration,
    /// Idle timeout for relayed connections.
    pub idle_timeout: Option<Duration>,
    /// When set on `web`, TLS routes are answered with a redirect to this
    /// HTTPS port instead of being forwarded.
    pub redirect_https_port: Option<u16>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(entry_point: EntryPoint, bind_addr: SocketAddr) -> Self {
        Self {
            entry_point,
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEAD_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            redirect_https_port: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Socket is bound and not yet closed.
    pub serving: AtomicBool,
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Requests that matched a route.
    pub routes_matched: AtomicU64,
    /// Requests answered with 400 or 404.
    pub routes_failed: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> ListenerCounters {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ListenerCounters {
            accepted: load(&self.connections_accepted),
            closed: load(&self.connections_closed),
            rejected: load(&self.connections_rejected),
            routes_matched: load(&self.routes_matched),
            routes_failed: load(&self.routes_failed),
            backend_connected: load(&self.backend_connected),
            backend_failed: load(&self.backend_failed),
            bytes_to_backend: load(&self.bytes_to_backend),
            bytes_from_backend: load(&self.bytes_from_backend),
        }
    }
}

/// Point-in-time copy of a listener's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerCounters {
    pub accepted: u64,
    pub closed: u64,
    /// Turned away at the connection limit.
    pub rejected: u64,
    pub routes_matched: u64,
    /// Answered with 400 or 404.
    pub routes_failed: u64,
    pub backend_connected: u64,
    pub backend_failed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Lifecycle of one inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    HeaderParsed,
    Resolved,
    Forwarding,
    /// Answered locally (400, 404, 502, redirect) without forwarding.
    Rejected,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, HeaderParsed)
                | (HeaderParsed, Resolved)
                | (Resolved, Forwarding)
                | (Accepted | HeaderParsed | Resolved, Rejected)
                | (Accepted | HeaderParsed | Resolved | Forwarding | Rejected, Closed)
        )
    }
}

/// Per-connection context, dropped when the connection closes.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub peer: SocketAddr,
    pub entry_point: EntryPoint,
    /// Server name negotiated during the TLS handshake.
    pub sni: Option<String>,
    /// Normalized Host header.
    pub host: Option<String>,
    pub route: Option<Route>,
    pub state: ConnectionState,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr, entry_point: EntryPoint) -> Self {
        Self {
            peer,
            entry_point,
            sni: None,
            host: None,
            route: None,
            state: ConnectionState::Accepted,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid connection transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Outcome of a listener's shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeReport {
    /// Connections that finished within the grace period.
    pub drained: usize,
    /// Connections aborted after the grace period.
    pub forced: usize,
}

/// Decrements the active count even when the task is aborted.
struct ActiveGuard(Arc<ListenerStats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.0.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

struct ConnectionHandler {
    config: ListenerConfig,
    routes: SharedRouteTable,
    health: Arc<HealthTracker>,
    tls: Option<TlsAcceptor>,
    stats: Arc<ListenerStats>,
}

/// A bound listener for one entry point.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    conn_semaphore: Arc<Semaphore>,
    handler: Arc<ConnectionHandler>,
}

impl Listener {
    /// Bind the entry point. `tls` is required for `websecure`.
    pub async fn bind(
        config: ListenerConfig,
        routes: SharedRouteTable,
        health: Arc<HealthTracker>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, ProxyError> {
        let bind_err = |source| ProxyError::Bind {
            addr: config.bind_addr,
            source,
        };
        let listener = TcpListener::bind(config.bind_addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(
            entry_point = %config.entry_point,
            bind_addr = %local_addr,
            tls = tls.is_some(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        let stats = Arc::new(ListenerStats::default());
        stats.serving.store(true, Ordering::Relaxed);

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            local_addr,
            handler: Arc::new(ConnectionHandler {
                config,
                routes,
                health,
                tls,
                stats,
            }),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn entry_point(&self) -> EntryPoint {
        self.handler.config.entry_point
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.handler.stats)
    }

    /// Accept connections until `shutdown` flips to true, then stop
    /// accepting and drain in-flight connections for up to `grace`.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>, grace: Duration) -> ServeReport {
        let Listener {
            listener,
            local_addr,
            conn_semaphore,
            handler,
        } = self;
        let entry_point = handler.config.entry_point;
        let stats = Arc::clone(&handler.stats);
        info!(entry_point = %entry_point, bind_addr = %local_addr, "Listener started");

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            // Brief sleep to avoid tight loop on persistent errors
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    stats.connections_active.fetch_add(1, Ordering::Relaxed);
                    let guard = ActiveGuard(Arc::clone(&stats));
                    let handler = Arc::clone(&handler);

                    tasks.spawn(
                        async move {
                            if let Err(e) = handler.handle(stream, peer).await {
                                debug!(error = %e, "Connection error");
                            }
                            drop(guard);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer,
                            entry_point = %entry_point
                        )),
                    );
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        stats.serving.store(false, Ordering::Relaxed);

        let in_flight = tasks.len();
        info!(
            entry_point = %entry_point,
            in_flight,
            grace_ms = grace.as_millis() as u64,
            "Listener closed; draining connections"
        );

        let drained_in_time = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let forced = if drained_in_time {
            0
        } else {
            let remaining = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            warn!(entry_point = %entry_point, forced = remaining, "Grace period elapsed; connections closed");
            remaining
        };

        let report = ServeReport {
            drained: in_flight - forced,
            forced,
        };
        info!(
            entry_point = %entry_point,
            drained = report.drained,
            forced = report.forced,
            "Listener stopped"
        );
        report
    }
}

impl ConnectionHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let mut ctx = ConnectionContext::new(peer, self.config.entry_point);
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some(acceptor) => {
                let tls = tokio::time::timeout(self.config.header_timeout, acceptor.accept(stream))
                    .await
                    .map_err(|_| ProxyError::Tls("handshake timed out".to_string()))?
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                ctx.sni = tls.get_ref().1.server_name().map(str::to_string);
                debug!(sni = ?ctx.sni, "TLS handshake complete");
                self.dispatch(tls, ctx).await
            }
            None => self.dispatch(stream, ctx).await,
        }
    }

    async fn dispatch<S>(&self, mut client: S, mut ctx: ConnectionContext) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = read_request_head(
            &mut client,
            self.config.max_header_bytes,
            self.config.header_timeout,
        )
        .await;

        let (head, buffered) = match head {
            Ok(parsed) => parsed,
            Err(e) => {
                let response = match &e {
                    HeadError::Malformed(_) => Some(simple_response(400, "Bad Request", "bad request\n")),
                    HeadError::TooLarge(_) => Some(simple_response(
                        431,
                        "Request Header Fields Too Large",
                        "request header too large\n",
                    )),
                    HeadError::Timeout => Some(simple_response(408, "Request Timeout", "request timeout\n")),
                    HeadError::Closed | HeadError::Io(_) => None,
                };
                debug!(error = %e, "Rejecting connection before routing");
                ctx.advance(ConnectionState::Rejected);
                if let Some(response) = response {
                    respond(&mut client, &response).await;
                }
                ctx.advance(ConnectionState::Closed);
                return Ok(());
            }
        };
        ctx.advance(ConnectionState::HeaderParsed);

        let Some(hostname) = head.hostname().filter(|h| is_routable_host(h)) else {
            self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
            debug!(host = ?head.host, "Missing or malformed Host header");
            return self
                .reject(&mut client, &mut ctx, simple_response(400, "Bad Request", "missing or invalid Host header\n"))
                .await;
        };
        ctx.host = Some(hostname.clone());

        if let Some(sni) = &ctx.sni {
            if !sni.eq_ignore_ascii_case(&hostname) {
                debug!(sni = %sni, host = %hostname, "SNI and Host differ; routing by Host");
            }
        }

        let Some(route) = self.routes.resolve(&hostname, ctx.entry_point) else {
            self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
            debug!(host = %hostname, "No route");
            return self
                .reject(&mut client, &mut ctx, simple_response(404, "Not Found", "no route for host\n"))
                .await;
        };
        self.stats.routes_matched.fetch_add(1, Ordering::Relaxed);
        ctx.route = Some(route.clone());
        ctx.advance(ConnectionState::Resolved);

        if let Some(https_port) = self.config.redirect_https_port {
            if ctx.entry_point == EntryPoint::Web && route.tls_enabled {
                let location = https_location(&hostname, https_port, &head.path);
                debug!(location = %location, "Redirecting to HTTPS");
                return self
                    .reject(&mut client, &mut ctx, redirect_response(&location))
                    .await;
            }
        }

        let mut backend = match self.connect(route.target).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                let threshold = self.health.record_failure(route.target);
                warn!(
                    service_id = %route.service_id,
                    error = %e,
                    failures = self.health.failures(route.target),
                    threshold_reached = threshold,
                    "Backend connection failed"
                );
                return self
                    .reject(&mut client, &mut ctx, simple_response(502, "Bad Gateway", "backend unavailable\n"))
                    .await;
            }
        };
        self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
        self.health.record_success(route.target);

        debug!(
            service_id = %route.service_id,
            target = %route.target,
            pattern = %route.host,
            "Forwarding"
        );
        ctx.advance(ConnectionState::Forwarding);

        let proto = if self.tls.is_some() { "https" } else { "http" };
        let mut first = head.forwarded(ctx.peer.ip(), proto);
        first.extend_from_slice(&buffered[head.header_len..]);
        backend.write_all(&first).await?;

        let (bytes_to_backend, bytes_from_backend) =
            proxy_bidirectional(client, backend, self.config.idle_timeout).await;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);
        ctx.advance(ConnectionState::Closed);

        debug!(
            bytes_to_backend = bytes_to_backend,
            bytes_from_backend = bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }

    async fn connect(&self, target: SocketAddr) -> Result<TcpStream, ProxyError> {
        let unreachable = |source| ProxyError::BackendUnreachable { target, source };
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| unreachable(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(unreachable)?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn reject<S>(
        &self,
        client: &mut S,
        ctx: &mut ConnectionContext,
        response: Vec<u8>,
    ) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin,
    {
        ctx.advance(ConnectionState::Rejected);
        respond(client, &response).await;
        ctx.advance(ConnectionState::Closed);
        Ok(())
    }
}

async fn respond<S>(client: &mut S, response: &[u8])
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = client.write_all(response).await {
        debug!(error = %e, "Failed to write response");
        return;
    }
    let _ = client.shutdown().await;
}

fn https_location(hostname: &str, port: u16, path: &str) -> String {
    if port == 443 {
        format!("https://{hostname}{path}")
    } else {
        format!("https://{hostname}:{port}{path}")
    }
}

/// Last time either direction of a relay moved bytes.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Resolves once no bytes have moved in either direction for `timeout`.
async fn idle_watchdog(activity: &Activity, timeout: Duration) {
    loop {
        let idle = activity.idle();
        if idle >= timeout {
            return;
        }
        tokio::time::sleep(timeout - idle).await;
    }
}

/// Proxy data bidirectionally between two streams until both directions
/// reach EOF or the relay has been idle for `idle_timeout`.
///
/// Returns (bytes_to_b, bytes_from_b), including bytes moved before an
/// error or timeout.
async fn proxy_bidirectional<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let activity = Activity::new();
    let to_b = AtomicU64::new(0);
    let from_b = AtomicU64::new(0);

    let relay = async {
        let (a_result, b_result) = tokio::join!(
            copy_half(&mut a_read, &mut b_write, &activity, &to_b),
            copy_half(&mut b_read, &mut a_write, &activity, &from_b),
        );
        if let Err(e) = a_result.and(b_result) {
            debug!(error = %e, "Relay ended with error");
        }
    };

    match idle_timeout {
        Some(timeout) => {
            tokio::select! {
                _ = relay => {}
                _ = idle_watchdog(&activity, timeout) => {
                    debug!(idle_ms = timeout.as_millis() as u64, "Idle timeout; closing relay");
                }
            }
        }
        None => relay.await,
    }

    (to_b.load(Ordering::Relaxed), from_b.load(Ordering::Relaxed))
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    total: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
    writer.shutdown().await
}
