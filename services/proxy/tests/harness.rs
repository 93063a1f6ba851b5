//! Test harness for proxy integration tests.
//!
//! Provides helpers to spawn HTTP backends and a proxy fed by a channel
//! source, plus raw HTTP and TLS clients.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;

use hostgate_proxy::discovery::{ChannelSource, DiscoveryEvent, ServiceDescriptor};
use hostgate_proxy::{AppContext, Config, EntryPoint, Proxy};

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// HTTP backend that answers every request with its marker.
pub struct HttpBackend {
    pub addr: SocketAddr,
    pub marker: String,
    pub requests: Arc<AtomicU64>,
    last_head: Arc<Mutex<Option<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HttpBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        Self::spawn_with_delay(marker, Duration::ZERO).await
    }

    /// Like [`HttpBackend::spawn`], but waits `delay` before responding.
    pub async fn spawn_with_delay(marker: &str, delay: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicU64::new(0));
        let last_head = Arc::new(Mutex::new(None));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let requests_clone = Arc::clone(&requests);
        let head_clone = Arc::clone(&last_head);
        let body = marker.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        let requests = Arc::clone(&requests_clone);
                        let last_head = Arc::clone(&head_clone);
                        let body = body.clone();
                        tokio::spawn(async move {
                            let Ok(head) = read_head(&mut stream).await else { return };
                            requests.fetch_add(1, Ordering::Relaxed);
                            *last_head.lock().unwrap() = Some(head);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = stream.write_all(response.as_bytes()).await;
                            let _ = stream.shutdown().await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            marker: marker.to_string(),
            requests,
            last_head,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Request head of the most recent request, as received.
    pub fn last_head(&self) -> Option<String> {
        self.last_head.lock().unwrap().clone()
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Backend that streams `chunks` lines, one per `interval`, and records
/// whether the proxy closed its side before the stream finished.
pub struct StreamingBackend {
    pub addr: SocketAddr,
    eof_mid_stream: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl StreamingBackend {
    pub async fn spawn(chunks: usize, interval: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let eof_mid_stream = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let eof_flag = Arc::clone(&eof_mid_stream);
        let done_flag = Arc::clone(&finished);
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            if read_head(&mut stream).await.is_err() {
                return;
            }
            if stream
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }

            let (mut reader, mut writer) = stream.into_split();
            let mut scratch = [0u8; 64];
            let mut sent = 0;
            let mut peer_open = true;
            while sent < chunks {
                tokio::select! {
                    read = reader.read(&mut scratch), if peer_open => {
                        if matches!(read, Ok(0) | Err(_)) {
                            eof_flag.store(true, Ordering::SeqCst);
                            peer_open = false;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        if writer.write_all(b"tick\n").await.is_err() {
                            return;
                        }
                        sent += 1;
                    }
                }
            }
            done_flag.store(true, Ordering::SeqCst);
            let _ = writer.shutdown().await;
        });

        Ok(Self {
            addr,
            eof_mid_stream,
            finished,
        })
    }

    /// The proxy closed the backend connection while chunks were still due.
    pub fn saw_eof_mid_stream(&self) -> bool {
        self.eof_mid_stream.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(String::from_utf8_lossy(&buf[..end + 4]).into_owned());
        }
    }
}

/// A started proxy fed by a channel source.
pub struct ProxyHandle {
    pub proxy: Arc<Proxy>,
    pub web_addr: SocketAddr,
    pub websecure_addr: Option<SocketAddr>,
    pub events: mpsc::Sender<DiscoveryEvent>,
    pub cert_dir: tempfile::TempDir,
}

impl ProxyHandle {
    /// Plain HTTP only.
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(|config| config.websecure_enabled = false).await
    }

    /// Both entry points, with a throwaway certificate directory.
    pub async fn spawn_tls(domains: &[&str]) -> io::Result<Self> {
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        Self::spawn_with(move |config| config.domains = domains).await
    }

    pub async fn spawn_with(customize: impl FnOnce(&mut Config)) -> io::Result<Self> {
        let cert_dir = tempfile::tempdir()?;
        let mut config = Config {
            web_addr: "127.0.0.1:0".parse().unwrap(),
            websecure_addr: "127.0.0.1:0".parse().unwrap(),
            admin_addr: None,
            cert_dir: cert_dir.path().to_path_buf(),
            connect_timeout: Duration::from_millis(500),
            header_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(500),
            ..Config::default()
        };
        config.health.enabled = false;
        customize(&mut config);

        let (source, events) = ChannelSource::new();
        let proxy = Arc::new(Proxy::new(AppContext::new(config)).with_discovery(Arc::new(source)));
        let addresses = proxy.start().await.map_err(io::Error::other)?;

        let find = |entry_point| {
            addresses
                .iter()
                .find(|(ep, _)| *ep == entry_point)
                .map(|(_, addr)| *addr)
        };
        let web_addr = find(EntryPoint::Web).ok_or_else(|| io::Error::other("web not bound"))?;
        let websecure_addr = find(EntryPoint::WebSecure);

        Ok(Self {
            proxy,
            web_addr,
            websecure_addr,
            events,
            cert_dir,
        })
    }

    /// Register a service and wait until its routes are live.
    pub async fn register(&self, service: ServiceDescriptor) {
        let service_id = service.service_id.clone();
        self.events
            .send(DiscoveryEvent::Registered(service))
            .await
            .unwrap();
        self.wait_for(|routes| routes.iter().any(|r| r.service_id == service_id))
            .await;
    }

    pub async fn deregister(&self, service_id: &str) {
        let id = service_id.to_string();
        self.events
            .send(DiscoveryEvent::Deregistered {
                service_id: id.clone(),
            })
            .await
            .unwrap();
        self.wait_for(|routes| routes.iter().all(|r| r.service_id != id))
            .await;
    }

    /// Poll the route table until `check` holds, panicking after 5s.
    pub async fn wait_for(&self, check: impl Fn(&[hostgate_proxy::Route]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if check(&self.proxy.routes()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "route table never reached the expected state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// PEM of the local CA.
    pub fn ca_pem(&self) -> String {
        std::fs::read_to_string(self.cert_dir.path().join("ca.pem")).unwrap()
    }
}

/// Service descriptor routing `rule` to `target`.
pub fn service(service_id: &str, rule: &str, target: SocketAddr) -> ServiceDescriptor {
    labeled(
        service_id,
        target,
        &[
            ("traefik.http.routers.app.rule", rule),
            (
                "traefik.http.services.app.loadbalancer.server.port",
                &target.port().to_string(),
            ),
        ],
    )
}

pub fn labeled(service_id: &str, target: SocketAddr, labels: &[(&str, &str)]) -> ServiceDescriptor {
    ServiceDescriptor {
        service_id: service_id.to_string(),
        address: target.ip().to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Status code and body of a response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub head: String,
    pub body: String,
}

pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> io::Result<Response> {
    let stream = TcpStream::connect(addr).await?;
    request(stream, host, path).await
}

/// Send one `GET` over `stream` and read until close.
pub async fn request<S>(mut stream: S, host: &str, path: &str) -> io::Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;
    stream.flush().await?;
    read_response(&mut stream).await
}

pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> io::Result<Response> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw).await?;
    stream.flush().await?;
    read_response(&mut stream).await
}

async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Response> {
    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

    let text = String::from_utf8_lossy(&raw).into_owned();
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no response head"))?;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no status code"))?;

    Ok(Response {
        status,
        head: head.to_string(),
        body: body.to_string(),
    })
}

/// TLS connection that trusts only `ca_pem`.
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    ca_pem: &str,
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        root_store.add(cert?).map_err(io::Error::other)?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}
