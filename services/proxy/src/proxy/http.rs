//! HTTP/1.x request head handling.
//!
//! Only the first request head of a connection is inspected: it decides the
//! route, gets forwarding headers added, and is replayed to the backend.
//! Everything after it is relayed untouched.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::registry::{is_valid_hostname, normalize_hostname};

/// Max headers accepted in one request head.
pub const MAX_HEADERS: usize = 64;

/// Default bound for a request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

const FORWARDED_HEADERS: [&str; 3] = ["x-forwarded-for", "x-forwarded-proto", "x-forwarded-host"];

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request head: {0}")]
    Malformed(String),

    #[error("connection closed before a complete request head")]
    Closed,

    #[error("timed out waiting for request head")]
    Timeout,

    #[error("I/O error reading request head: {0}")]
    Io(#[from] io::Error),
}

/// Parsed first request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    /// Host header with port, if present.
    pub host: Option<String>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Length of the head in the read buffer, terminator included.
    pub header_len: usize,
}

impl RequestHead {
    /// Normalized hostname from the Host header.
    pub fn hostname(&self) -> Option<String> {
        self.host.as_deref().map(normalize_hostname)
    }

    /// Serialize the head with `X-Forwarded-*` headers added.
    ///
    /// An existing `X-Forwarded-For` chain is extended with the peer.
    pub fn forwarded(&self, peer: IpAddr, proto: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len + 128);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.path, self.version).as_bytes(),
        );

        let mut forwarded_for: Option<Vec<u8>> = None;
        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if lower == "x-forwarded-for" {
                let chain = forwarded_for.get_or_insert_with(Vec::new);
                if !chain.is_empty() {
                    chain.extend_from_slice(b", ");
                }
                chain.extend_from_slice(value);
                continue;
            }
            if FORWARDED_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }

        let mut chain = forwarded_for.unwrap_or_default();
        if !chain.is_empty() {
            chain.extend_from_slice(b", ");
        }
        chain.extend_from_slice(peer.to_string().as_bytes());

        out.extend_from_slice(b"X-Forwarded-For: ");
        out.extend_from_slice(&chain);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(format!("X-Forwarded-Proto: {proto}\r\n").as_bytes());
        if let Some(host) = &self.host {
            out.extend_from_slice(format!("X-Forwarded-Host: {host}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Parse a request head from `buf`. `Ok(None)` means more bytes are needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    };

    let mut host = None;
    let mut parsed = Vec::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            if host.is_some() {
                return Err(HeadError::Malformed("multiple Host headers".to_string()));
            }
            let value = std::str::from_utf8(header.value)
                .map_err(|_| HeadError::Malformed("Host header is not UTF-8".to_string()))?;
            host = Some(value.trim().to_string());
        }
        parsed.push((header.name.to_string(), header.value.to_vec()));
    }

    Ok(Some(RequestHead {
        method: req.method.unwrap_or("GET").to_string(),
        path: req.path.unwrap_or("/").to_string(),
        version: req.version.unwrap_or(1),
        host,
        headers: parsed,
        header_len,
    }))
}

/// Read until a complete request head is buffered.
///
/// Returns the head and every byte read so far, which may extend past the
/// head into the request body.
pub async fn read_request_head<R>(
    stream: &mut R,
    max_bytes: usize,
    timeout: Duration,
) -> Result<(RequestHead, Vec<u8>), HeadError>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(HeadError::Closed);
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(head) = parse_head(&buf)? {
                return Ok((head, buf));
            }
            if buf.len() >= max_bytes {
                return Err(HeadError::TooLarge(max_bytes));
            }
        }
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| HeadError::Timeout)?
}

/// Check the Host value is something a route could match.
pub fn is_routable_host(hostname: &str) -> bool {
    is_valid_hostname(hostname) || (hostname.starts_with('[') && hostname.ends_with(']'))
}

/// A minimal plain-text response that closes the connection.
pub fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

/// `308 Permanent Redirect` to `location`.
pub fn redirect_response(location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 308 Permanent Redirect\r\n\
         Location: {location}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}
