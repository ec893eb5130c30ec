//! # Shared UDP Transport Layer
//!
//! One UDP socket backs a single QUIC endpoint carrying two roles:
//!
//! ```text
//! ┌───────────────┐
//! │ HttpConnector │──────► quinn Endpoint (one socket)
//! └───────┬───────┘
//!         │
//!    ┌────┴─────┐
//!    │          │
//!    ▼          ▼
//! inbound    outbound
//! HTTP/3     HTTP/3
//! /ping      pooled + pinned
//! ```
//!
//! The dual role is what makes hole punching work: the socket a remote edge
//! probes after a `NatPunch` request is the same socket our outbound dials
//! originate from, so the punched mapping serves both directions.
//!
//! ## Connection management
//!
//! - Outbound connections are pooled per authority in a bounded LRU
//! - Closed connections are evicted on lookup; request failures invalidate
//! - Hole-punched paths get a *pinned* connection that bypasses the pool,
//!   so requests to that edge always ride the punched mapping
//!
//! A small TCP listener answers on the same port so coordinators can run the
//! TCP leg of the connectivity probe against our public address.

use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{Request, Response, StatusCode};
use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::crypto;
use crate::error::{Error, Result};

/// Timeout for dialing peers and coordinators.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum pooled outbound connections.
/// The pool only ever holds a handful of schedulers and open edges; the
/// bound is a backstop against authority churn.
const MAX_POOLED_CONNECTIONS: usize = 64;

/// Body bytes accepted on the inbound `/ping` path before answering.
const MAX_INBOUND_HEAD: usize = 1024;

type SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// Transport-level failure. Call sites map this into the error kind of the
/// pipeline stage they serve.
#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A decoded HTTP/3 response with the body fully drained.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// An established HTTP/3 connection to one peer. Cloning shares the
/// underlying QUIC connection.
#[derive(Clone)]
pub struct Http3Conn {
    send: SendRequest,
    conn: quinn::Connection,
}

impl Http3Conn {
    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub async fn request(
        &self,
        req: Request<()>,
        body: Option<Bytes>,
    ) -> TransportResult<HttpResponse> {
        send_via(self.send.clone(), req, body).await
    }
}

/// HTTP transport bound to an admitted edge: either the shared pooled
/// connector or a pinned hole-punched connection.
#[derive(Clone)]
pub enum EdgeTransport {
    Shared,
    Pinned(Http3Conn),
}

impl EdgeTransport {
    pub async fn request(
        &self,
        connector: &HttpConnector,
        req: Request<()>,
        body: Option<Bytes>,
    ) -> TransportResult<HttpResponse> {
        match self {
            EdgeTransport::Shared => connector.request(req, body).await,
            EdgeTransport::Pinned(conn) => conn.request(req, body).await,
        }
    }
}

/// The shared endpoint: HTTP/3 client pool on the outbound side, `/ping`
/// responder on the inbound side, one UDP socket underneath.
pub struct HttpConnector {
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    pool: Mutex<LruCache<String, Http3Conn>>,
    local_addr: SocketAddr,
}

impl HttpConnector {
    /// Bind the shared socket, start the inbound HTTP/3 server role and the
    /// TCP probe responder, and return the connector.
    pub async fn bind(listen: SocketAddr) -> Result<Arc<Self>> {
        let (certs, key) = crypto::generate_server_cert()?;
        let server_config = crypto::create_server_config(certs, key)?;

        let endpoint = quinn::Endpoint::server(server_config, listen)
            .map_err(|e| Error::config(format!("failed to bind UDP {}: {}", listen, e)))?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| Error::config(format!("local address unavailable: {}", e)))?;

        let client_config = crypto::create_client_config()?;

        let pool_cap = NonZeroUsize::new(MAX_POOLED_CONNECTIONS)
            .expect("MAX_POOLED_CONNECTIONS must be non-zero");

        let connector = Arc::new(Self {
            endpoint,
            client_config,
            pool: Mutex::new(LruCache::new(pool_cap)),
            local_addr,
        });

        connector.spawn_server_role();
        spawn_tcp_probe_responder(local_addr).await;

        debug!(addr = %local_addr, "shared endpoint bound");
        Ok(connector)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Issue a request through the pooled client role. The connection is
    /// established on first use per authority and evicted on failure.
    pub async fn request(
        &self,
        req: Request<()>,
        body: Option<Bytes>,
    ) -> TransportResult<HttpResponse> {
        let uri = req.uri();
        let authority = uri
            .authority()
            .ok_or_else(|| TransportError::new(format!("request uri has no authority: {}", uri)))?
            .to_string();
        let host = uri.host().unwrap_or_default().to_string();

        let conn = self.get_or_connect(&authority, &host).await?;
        match send_via(conn.send.clone(), req, body).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.invalidate(&authority).await;
                Err(e)
            }
        }
    }

    /// Dial a fresh QUIC connection from the shared socket to `addr`
    /// (`host:port`) and complete the HTTP/3 handshake. Used for pinned
    /// transports after a punch; the pool is bypassed.
    pub async fn dial_direct(&self, addr: &str) -> TransportResult<Http3Conn> {
        let socket_addr = resolve(addr).await?;
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), socket_addr, "localhost")
            .map_err(|e| TransportError::new(format!("connect to {} failed: {}", addr, e)))?;

        let conn = tokio::time::timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| TransportError::new(format!("dial to {} timed out", addr)))?
            .map_err(|e| TransportError::new(format!("handshake with {} failed: {}", addr, e)))?;

        handshake(conn).await
    }

    async fn get_or_connect(&self, authority: &str, host: &str) -> TransportResult<Http3Conn> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(conn) = pool.get(authority) {
                if conn.is_closed() {
                    debug!(authority, "pooled connection is closed, evicting");
                    pool.pop(authority);
                } else {
                    return Ok(conn.clone());
                }
            }
        }

        let socket_addr = resolve(authority).await?;
        let server_name = if host.is_empty() { "localhost" } else { host };
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), socket_addr, server_name)
            .map_err(|e| TransportError::new(format!("connect to {} failed: {}", authority, e)))?;

        let conn = tokio::time::timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| TransportError::new(format!("dial to {} timed out", authority)))?
            .map_err(|e| {
                TransportError::new(format!("handshake with {} failed: {}", authority, e))
            })?;

        let h3_conn = handshake(conn).await?;

        let mut pool = self.pool.lock().await;
        pool.put(authority.to_string(), h3_conn.clone());
        Ok(h3_conn)
    }

    async fn invalidate(&self, authority: &str) {
        let mut pool = self.pool.lock().await;
        if pool.pop(authority).is_some() {
            debug!(authority, "invalidated pooled connection after failure");
        }
    }

    fn spawn_server_role(self: &Arc<Self>) {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            if let Err(e) = serve_connection(conn).await {
                                debug!(error = %e, "inbound connection ended");
                            }
                        }
                        Err(e) => debug!(error = %e, "inbound handshake failed"),
                    }
                });
            }
        });
    }
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Complete the client-side HTTP/3 handshake over an established QUIC
/// connection and spawn its driver.
async fn handshake(conn: quinn::Connection) -> TransportResult<Http3Conn> {
    let (mut driver, send) = h3::client::new(h3_quinn::Connection::new(conn.clone()))
        .await
        .map_err(|e| TransportError::new(format!("h3 handshake failed: {}", e)))?;

    tokio::spawn(async move {
        let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    Ok(Http3Conn { send, conn })
}

/// Send one request and drain the response body.
async fn send_via(
    mut send: SendRequest,
    req: Request<()>,
    body: Option<Bytes>,
) -> TransportResult<HttpResponse> {
    let mut stream = send
        .send_request(req)
        .await
        .map_err(|e| TransportError::new(format!("send request failed: {}", e)))?;

    if let Some(body) = body {
        if !body.is_empty() {
            stream
                .send_data(body)
                .await
                .map_err(|e| TransportError::new(format!("send body failed: {}", e)))?;
        }
    }
    stream
        .finish()
        .await
        .map_err(|e| TransportError::new(format!("finish request failed: {}", e)))?;

    let resp = stream
        .recv_response()
        .await
        .map_err(|e| TransportError::new(format!("receive response failed: {}", e)))?;
    let status = resp.status();
    let headers = resp.headers().clone();

    let mut buf = BytesMut::new();
    loop {
        match stream.recv_data().await {
            Ok(Some(mut chunk)) => {
                let n = chunk.remaining();
                buf.extend_from_slice(&chunk.copy_to_bytes(n));
            }
            Ok(None) => break,
            Err(e) => {
                return Err(TransportError::new(format!("receive body failed: {}", e)));
            }
        }
    }

    Ok(HttpResponse {
        status,
        headers,
        body: buf.freeze(),
    })
}

/// Resolve `host:port` (or an authority, defaulting to 443) to a socket
/// address.
async fn resolve(authority: &str) -> TransportResult<SocketAddr> {
    if let Ok(addr) = authority.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let target = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:443", authority)
    };
    let mut addrs = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|e| TransportError::new(format!("resolve {} failed: {}", authority, e)))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::new(format!("no address for {}", authority)))
}

// ============================================================================
// Inbound server role
// ============================================================================

async fn serve_connection(conn: quinn::Connection) -> TransportResult<()> {
    let remote = conn.remote_address();
    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
        h3::server::Connection::new(h3_quinn::Connection::new(conn))
            .await
            .map_err(|e| TransportError::new(format!("h3 accept failed: {}", e)))?;

    loop {
        match h3_conn.accept().await {
            Ok(Some((req, stream))) => {
                debug!(remote = %remote, path = %req.uri().path(), "inbound request");
                tokio::spawn(async move {
                    if let Err(e) = answer(req, stream).await {
                        debug!(error = %e, "inbound stream error");
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!(remote = %remote, error = %e, "inbound connection closed");
                break;
            }
        }
    }

    Ok(())
}

/// The only inbound surface: `/ping` answers `pong` so remote peers can
/// verify their punch packets landed on our public mapping.
async fn answer(
    req: Request<()>,
    mut stream: h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
) -> TransportResult<()> {
    let (status, body) = if req.uri().path() == "/ping" {
        (StatusCode::OK, Bytes::from_static(b"pong"))
    } else {
        (StatusCode::NOT_FOUND, Bytes::new())
    };

    let resp = Response::builder()
        .status(status)
        .body(())
        .map_err(|e| TransportError::new(format!("build response: {}", e)))?;

    stream
        .send_response(resp)
        .await
        .map_err(|e| TransportError::new(format!("send response: {}", e)))?;
    if !body.is_empty() {
        stream
            .send_data(body)
            .await
            .map_err(|e| TransportError::new(format!("send body: {}", e)))?;
    }
    stream
        .finish()
        .await
        .map_err(|e| TransportError::new(format!("finish response: {}", e)))?;

    Ok(())
}

/// Accept TCP connections on the same port and answer with a plain HTTP
/// `pong`, so the coordinator's TCP connectivity probe has something to hit.
async fn spawn_tcp_probe_responder(addr: SocketAddr) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(addr = %addr, error = %e, "TCP probe responder unavailable");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            let (mut socket, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "TCP accept failed");
                    continue;
                }
            };
            tokio::spawn(async move {
                debug!(remote = %remote, "TCP probe connection");
                let mut head = vec![0u8; MAX_INBOUND_HEAD];
                let _ = socket.read(&mut head).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\npong")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
}
