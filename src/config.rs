//! Client configuration.
//!
//! Options mirror the deployed client contract: a required scheduler base
//! URL, an optional bearer token, the UDP bind address shared by both QUIC
//! roles, and the range-pipeline tuning knobs. Memory footprint of a download
//! is roughly `concurrency * range_size`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::HttpConnector;

/// Default UDP bind address for the shared endpoint.
pub const DEFAULT_LISTEN_ADDR: &str = ":8863";

/// Default number of in-flight range fetches.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default bytes per range job (2 MiB).
pub const DEFAULT_RANGE_SIZE: u64 = 2 * 1024 * 1024;

/// Default timeout for individual RPC round-trips and peer dials.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// File traversal strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalMode {
    /// Depth-first CAR walk with local decoding. Handled by an external
    /// collaborator; requesting it from this crate is a configuration error.
    Dfs,
    /// Concurrent ranged retrieval; files come back in their original format.
    Range,
}

/// A set of client options.
#[derive(Clone)]
pub struct Config {
    /// Scheduler base URL (required), e.g. `https://locator.example:5000`.
    pub address: String,
    /// Bearer token for scheduler authentication.
    pub token: Option<String>,
    /// UDP bind address, `":8863"` by default.
    pub listen_addr: String,
    pub mode: TraversalMode,
    /// Max in-flight range fetches. Implementations may additionally cap at
    /// the number of reachable edges, never exceeding this value.
    pub concurrency: usize,
    /// Bytes per range job.
    pub range_size: u64,
    /// Per-RPC timeout.
    pub timeout: Duration,
    /// Optional pre-built HTTP/3 transport. When set, the client reuses it
    /// (and its endpoint) instead of binding its own socket.
    pub http_client: Option<Arc<HttpConnector>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: String::new(),
            token: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            mode: TraversalMode::Range,
            concurrency: DEFAULT_CONCURRENCY,
            range_size: DEFAULT_RANGE_SIZE,
            timeout: DEFAULT_TIMEOUT,
            http_client: None,
        }
    }
}

impl Config {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn mode(mut self, mode: TraversalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn range_size(mut self, range_size: u64) -> Self {
        self.range_size = range_size;
        self
    }

    pub fn http_client(mut self, connector: Arc<HttpConnector>) -> Self {
        self.http_client = Some(connector);
        self
    }

    /// Validate the options and resolve the bind address.
    pub fn validate(&self) -> Result<SocketAddr> {
        if self.address.is_empty() {
            return Err(Error::config("scheduler address is empty"));
        }
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.range_size == 0 {
            return Err(Error::config("range size must be non-zero"));
        }
        resolve_listen_addr(&self.listen_addr)
    }

    /// JSON-RPC endpoint derived from the configured base URL.
    pub fn rpc_url(&self) -> String {
        rpc_v0_url(&self.address)
    }
}

/// Append the `/rpc/v0` suffix and normalize websocket schemes, matching the
/// scheduler contract (`ws`/`wss` bases are HTTP in disguise).
pub fn rpc_v0_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else {
        base.to_string()
    };
    if base.ends_with("/rpc/v0") {
        base
    } else {
        format!("{}/rpc/v0", base)
    }
}

/// Parse a listen address, accepting the `":port"` shorthand.
fn resolve_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| Error::config(format!("invalid listen address {:?}: {}", addr, e)))
}
