//! # Client Facade
//!
//! [`Client`] combines the shared endpoint, the RPC caller, NAT discovery,
//! edge admission, the range dispatcher, and the workload ledger into the
//! public retrieval API.
//!
//! ## Lifecycle
//!
//! ```ignore
//! let client = Client::new(Config::new("https://locator.example:5000")).await?;
//! let (size, mut reader) = client.get_file("bafy...").await?;
//! tokio::io::copy(&mut reader, &mut out).await?;
//! // end-of-file flushed the workload reports and cleared the edge table;
//! // the next get_file re-runs discovery and admission.
//! ```
//!
//! The first fetch per lifetime runs the admission phase: discover edges for
//! the CID, classify the local NAT, and build a verified transport per edge.
//! After the reader reaches EOF (or is dropped), accumulated measurements
//! are encrypted per scheduler and submitted, and the reachable table is
//! cleared so a later fetch re-admits from scratch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::admission;
use crate::config::{Config, TraversalMode};
use crate::dispatch::{DispatchOptions, Dispatcher, FileReader};
use crate::error::{Error, Result};
use crate::messages::Edge;
use crate::nat::{self, NatType};
use crate::protocols::{RangeChunk, RangeSource};
use crate::rpc::RpcCaller;
use crate::transport::{EdgeTransport, HttpConnector, HttpResponse};
use crate::workload::{self, Ledger, Measurement};

/// Range-mode fetches ask for raw CAR bytes; the decode happens client-side
/// once the whole file is assembled.
const FORMAT_CAR: &str = "car";

/// Whole-block fetches come back in their original format.
const FORMAT_RAW: &str = "raw";

/// Retrieval client for the Titan network.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: Config,
    connector: Arc<HttpConnector>,
    rpc: RpcCaller,
    state: Mutex<SessionState>,
    ledger: Ledger,
}

/// Mutable per-download state: the reachable-edge table and the round-robin
/// cursor share one lock, the admission gate rides along.
struct SessionState {
    started: bool,
    nat_type: NatType,
    edges: Vec<Edge>,
    transports: HashMap<String, EdgeTransport>,
    counter: u64,
}

impl Client {
    /// Bind the shared endpoint and construct the client.
    pub async fn new(config: Config) -> Result<Self> {
        let listen = config.validate()?;

        let connector = match &config.http_client {
            Some(connector) => connector.clone(),
            None => HttpConnector::bind(listen).await?,
        };

        let rpc = RpcCaller::new(connector.clone(), config.token.clone(), config.timeout);

        // Random seed avoids every fresh client thundering the same edge.
        let counter = rand::thread_rng().gen_range(0..100);

        info!(listen = %connector.local_addr(), "client ready");

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                rpc,
                state: Mutex::new(SessionState {
                    started: false,
                    nat_type: NatType::Unknown,
                    edges: Vec::new(),
                    transports: HashMap::new(),
                    counter,
                }),
                ledger: Ledger::new(),
            }),
        })
    }

    /// Fetch a file by CID as an in-order byte stream.
    ///
    /// Returns the total size and a reader that yields the reassembled
    /// bytes. Errors surface immediately when no edge is reachable or the
    /// priming fetch fails; later fetch failures surface as read errors.
    /// Dropping the reader cancels the download; the workload ledger is
    /// flushed either way.
    pub async fn get_file(&self, cid: &str) -> Result<(u64, FileReader)> {
        match self.inner.config.mode {
            TraversalMode::Range => {}
            TraversalMode::Dfs => {
                return Err(Error::config(
                    "DFS traversal is handled by the DAG service, not this client",
                ));
            }
        }

        self.inner.load_edges(cid).await?;

        let edges = self.inner.reachable_edge_count();
        let opts = DispatchOptions {
            range_size: self.inner.config.range_size,
            concurrency: self.inner.config.concurrency,
            edges,
        };

        Dispatcher::new(self.inner.clone(), cid, opts).run().await
    }

    /// Fetch a single raw block by CID.
    pub async fn get_block(&self, cid: &str) -> Result<Bytes> {
        self.inner.load_edges(cid).await?;

        let (edge, transport) = self.inner.select_edge()?;
        let (resp, _) = self
            .inner
            .timed_edge_get(&edge, &transport, cid, None, FORMAT_RAW)
            .await?;
        Ok(resp.body)
    }

    /// Flush accumulated workload reports and clear the reachable table.
    /// Idempotent; also invoked automatically when a download completes.
    pub async fn end_of_file(&self) {
        self.inner.end_of_file().await;
    }

    /// Number of currently admitted edges.
    pub fn reachable_edge_count(&self) -> usize {
        self.inner.reachable_edge_count()
    }

    /// NAT classification from the last admission phase.
    pub fn nat_type(&self) -> NatType {
        self.inner.state.lock().expect("state poisoned").nat_type
    }

    /// Local address of the shared UDP endpoint.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.inner.connector.local_addr()
    }
}

impl ClientInner {
    /// Run discovery and admission once per download lifetime.
    async fn load_edges(&self, cid: &str) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state poisoned");
            if state.started {
                return Ok(());
            }
            state.started = true;
        }

        match self.discover_and_admit(cid).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave the gate open for the next attempt.
                self.state.lock().expect("state poisoned").started = false;
                Err(e)
            }
        }
    }

    async fn discover_and_admit(&self, cid: &str) -> Result<()> {
        let rpc_url = self.config.rpc_url();

        let lists = self.rpc.edge_download_infos(&rpc_url, cid).await?;
        let mut edges = Vec::new();
        for list in &lists {
            for info in &list.infos {
                let edge = Edge::from_info(info.clone(), list);
                debug!(
                    node = %edge.node_id,
                    addr = %edge.address,
                    nat = %edge.declared_nat,
                    "edge advertised"
                );
                edges.push(edge);
            }
        }
        if edges.is_empty() {
            return Err(Error::discovery(format!("no edge node found for cid {}", cid)));
        }

        let nat_type = self.classify_nat(&rpc_url).await;

        let admitted = admission::filter_accessible(&self.rpc, nat_type, edges).await;
        if admitted.is_empty() {
            return Err(Error::admission("no accessible edges after admission"));
        }
        info!(count = admitted.len(), nat = %nat_type, "edges admitted");

        let mut state = self.state.lock().expect("state poisoned");
        state.nat_type = nat_type;
        for (edge, transport) in admitted {
            state.transports.insert(edge.node_id.clone(), transport);
            state.edges.push(edge);
        }
        Ok(())
    }

    /// Best-effort NAT classification; an unconfirmed probe leaves the
    /// client at `Unknown`, which admission treats conservatively.
    async fn classify_nat(&self, rpc_url: &str) -> NatType {
        let primary = match self.rpc.access_point(rpc_url).await {
            Ok(ap) if !ap.scheduler_urls.is_empty() => {
                debug!(
                    area = %ap.area_id,
                    schedulers = ap.scheduler_urls.len(),
                    "access point resolved"
                );
                ap.scheduler_urls[0].clone()
            }
            Ok(_) => {
                warn!("access point returned no schedulers");
                return NatType::Unknown;
            }
            Err(e) => {
                warn!(error = %e, "access point lookup failed");
                return NatType::Unknown;
            }
        };

        match nat::discover(&self.rpc, &primary).await {
            Ok(nat) => nat,
            Err(e) => {
                warn!(error = %e, "NAT discovery failed");
                NatType::Unknown
            }
        }
    }

    fn reachable_edge_count(&self) -> usize {
        self.state.lock().expect("state poisoned").edges.len()
    }

    /// Round-robin over the reachable set. Counter and table share the lock.
    fn select_edge(&self) -> Result<(Edge, EdgeTransport)> {
        let mut state = self.state.lock().expect("state poisoned");
        if state.edges.is_empty() {
            return Err(Error::fetch("no available node"));
        }
        state.counter = state.counter.wrapping_add(1);
        let edge = state.edges[(state.counter % state.edges.len() as u64) as usize].clone();
        let transport = state
            .transports
            .get(&edge.node_id)
            .cloned()
            .ok_or_else(|| Error::fetch(format!("no transport for edge {}", edge.node_id)))?;
        Ok((edge, transport))
    }

    /// Ranged or whole GET against one edge, with the measurement recorded
    /// on success.
    async fn timed_edge_get(
        &self,
        edge: &Edge,
        transport: &EdgeTransport,
        cid: &str,
        range: Option<(u64, u64)>,
        format: &str,
    ) -> Result<(HttpResponse, u64)> {
        let wall_start = unix_now();
        let clock = Instant::now();

        let resp = self.edge_get(edge, transport, cid, range, format).await?;

        let elapsed = clock.elapsed();
        let total = match resp.header("content-range") {
            Some(value) => parse_content_range_total(value)?,
            None => resp.body.len() as u64,
        };

        // Only successful fetches count toward the ledger.
        self.ledger.record(Measurement {
            token_id: edge.token.id.clone(),
            node_id: edge.node_id.clone(),
            start_time: wall_start,
            end_time: unix_now(),
            elapsed_ns: elapsed.as_nanos().min(i64::MAX as u128) as i64,
            download_size: resp.body.len() as i64,
            scheduler_url: edge.scheduler_url.clone(),
            scheduler_key: edge.scheduler_key.clone(),
        });

        Ok((resp, total))
    }

    async fn edge_get(
        &self,
        edge: &Edge,
        transport: &EdgeTransport,
        cid: &str,
        range: Option<(u64, u64)>,
        format: &str,
    ) -> Result<HttpResponse> {
        let url = format!("https://{}/ipfs/{}?format={}", edge.address, cid, format);
        debug!(node = %edge.node_id, url = %url, ?range, "pull data");

        let mut builder = Request::builder().method(Method::GET).uri(url.as_str());
        if let Some((start, end)) = range {
            builder = builder.header("range", format!("bytes={}-{}", start, end));
        }
        let req = builder
            .body(())
            .map_err(|e| Error::fetch(format!("invalid edge url {}: {}", url, e)))?;

        let body = serde_json::to_vec(&edge.token)
            .map_err(|e| Error::fetch(format!("encode token: {}", e)))?;

        let resp = transport
            .request(&self.connector, req, Some(Bytes::from(body)))
            .await
            .map_err(|e| Error::fetch(e.to_string()))?;

        if !resp.is_success() {
            return Err(Error::fetch(format!(
                "edge {} returned HTTP {}",
                edge.node_id, resp.status
            )));
        }
        Ok(resp)
    }

    async fn end_of_file(&self) {
        if let Err(e) = workload::flush(&self.rpc, &self.ledger).await {
            // The file bytes were already delivered; reporting failures are
            // not the caller's problem.
            warn!(error = %e, "workload report flush failed");
        }

        let mut state = self.state.lock().expect("state poisoned");
        state.started = false;
        state.edges.clear();
        state.transports.clear();
        debug!("reachable edge table cleared");
    }
}

#[async_trait]
impl RangeSource for ClientInner {
    async fn fetch_range(&self, cid: &str, start: u64, end: u64) -> Result<RangeChunk> {
        let (edge, transport) = self.select_edge()?;
        let (resp, total) = self
            .timed_edge_get(&edge, &transport, cid, Some((start, end)), FORMAT_CAR)
            .await?;
        Ok(RangeChunk {
            total,
            data: resp.body,
        })
    }

    async fn end_of_file(&self) {
        ClientInner::end_of_file(self).await;
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse the total from `Content-Range: bytes <s>-<e>/<total>`.
fn parse_content_range_total(value: &str) -> Result<u64> {
    let (_, total) = value
        .rsplit_once('/')
        .ok_or_else(|| Error::fetch(format!("invalid content range: {}", value)))?;
    total
        .trim()
        .parse()
        .map_err(|_| Error::fetch(format!("invalid content range: {}", value)))
}
