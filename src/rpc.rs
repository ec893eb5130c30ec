//! # RPC Caller
//!
//! Typed JSON-RPC 2.0 requests against schedulers and edges, carried over
//! the shared HTTP/3 transport.
//!
//! ## Method map
//!
//! | Target | Method | Purpose |
//! |--------|--------|---------|
//! | scheduler base | `titan.GetUserAccessPoint` | region scheduler list |
//! | scheduler | `titan.GetCandidateURLsForDetectNat` | NAT probe reflectors |
//! | scheduler | `titan.GetExternalAddress` | observed public mapping |
//! | scheduler | `titan.CheckNetworkConnectivity` | reverse probe request |
//! | scheduler | `titan.NatPunch` | edge-initiated hole punch |
//! | scheduler base | `titan.EdgeDownloadInfos` | edges holding a CID |
//! | scheduler | `titan.SubmitUserWorkloadReport` | bind a pushed report |
//! | edge | `titan.Version` | liveness probe through a candidate transport |
//!
//! URLs received from the wire (scheduler URLs in download-info lists,
//! candidate URLs) are already full RPC endpoints and are used verbatim;
//! only the configured base address is normalized locally.
//!
//! A successful response has `error == null`; anything else fails the call.
//! Response bodies are bounded before parsing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::messages::{
    deserialize_bounded, AccessPoint, EdgeDownloadInfoList, NatPunchReq, ReaderStream, RpcRequest,
    RpcResponse,
};
use crate::nat::Host;
use crate::protocols::ProbeRpc;
use crate::transport::{EdgeTransport, HttpConnector, TransportError, TransportResult};

/// JSON-RPC caller bound to the shared connector.
#[derive(Clone)]
pub struct RpcCaller {
    connector: Arc<HttpConnector>,
    bearer: Option<String>,
    timeout: Duration,
}

impl RpcCaller {
    pub fn new(connector: Arc<HttpConnector>, bearer: Option<String>, timeout: Duration) -> Self {
        Self {
            connector,
            bearer,
            timeout,
        }
    }

    pub fn connector(&self) -> &Arc<HttpConnector> {
        &self.connector
    }

    fn build_request(&self, url: &str) -> TransportResult<Request<()>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header("content-type", "application/json");
        if let Some(token) = &self.bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder
            .body(())
            .map_err(|e| TransportError(format!("invalid rpc url {}: {}", url, e)))
    }

    /// One JSON-RPC round-trip through the shared transport.
    async fn call_raw<R: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> TransportResult<R> {
        let transport = EdgeTransport::Shared;
        self.call_via_transport(&transport, url, method, params)
            .await
    }

    /// Same round-trip, but through a caller-chosen transport. Admission uses
    /// this to probe an edge over the exact connection it is about to pin.
    async fn call_via_transport<R: DeserializeOwned>(
        &self,
        transport: &EdgeTransport,
        url: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> TransportResult<R> {
        let body = serde_json::to_vec(&RpcRequest::new(method, params))
            .map_err(|e| TransportError(format!("serialize {} params: {}", method, e)))?;
        let req = self.build_request(url)?;

        debug!(url, method, "rpc call");
        let resp = tokio::time::timeout(
            self.timeout,
            transport.request(&self.connector, req, Some(Bytes::from(body))),
        )
        .await
        .map_err(|_| TransportError(format!("{} timed out", method)))??;

        if !resp.is_success() {
            return Err(TransportError(format!(
                "{} returned HTTP {}",
                method, resp.status
            )));
        }

        let envelope: RpcResponse = deserialize_bounded(&resp.body)
            .map_err(|e| TransportError(format!("{}: {}", method, e)))?;

        if let Some(err) = envelope.error {
            return Err(TransportError(format!(
                "{} rejected: {} (code {})",
                method, err.message, err.code
            )));
        }

        let raw = envelope
            .result
            .map(|r| r.get().to_string())
            .unwrap_or_else(|| "null".to_string());
        serde_json::from_str(&raw)
            .map_err(|e| TransportError(format!("{} result malformed: {}", method, e)))
    }

    // ------------------------------------------------------------------
    // Typed scheduler methods
    // ------------------------------------------------------------------

    /// Scheduler URLs serving the caller's region.
    pub async fn access_point(&self, base_rpc_url: &str) -> Result<AccessPoint> {
        self.call_raw(base_rpc_url, "titan.GetUserAccessPoint", Some(json!([""])))
            .await
            .map_err(|e| Error::discovery(e.to_string()))
    }

    /// Edges holding pieces of `cid`, grouped by advertising scheduler.
    pub async fn edge_download_infos(
        &self,
        base_rpc_url: &str,
        cid: &str,
    ) -> Result<Vec<EdgeDownloadInfoList>> {
        self.call_raw(base_rpc_url, "titan.EdgeDownloadInfos", Some(json!([cid])))
            .await
            .map_err(|e| Error::discovery(e.to_string()))
    }

    /// Ask a scheduler to make an edge open a connection toward us.
    pub async fn nat_punch(&self, scheduler_url: &str, req: &NatPunchReq) -> Result<()> {
        let params = serde_json::to_value(req)
            .map_err(|e| Error::admission(format!("encode punch request: {}", e)))?;
        self.call_raw::<serde_json::Value>(scheduler_url, "titan.NatPunch", Some(json!([params])))
            .await
            .map(|_| ())
            .map_err(|e| Error::admission(e.to_string()))
    }

    /// Liveness probe through a candidate edge transport.
    pub async fn version(&self, transport: &EdgeTransport, edge_addr: &str) -> Result<()> {
        let url = format!("https://{}/rpc/v0", edge_addr);
        self.call_via_transport::<serde_json::Value>(transport, &url, "titan.Version", None)
            .await
            .map(|_| ())
            .map_err(|e| Error::admission(e.to_string()))
    }

    /// Bind a previously pushed report stream to a scheduler submission.
    pub async fn submit_workload_report(
        &self,
        scheduler_url: &str,
        stream: &ReaderStream,
    ) -> Result<()> {
        let params = serde_json::to_value(stream)
            .map_err(|e| Error::submit(format!("encode reader stream: {}", e)))?;
        self.call_raw::<serde_json::Value>(
            scheduler_url,
            "titan.SubmitUserWorkloadReport",
            Some(json!([params])),
        )
        .await
        .map(|_| ())
        .map_err(|e| Error::submit(e.to_string()))
    }
}

#[async_trait]
impl ProbeRpc for RpcCaller {
    async fn candidate_urls(&self, scheduler_url: &str) -> Result<Vec<String>> {
        self.call_raw(scheduler_url, "titan.GetCandidateURLsForDetectNat", None)
            .await
            .map_err(|e| Error::nat(e.to_string()))
    }

    async fn external_address(&self, candidate_url: &str) -> Result<Host> {
        let observed: String = self
            .call_raw(candidate_url, "titan.GetExternalAddress", Some(json!([])))
            .await
            .map_err(|e| Error::nat(e.to_string()))?;
        Host::parse(&observed)
            .ok_or_else(|| Error::nat(format!("invalid external address: {}", observed)))
    }

    async fn request_probe(
        &self,
        candidate_url: &str,
        network: &str,
        public_addr: &str,
    ) -> Result<()> {
        let probe_url = format!("https://{}/ping", public_addr);
        self.call_raw::<serde_json::Value>(
            candidate_url,
            "titan.CheckNetworkConnectivity",
            Some(json!([network, probe_url])),
        )
        .await
        .map(|_| ())
        .map_err(|e| Error::nat(e.to_string()))
    }
}
