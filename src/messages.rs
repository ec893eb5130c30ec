//! # Wire Protocol Messages
//!
//! This module defines the serializable types exchanged with schedulers and
//! edge nodes. The control plane speaks JSON-RPC 2.0; the data plane is plain
//! HTTP/3 with the access token serialized into the request body.
//!
//! ## Message groups
//!
//! | Group | Types |
//! |-------|-------|
//! | JSON-RPC envelope | `RpcRequest`, `RpcResponse`, `RpcError` |
//! | Discovery | `AccessPoint`, `EdgeDownloadInfo`, `EdgeDownloadInfoList` |
//! | Admission | `Token`, `Edge`, `NatPunchReq` |
//! | Reporting | `Workload`, `WorkloadReport`, `ReaderStream` |
//!
//! ## Security limits
//!
//! All response bodies are size-bounded before deserialization
//! (`MAX_RESPONSE_SIZE`) to prevent memory exhaustion from a misbehaving
//! coordinator.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::nat::NatType;

/// Maximum size of an RPC response body (1 MiB).
/// SECURITY: Prevents memory exhaustion from oversized responses.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Deserialize a JSON payload with the size bound enforced.
/// SECURITY: Use this instead of raw `serde_json::from_slice` for anything
/// that arrived from the network.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > MAX_RESPONSE_SIZE {
        return Err(Error::discovery(format!(
            "response too large: {} bytes (max {})",
            bytes.len(),
            MAX_RESPONSE_SIZE
        )));
    }
    serde_json::from_slice(bytes)
        .map_err(|e| Error::discovery(format!("malformed response: {}", e)))
}

// ============================================================================
// JSON-RPC 2.0 envelope
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> RpcRequest<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: "1",
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub result: Option<Box<RawValue>>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Discovery
// ============================================================================

/// Region access point: scheduler URLs serving the caller's area.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessPoint {
    #[serde(rename = "AreaID", default)]
    pub area_id: String,
    #[serde(rename = "SchedulerURLs", default)]
    pub scheduler_urls: Vec<String>,
}

/// A single advertised edge holding pieces of the requested file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeDownloadInfo {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Tk")]
    pub token: Token,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "NatType", default)]
    pub nat_type: String,
}

/// Edges advertised by one scheduler, plus that scheduler's reporting key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeDownloadInfoList {
    #[serde(rename = "Infos", default)]
    pub infos: Vec<EdgeDownloadInfo>,
    #[serde(rename = "SchedulerURL")]
    pub scheduler_url: String,
    #[serde(rename = "SchedulerKey")]
    pub scheduler_key: String,
}

// ============================================================================
// Admission
// ============================================================================

/// Read capability for one edge. The payload is encrypted by the scheduler
/// for the edge; the client forwards it verbatim as the request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "CipherText")]
    pub cipher_text: String,
    #[serde(rename = "Sign")]
    pub sign: String,
}

/// An advertised edge after discovery, immutable once built.
#[derive(Clone, Debug)]
pub struct Edge {
    pub node_id: String,
    /// UDP `host:port` the edge's HTTP/3 gateway listens on.
    pub address: String,
    pub token: Token,
    pub declared_nat: NatType,
    pub scheduler_url: String,
    pub scheduler_key: String,
}

impl Edge {
    pub fn from_info(info: EdgeDownloadInfo, list: &EdgeDownloadInfoList) -> Self {
        Self {
            node_id: info.node_id,
            address: info.address,
            token: info.token,
            declared_nat: NatType::from_wire(&info.nat_type),
            scheduler_url: list.scheduler_url.clone(),
            scheduler_key: list.scheduler_key.clone(),
        }
    }

    /// Request payload for `titan.NatPunch`: asks the scheduler to make this
    /// edge initiate a QUIC hello toward the client's public mapping.
    pub fn to_nat_punch_req(&self, timeout_secs: u64) -> NatPunchReq {
        NatPunchReq {
            token: self.token.clone(),
            node_id: self.node_id.clone(),
            timeout: timeout_secs,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NatPunchReq {
    #[serde(rename = "Token")]
    pub token: Token,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "Timeout")]
    pub timeout: u64,
}

// ============================================================================
// Reporting
// ============================================================================

/// Aggregated download measurement for one token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(rename = "StartTime")]
    pub start_time: i64,
    #[serde(rename = "EndTime")]
    pub end_time: i64,
    #[serde(rename = "DownloadSpeed")]
    pub download_speed: i64,
    #[serde(rename = "DownloadSize")]
    pub download_size: i64,
}

/// One entry of the encrypted report list submitted to a scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadReport {
    #[serde(rename = "TokenID")]
    pub token_id: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "Workload")]
    pub workload: Workload,
}

/// Indicates the uuid of a push-stream request bound to a report submission,
/// e.g. `ReaderStream { Type: "push", Info: "<uuid>" }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaderStream {
    #[serde(rename = "Type")]
    pub stream_type: String,
    #[serde(rename = "Info")]
    pub info: String,
}

impl ReaderStream {
    pub fn push(uuid: impl Into<String>) -> Self {
        Self {
            stream_type: "push".to_string(),
            info: uuid.into(),
        }
    }
}
