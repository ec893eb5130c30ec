//! Protocol trait definitions.
//!
//! These traits are the seams between the pipeline stages and the network:
//! the NAT prober talks to candidates through [`ProbeRpc`], and the range
//! dispatcher pulls bytes through [`RangeSource`]. The production
//! implementations live on the RPC caller and the client; tests substitute
//! in-memory fakes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::nat::Host;

/// Coordinator-side NAT probe operations.
#[async_trait]
pub trait ProbeRpc: Send + Sync {
    /// `titan.GetCandidateURLsForDetectNat`: candidate reflector URLs known
    /// to a scheduler.
    async fn candidate_urls(&self, scheduler_url: &str) -> Result<Vec<String>>;

    /// `titan.GetExternalAddress`: the public `ip:port` the candidate
    /// observed for our UDP socket.
    async fn external_address(&self, candidate_url: &str) -> Result<Host>;

    /// `titan.CheckNetworkConnectivity`: ask the candidate to open a probe
    /// toward our public address over `network` (`"tcp"` or `"udp"`).
    /// Success means the probe landed on our mapping.
    async fn request_probe(
        &self,
        candidate_url: &str,
        network: &str,
        public_addr: &str,
    ) -> Result<()>;
}

/// One completed ranged fetch.
#[derive(Clone, Debug)]
pub struct RangeChunk {
    /// Total file size from `Content-Range`, or the body length when the
    /// header was absent.
    pub total: u64,
    pub data: Bytes,
}

/// Byte source for the range dispatcher.
///
/// `fetch_range` retrieves `[start, end)` of the file named by `cid` from
/// some reachable edge; `end_of_file` is invoked exactly once by the writer
/// when the download completes or is abandoned.
#[async_trait]
pub trait RangeSource: Send + Sync + 'static {
    async fn fetch_range(&self, cid: &str, start: u64, end: u64) -> Result<RangeChunk>;

    /// Flush accumulated workload reports. Must be idempotent.
    async fn end_of_file(&self);
}
