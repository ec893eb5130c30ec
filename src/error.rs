//! Error kinds for the retrieval core.
//!
//! Every public operation returns [`Result`]. The variants map one-to-one to
//! the failure domains of the pipeline: configuration, scheduler discovery,
//! NAT classification, edge admission, range fetching, local reassembly, and
//! proof-of-work reporting. Per-edge admission failures are isolated by the
//! caller and never surface here unless the reachable set ends up empty.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete client configuration.
    #[error("config: {0}")]
    Config(String),

    /// Scheduler or candidate discovery failed (access point, download infos).
    #[error("network discovery: {0}")]
    NetworkDiscovery(String),

    /// NAT probe protocol could not run (distinct from an unconfirmed probe,
    /// which merely leaves the classification at a more restrictive type).
    #[error("nat classification: {0}")]
    NatClassification(String),

    /// No transport could be established toward an edge, or the reachable
    /// set is empty after admission.
    #[error("edge admission: {0}")]
    EdgeAdmission(String),

    /// A ranged fetch failed beyond the retry budget.
    #[error("range fetch: {0}")]
    RangeFetch(String),

    /// The reassembly pipe rejected a positional write.
    #[error("pipe write: {0}")]
    PipeWrite(String),

    /// Workload report encryption failed (bad scheduler key, OAEP failure).
    #[error("proof encrypt: {0}")]
    ProofEncrypt(String),

    /// Workload report submission failed (push stream or binding RPC).
    #[error("proof submit: {0}")]
    ProofSubmit(String),

    /// The caller cancelled the download.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn discovery(msg: impl Into<String>) -> Self {
        Error::NetworkDiscovery(msg.into())
    }

    pub(crate) fn nat(msg: impl Into<String>) -> Self {
        Error::NatClassification(msg.into())
    }

    pub(crate) fn admission(msg: impl Into<String>) -> Self {
        Error::EdgeAdmission(msg.into())
    }

    pub(crate) fn fetch(msg: impl Into<String>) -> Self {
        Error::RangeFetch(msg.into())
    }

    pub(crate) fn encrypt(msg: impl Into<String>) -> Self {
        Error::ProofEncrypt(msg.into())
    }

    pub(crate) fn submit(msg: impl Into<String>) -> Self {
        Error::ProofSubmit(msg.into())
    }

    /// Whether this error is a cancellation, as opposed to a hard failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
