//! # Titan Client - Peer-Assisted Content Retrieval
//!
//! This crate implements the client-side retrieval core for the Titan
//! content network: given a CID, it locates edge nodes holding pieces of the
//! file, establishes direct peer-to-peer transport to as many of them as NAT
//! conditions permit, fetches the file concurrently by byte range, streams
//! the reassembled bytes in order, and reports signed measurements of each
//! peer's contribution back to the coordinating schedulers.
//!
//! ## Architecture
//!
//! - **Shared UDP socket**: one QUIC endpoint serves the inbound `/ping`
//!   responder and originates every outbound HTTP/3 request, which is what
//!   lets hole-punched mappings carry real traffic.
//! - **NAT traversal**: the client classifies its own NAT with coordinator
//!   probes, then picks a per-edge plan from a decision table (shared
//!   transport, punch-then-share, punch-then-dial, simultaneous open).
//! - **Range pipeline**: a bounded worker pool fetches ranges with retry and
//!   backpressure; a positional pipe turns out-of-order completions into an
//!   in-order reader.
//! - **Workload ledger**: per-token aggregated measurements, encrypted per
//!   scheduler with RSA-OAEP and submitted via a two-phase push stream.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `client` | High-level API combining all components |
//! | `config` | Client options and validation |
//! | `transport` | Shared endpoint, HTTP/3 client pool, pinned transports |
//! | `rpc` | Typed JSON-RPC calls to schedulers and edges |
//! | `nat` | NAT classification via multi-candidate probes |
//! | `admission` | Per-edge transport synthesis and liveness gating |
//! | `dispatch` | Range jobs, worker pool, positional reassembly pipe |
//! | `workload` | Measurement aggregation, encryption, submission |
//! | `messages` | Wire types for all protocols |
//! | `protocols` | Seam traits between pipeline stages |
//! | `crypto` | TLS material and report encryption |
//! | `error` | Typed error kinds |

mod admission;
mod client;
mod config;
mod crypto;
mod dispatch;
mod error;
mod messages;
mod nat;
mod protocols;
mod rpc;
mod transport;
mod workload;

pub use client::Client;
pub use config::{
    Config, TraversalMode, DEFAULT_CONCURRENCY, DEFAULT_LISTEN_ADDR, DEFAULT_RANGE_SIZE,
};
pub use dispatch::FileReader;
pub use error::{Error, Result};
pub use messages::{Edge, Token, Workload, WorkloadReport};
pub use nat::NatType;
pub use transport::HttpConnector;
