//! # Edge Admission
//!
//! For each advertised edge, decide how a working HTTP transport can be
//! built given the two NAT types involved, build it, and verify it with a
//! single liveness call before the edge joins the reachable set.
//!
//! ## Decision table
//!
//! | Edge NAT | Client NAT | Plan |
//! |----------|-----------|------|
//! | Symmetric (either side) | | skip, unsupported |
//! | OpenInternet / FullCone | any | shared transport |
//! | any (or unknown edge) | OpenInternet / FullCone | punch, then shared |
//! | Restricted (either side) | | punch, then direct dial, pinned |
//! | PortRestricted | PortRestricted | simultaneous open, direct dial, pinned |
//!
//! The symmetric check runs first: a symmetric edge is never admitted, no
//! matter how permissive our own NAT is. Symmetric traversal via port
//! prediction is intentionally not implemented.
//!
//! Admissions are independent and run concurrently; a failed edge only
//! shrinks the reachable set.

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::messages::Edge;
use crate::nat::NatType;
use crate::rpc::RpcCaller;
use crate::transport::EdgeTransport;

/// Timeout handed to the scheduler for the edge's punch attempt, seconds.
const PUNCH_TIMEOUT_SECS: u64 = 3;

/// How a transport toward one edge should be synthesized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportPlan {
    /// The edge is openly reachable; ride the shared endpoint.
    Shared,
    /// Ask the edge to open toward us first, then ride the shared endpoint.
    PunchThenShared,
    /// Punch, then dial the edge directly and pin that connection.
    PunchThenDirect,
    /// Both sides port-restricted: outbound dummy and punch race to open
    /// both mappings, then dial and pin.
    SimultaneousOpen,
    /// No traversal strategy exists (symmetric NAT or blocked UDP).
    Unsupported,
}

/// Pick the traversal plan for an edge given both NAT classifications.
pub fn plan_transport(edge: NatType, client: NatType) -> TransportPlan {
    // A symmetric edge is never admitted. A symmetric client can still dial
    // openly reachable edges, but no punch-based plan can help it.
    if edge == NatType::Symmetric {
        return TransportPlan::Unsupported;
    }
    if edge.is_open() {
        return TransportPlan::Shared;
    }
    if client == NatType::Symmetric {
        return TransportPlan::Unsupported;
    }
    if client.is_open() || edge == NatType::Unknown {
        return TransportPlan::PunchThenShared;
    }
    if edge == NatType::Restricted || client == NatType::Restricted {
        return TransportPlan::PunchThenDirect;
    }
    if edge == NatType::PortRestricted && client == NatType::PortRestricted {
        return TransportPlan::SimultaneousOpen;
    }
    TransportPlan::Unsupported
}

/// Build and verify a transport for one edge.
pub async fn establish(rpc: &RpcCaller, client_nat: NatType, edge: &Edge) -> Result<EdgeTransport> {
    let plan = plan_transport(edge.declared_nat, client_nat);
    debug!(
        node = %edge.node_id,
        addr = %edge.address,
        edge_nat = %edge.declared_nat,
        client_nat = %client_nat,
        plan = ?plan,
        "admitting edge"
    );

    let transport = match plan {
        TransportPlan::Shared => EdgeTransport::Shared,
        TransportPlan::PunchThenShared => {
            punch(rpc, edge).await?;
            EdgeTransport::Shared
        }
        TransportPlan::PunchThenDirect => {
            punch(rpc, edge).await?;
            dial_pinned(rpc, edge).await?
        }
        TransportPlan::SimultaneousOpen => {
            // The dummy request opens our outbound mapping toward the edge
            // while the punch opens theirs toward us. The dummy is expected
            // to fail; only the punch result matters.
            let shared = EdgeTransport::Shared;
            let dummy = rpc.version(&shared, &edge.address);
            let punched = punch(rpc, edge);
            let (_, punched) = tokio::join!(dummy, punched);
            punched?;
            dial_pinned(rpc, edge).await?
        }
        TransportPlan::Unsupported => {
            return Err(Error::admission(format!(
                "no traversal path for edge {} (edge {}, client {})",
                edge.node_id, edge.declared_nat, client_nat
            )));
        }
    };

    // Only a transport that answers a real call joins the reachable set.
    rpc.version(&transport, &edge.address).await?;

    Ok(transport)
}

async fn punch(rpc: &RpcCaller, edge: &Edge) -> Result<()> {
    rpc.nat_punch(
        &edge.scheduler_url,
        &edge.to_nat_punch_req(PUNCH_TIMEOUT_SECS),
    )
    .await
}

async fn dial_pinned(rpc: &RpcCaller, edge: &Edge) -> Result<EdgeTransport> {
    let conn = rpc
        .connector()
        .dial_direct(&edge.address)
        .await
        .map_err(|e| Error::admission(e.to_string()))?;
    debug!(node = %edge.node_id, remote = %conn.remote_address(), "pinned direct connection");
    Ok(EdgeTransport::Pinned(conn))
}

/// Admit all advertised edges concurrently. Per-edge failures are logged
/// and isolated; the result holds only edges whose liveness call succeeded.
pub async fn filter_accessible(
    rpc: &RpcCaller,
    client_nat: NatType,
    edges: Vec<Edge>,
) -> Vec<(Edge, EdgeTransport)> {
    let mut tasks = JoinSet::new();
    for edge in edges {
        let rpc = rpc.clone();
        tasks.spawn(async move {
            match establish(&rpc, client_nat, &edge).await {
                Ok(transport) => Some((edge, transport)),
                Err(e) => {
                    warn!(node = %edge.node_id, error = %e, "edge admission failed");
                    None
                }
            }
        });
    }

    let mut admitted = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(pair)) => admitted.push(pair),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "admission task panicked"),
        }
    }

    admitted
}
