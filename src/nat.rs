//! # NAT Discovery
//!
//! Classifies the client's NAT by probing coordinator candidates:
//!
//! 1. Ask candidate 1 for the public address it observed (UDP). Failure
//!    means UDP egress is blocked.
//! 2. Ask candidate 2 for its observation. Differing ports mean the NAT
//!    allocates a fresh mapping per destination: symmetric.
//! 3. Ask candidate 3 to connect back over TCP. Success: open internet.
//! 4. Ask candidate 3 to send UDP to the observed mapping. Success: full
//!    cone (any remote may use the mapping).
//! 5. Ask candidate 1 (which we already contacted) to send UDP. Success:
//!    address-restricted cone.
//! 6. Otherwise: port-restricted cone.
//!
//! The three closing probes run concurrently; the most permissive confirmed
//! classification wins. A failed probe is not fatal, it only means that
//! classification was not confirmed.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocols::ProbeRpc;

/// Client or edge NAT classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NatType {
    #[default]
    Unknown,
    OpenInternet,
    Symmetric,
    FullCone,
    Restricted,
    PortRestricted,
    UdpBlock,
}

impl NatType {
    /// Decode the wire representation. Schedulers send either the symbolic
    /// names or the numeric enum values; anything else maps to `Unknown`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "NoNAT" => NatType::OpenInternet,
            "SymmetricNAT" => NatType::Symmetric,
            "FullConeNAT" => NatType::FullCone,
            "RestrictedNAT" => NatType::Restricted,
            "PortRestrictedNAT" => NatType::PortRestricted,
            _ => match s.parse::<u8>() {
                Ok(0) => NatType::Unknown,
                Ok(1) => NatType::OpenInternet,
                Ok(2) => NatType::Symmetric,
                Ok(3) => NatType::FullCone,
                Ok(4) => NatType::Restricted,
                Ok(5) => NatType::PortRestricted,
                Ok(6) => NatType::UdpBlock,
                _ => NatType::Unknown,
            },
        }
    }

    /// Whether peers can reach this NAT without coordinator assistance.
    pub fn is_open(self) -> bool {
        matches!(self, NatType::OpenInternet | NatType::FullCone)
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::Unknown => "Unknown",
            NatType::OpenInternet => "OpenInternet",
            NatType::Symmetric => "Symmetric",
            NatType::FullCone => "FullCone",
            NatType::Restricted => "Restricted",
            NatType::PortRestricted => "PortRestricted",
            NatType::UdpBlock => "UDPBlock",
        };
        f.write_str(s)
    }
}

/// Public endpoint observed by a coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub ip: String,
    pub port: u16,
}

impl Host {
    /// Parse `"ip:port"`. IPv6 forms keep everything before the last colon
    /// as the host part.
    pub fn parse(s: &str) -> Option<Self> {
        let (ip, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if ip.is_empty() {
            return None;
        }
        Some(Self {
            ip: ip.to_string(),
            port,
        })
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Run the probe protocol against the candidates advertised by the primary
/// scheduler and classify the local NAT.
pub async fn discover<P: ProbeRpc + ?Sized>(rpc: &P, primary_scheduler: &str) -> Result<NatType> {
    let candidates = rpc.candidate_urls(primary_scheduler).await?;
    if candidates.is_empty() {
        warn!("no NAT probe candidates advertised");
        return Ok(NatType::Unknown);
    }

    let primary = &candidates[0];

    // Test I: learn our public mapping from the primary candidate.
    let public_addr = match rpc.external_address(primary).await {
        Ok(host) => host,
        Err(e) => {
            debug!(error = %e, "external address probe failed, assuming UDP blocked");
            return Ok(NatType::UdpBlock);
        }
    };
    info!(public_addr = %public_addr, "observed public address");

    if candidates.len() < 3 {
        warn!(candidates = candidates.len(), "insufficient candidates for classification");
        return Ok(NatType::Unknown);
    }

    let secondary = &candidates[1];
    let tertiary = &candidates[2];

    // Test II: a second observer. A different port per destination means the
    // NAT allocates per-flow mappings.
    let second_addr = match rpc.external_address(secondary).await {
        Ok(host) => host,
        Err(e) => {
            debug!(error = %e, "secondary external address probe failed");
            return Ok(NatType::Unknown);
        }
    };

    if public_addr.port != second_addr.port {
        info!(
            primary_port = public_addr.port,
            secondary_port = second_addr.port,
            "port mapping differs per destination"
        );
        return Ok(NatType::Symmetric);
    }

    // Tests III-V race concurrently; the most permissive confirmed
    // classification wins.
    let addr = public_addr.to_string();
    let (open, full_cone, restricted) = tokio::join!(
        rpc.request_probe(tertiary, "tcp", &addr),
        rpc.request_probe(tertiary, "udp", &addr),
        rpc.request_probe(primary, "udp", &addr),
    );

    let classified = if open.is_ok() {
        NatType::OpenInternet
    } else if full_cone.is_ok() {
        NatType::FullCone
    } else if restricted.is_ok() {
        NatType::Restricted
    } else {
        NatType::PortRestricted
    };

    info!(nat = %classified, "NAT classification complete");
    Ok(classified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::error::Error;

    /// Scripted probe reflector: maps (candidate, op) to outcomes.
    struct FakeProbes {
        candidates: Vec<String>,
        external: HashMap<String, Host>,
        probe_ok: Mutex<HashMap<(String, String), bool>>,
    }

    impl FakeProbes {
        fn new(candidates: &[&str]) -> Self {
            Self {
                candidates: candidates.iter().map(|s| s.to_string()).collect(),
                external: HashMap::new(),
                probe_ok: Mutex::new(HashMap::new()),
            }
        }

        fn with_external(mut self, candidate: &str, addr: &str) -> Self {
            self.external
                .insert(candidate.to_string(), Host::parse(addr).unwrap());
            self
        }

        fn allow_probe(self, candidate: &str, network: &str) -> Self {
            self.probe_ok
                .lock()
                .unwrap()
                .insert((candidate.to_string(), network.to_string()), true);
            self
        }
    }

    #[async_trait]
    impl ProbeRpc for FakeProbes {
        async fn candidate_urls(&self, _scheduler: &str) -> Result<Vec<String>> {
            Ok(self.candidates.clone())
        }

        async fn external_address(&self, candidate: &str) -> Result<Host> {
            self.external
                .get(candidate)
                .cloned()
                .ok_or_else(|| Error::nat("no observation"))
        }

        async fn request_probe(
            &self,
            candidate: &str,
            network: &str,
            _public_addr: &str,
        ) -> Result<()> {
            let ok = self
                .probe_ok
                .lock()
                .unwrap()
                .get(&(candidate.to_string(), network.to_string()))
                .copied()
                .unwrap_or(false);
            if ok {
                Ok(())
            } else {
                Err(Error::nat("probe did not land"))
            }
        }
    }

    #[tokio::test]
    async fn udp_block_when_no_observation() {
        let probes = FakeProbes::new(&["c1", "c2", "c3"]);
        let nat = discover(&probes, "sched").await.unwrap();
        assert_eq!(nat, NatType::UdpBlock);
    }

    #[tokio::test]
    async fn insufficient_candidates_is_unknown() {
        let probes = FakeProbes::new(&["c1", "c2"]).with_external("c1", "198.51.100.9:40001");
        let nat = discover(&probes, "sched").await.unwrap();
        assert_eq!(nat, NatType::Unknown);
    }

    #[tokio::test]
    async fn differing_ports_classify_symmetric() {
        let probes = FakeProbes::new(&["c1", "c2", "c3"])
            .with_external("c1", "198.51.100.9:40001")
            .with_external("c2", "198.51.100.9:40099");
        let nat = discover(&probes, "sched").await.unwrap();
        assert_eq!(nat, NatType::Symmetric);
    }

    #[tokio::test]
    async fn tcp_probe_back_means_open_internet() {
        let probes = FakeProbes::new(&["c1", "c2", "c3"])
            .with_external("c1", "198.51.100.9:40001")
            .with_external("c2", "198.51.100.9:40001")
            .allow_probe("c3", "tcp")
            .allow_probe("c3", "udp")
            .allow_probe("c1", "udp");
        let nat = discover(&probes, "sched").await.unwrap();
        assert_eq!(nat, NatType::OpenInternet);
    }

    #[tokio::test]
    async fn udp_from_third_party_means_full_cone() {
        let probes = FakeProbes::new(&["c1", "c2", "c3"])
            .with_external("c1", "198.51.100.9:40001")
            .with_external("c2", "198.51.100.9:40001")
            .allow_probe("c3", "udp")
            .allow_probe("c1", "udp");
        let nat = discover(&probes, "sched").await.unwrap();
        assert_eq!(nat, NatType::FullCone);
    }

    #[tokio::test]
    async fn udp_from_contacted_party_means_restricted() {
        let probes = FakeProbes::new(&["c1", "c2", "c3"])
            .with_external("c1", "198.51.100.9:40001")
            .with_external("c2", "198.51.100.9:40001")
            .allow_probe("c1", "udp");
        let nat = discover(&probes, "sched").await.unwrap();
        assert_eq!(nat, NatType::Restricted);
    }

    #[tokio::test]
    async fn all_probes_failing_means_port_restricted() {
        let probes = FakeProbes::new(&["c1", "c2", "c3"])
            .with_external("c1", "198.51.100.9:40001")
            .with_external("c2", "198.51.100.9:40001");
        let nat = discover(&probes, "sched").await.unwrap();
        assert_eq!(nat, NatType::PortRestricted);
    }

    #[test]
    fn wire_codings() {
        assert_eq!(NatType::from_wire("NoNAT"), NatType::OpenInternet);
        assert_eq!(NatType::from_wire("SymmetricNAT"), NatType::Symmetric);
        assert_eq!(NatType::from_wire("FullConeNAT"), NatType::FullCone);
        assert_eq!(NatType::from_wire("RestrictedNAT"), NatType::Restricted);
        assert_eq!(NatType::from_wire("PortRestrictedNAT"), NatType::PortRestricted);
        assert_eq!(NatType::from_wire("5"), NatType::PortRestricted);
        assert_eq!(NatType::from_wire("6"), NatType::UdpBlock);
        assert_eq!(NatType::from_wire("whatever"), NatType::Unknown);
        assert_eq!(NatType::from_wire(""), NatType::Unknown);
    }

    #[test]
    fn host_parsing() {
        let host = Host::parse("203.0.113.4:8863").unwrap();
        assert_eq!(host.ip, "203.0.113.4");
        assert_eq!(host.port, 8863);
        assert_eq!(host.to_string(), "203.0.113.4:8863");
        assert!(Host::parse("no-port").is_none());
        assert!(Host::parse(":123").is_none());
    }
}
