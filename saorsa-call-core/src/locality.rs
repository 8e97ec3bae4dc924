//! Local peer discovery
//!
//! Compares the two sides' connectivity candidates to guess whether the
//! peers sit on the same local network. Evidence for `Local`:
//!
//! - both sides were reflected to the same public address (same NAT)
//! - host addresses in the same private IPv4 /24
//! - host addresses in the same IPv6 /64
//!
//! Disjoint public addresses win over matching private ranges, since two
//! unrelated home networks often share `192.168.1.0/24`. The result is
//! advisory: it may let the session prefer a direct path, it never blocks
//! setup.

use crate::candidate::{CandidateType, IceCandidate};
use crate::types::{Locality, PeerLocality};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const SHARED_PUBLIC_WEIGHT: f32 = 0.6;
const SHARED_V4_SUBNET_WEIGHT: f32 = 0.5;
const SHARED_V6_PREFIX_WEIGHT: f32 = 0.6;
const DISJOINT_PUBLIC_CONFIDENCE: f32 = 0.9;

#[derive(Debug, Default)]
struct Addresses {
    public: HashSet<IpAddr>,
    v4_subnets: HashSet<[u8; 3]>,
    v6_prefixes: HashSet<[u16; 4]>,
}

impl Addresses {
    fn gather<'a>(lines: impl IntoIterator<Item = &'a String>) -> Self {
        let mut addrs = Self::default();
        for candidate in lines.into_iter().flat_map(|l| candidate_lines(l)) {
            match candidate.kind {
                CandidateType::ServerReflexive | CandidateType::PeerReflexive => {
                    if let Some(ip) = candidate.ip() {
                        addrs.public.insert(ip);
                    }
                    // The base of a reflexive candidate is a host address
                    if let Some(base) = candidate
                        .related_address
                        .as_deref()
                        .and_then(|a| a.parse().ok())
                    {
                        addrs.add_host(base);
                    }
                }
                CandidateType::Host => {
                    if let Some(ip) = candidate.ip() {
                        addrs.add_host(ip);
                    }
                }
                CandidateType::Relay => {}
            }
        }
        addrs
    }

    fn add_host(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) if is_private_v4(v4) => {
                let [a, b, c, _] = v4.octets();
                self.v4_subnets.insert([a, b, c]);
            }
            IpAddr::V6(v6) if is_routable_v6(v6) => {
                let s = v6.segments();
                self.v6_prefixes.insert([s[0], s[1], s[2], s[3]]);
            }
            _ => {}
        }
    }
}

fn candidate_lines(payload: &str) -> impl Iterator<Item = IceCandidate> + '_ {
    payload
        .lines()
        .filter_map(|line| IceCandidate::parse(line).ok())
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() && !ip.is_unspecified()
}

fn is_routable_v6(ip: Ipv6Addr) -> bool {
    let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || link_local)
}

/// Candidate-based locality classifier
#[derive(Debug, Clone, Copy)]
pub struct LocalPeerDiscovery {
    threshold: f32,
}

impl LocalPeerDiscovery {
    /// Classifier treating results at or above `threshold` as conclusive
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Classify from both sides' candidate payloads
    ///
    /// Each entry may hold several newline-separated candidate lines.
    /// Without comparable evidence the result is `Remote` with zero
    /// confidence.
    pub fn classify(&self, local: &[String], remote: &[String]) -> PeerLocality {
        let ours = Addresses::gather(local);
        let theirs = Addresses::gather(remote);

        if !ours.public.is_empty()
            && !theirs.public.is_empty()
            && ours.public.is_disjoint(&theirs.public)
        {
            return PeerLocality {
                locality: Locality::Remote,
                confidence: DISJOINT_PUBLIC_CONFIDENCE,
            };
        }

        let mut doubt = 1.0_f32;
        if !ours.public.is_disjoint(&theirs.public) {
            doubt *= 1.0 - SHARED_PUBLIC_WEIGHT;
        }
        if !ours.v4_subnets.is_disjoint(&theirs.v4_subnets) {
            doubt *= 1.0 - SHARED_V4_SUBNET_WEIGHT;
        }
        if !ours.v6_prefixes.is_disjoint(&theirs.v6_prefixes) {
            doubt *= 1.0 - SHARED_V6_PREFIX_WEIGHT;
        }

        if doubt < 1.0 {
            PeerLocality {
                locality: Locality::Local,
                confidence: 1.0 - doubt,
            }
        } else {
            PeerLocality {
                locality: Locality::Remote,
                confidence: 0.0,
            }
        }
    }

    /// Result is strong enough to cache for the session
    pub fn is_conclusive(&self, locality: &PeerLocality) -> bool {
        locality.confidence >= self.threshold
    }

    /// Whether to ask the connection for a direct path
    pub fn should_prefer_direct(&self, locality: &PeerLocality, direct_established: bool) -> bool {
        !direct_established && locality.is_confident_local(self.threshold)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn host(ip: &str) -> String {
        format!("candidate:1 1 udp 2122260223 {ip} 50000 typ host")
    }

    fn srflx(public: &str, base: &str) -> String {
        format!("candidate:2 1 udp 1686052607 {public} 61000 typ srflx raddr {base} rport 50000")
    }

    fn discovery() -> LocalPeerDiscovery {
        LocalPeerDiscovery::new(0.75)
    }

    #[test]
    fn test_same_nat_and_subnet_is_confident_local() {
        let local = vec![host("192.168.1.10"), srflx("203.0.113.7", "192.168.1.10")];
        let remote = vec![format!(
            "{}\n{}",
            host("192.168.1.22"),
            srflx("203.0.113.7", "192.168.1.22")
        )];
        let result = discovery().classify(&local, &remote);
        assert_eq!(result.locality, Locality::Local);
        assert!((result.confidence - 0.8).abs() < 1e-6);
        assert!(result.is_confident_local(0.75));
        assert!(discovery().should_prefer_direct(&result, false));
        assert!(!discovery().should_prefer_direct(&result, true));
    }

    #[test]
    fn test_matching_private_subnet_alone_is_not_enough() {
        let result = discovery().classify(&[host("192.168.1.10")], &[host("192.168.1.99")]);
        assert_eq!(result.locality, Locality::Local);
        assert!(!discovery().is_conclusive(&result));
    }

    #[test]
    fn test_different_public_addresses_are_remote() {
        let local = vec![srflx("203.0.113.7", "192.168.1.10")];
        let remote = vec![srflx("198.51.100.4", "192.168.1.11")];
        let result = discovery().classify(&local, &remote);
        assert_eq!(result.locality, Locality::Remote);
        assert!(discovery().is_conclusive(&result));
    }

    #[test]
    fn test_ipv6_prefix_match() {
        let local = vec![host("2001:db8:aa:1::10"), host("192.168.0.2")];
        let remote = vec![host("2001:db8:aa:1::99"), host("192.168.0.3")];
        let result = discovery().classify(&local, &remote);
        assert_eq!(result.locality, Locality::Local);
        assert!(result.confidence >= 0.75);
    }

    #[test]
    fn test_link_local_and_relay_give_no_evidence() {
        let local = vec![
            host("fe80::1"),
            "candidate:3 1 udp 41885439 198.51.100.1 3478 typ relay raddr 0.0.0.0 rport 0"
                .to_string(),
        ];
        let remote = vec![host("fe80::2")];
        let result = discovery().classify(&local, &remote);
        assert_eq!(result.locality, Locality::Remote);
        assert_eq!(result.confidence, 0.0);
        assert!(!discovery().is_conclusive(&result));
    }

    #[test]
    fn test_unparseable_lines_are_ignored() {
        let result = discovery().classify(&["nonsense".to_string()], &[]);
        assert_eq!(result.confidence, 0.0);
    }
}
