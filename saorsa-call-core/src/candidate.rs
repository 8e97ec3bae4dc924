//! Connectivity candidate lines
//!
//! Parsing and printing of `candidate:` attribute lines, shared by the
//! negotiation optimizer (dedupe, compaction) and local peer discovery
//! (address inspection).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Address seen by a STUN server
    ServerReflexive,
    /// Address learned from a peer's check
    PeerReflexive,
    /// Address on a relay server
    Relay,
}

impl CandidateType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(format!("unknown candidate type {other:?}")),
        }
    }
}

/// Parsed candidate line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// Foundation
    pub foundation: String,
    /// Component id (1 = RTP)
    pub component: u32,
    /// Transport, lowercased
    pub transport: String,
    /// Priority
    pub priority: u64,
    /// Connection address; an IP or an mDNS hostname
    pub address: String,
    /// Port
    pub port: u16,
    /// Candidate type
    pub kind: CandidateType,
    /// Related address for reflexive/relay candidates
    pub related_address: Option<String>,
    /// Related port
    pub related_port: Option<u16>,
    /// TCP candidate type (`active`, `passive`, `so`)
    pub tcp_type: Option<String>,
    /// Remaining extension attributes, in order
    pub extensions: Vec<(String, String)>,
}

impl IceCandidate {
    /// Parse a line with or without the `a=` / `candidate:` prefixes
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed field.
    pub fn parse(line: &str) -> Result<Self, String> {
        let body = line.trim();
        let body = body.strip_prefix("a=").unwrap_or(body);
        let body = body.strip_prefix("candidate:").unwrap_or(body);
        let mut fields = body.split_whitespace();

        let mut next = |name: &str| {
            fields
                .next()
                .map(str::to_string)
                .ok_or_else(|| format!("candidate missing {name}"))
        };
        let foundation = next("foundation")?;
        let component = next("component")?
            .parse()
            .map_err(|_| "candidate component is not a number".to_string())?;
        let transport = next("transport")?.to_ascii_lowercase();
        let priority = next("priority")?
            .parse()
            .map_err(|_| "candidate priority is not a number".to_string())?;
        let address = next("address")?;
        let port = next("port")?
            .parse()
            .map_err(|_| "candidate port is not a number".to_string())?;
        if next("typ")? != "typ" {
            return Err("candidate missing typ keyword".to_string());
        }
        let kind = next("type")?.parse()?;

        let mut candidate = Self {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            kind,
            related_address: None,
            related_port: None,
            tcp_type: None,
            extensions: Vec::new(),
        };

        let rest: Vec<&str> = fields.collect();
        for pair in rest.chunks(2) {
            let [key, value] = pair else {
                return Err(format!("dangling candidate attribute {:?}", pair[0]));
            };
            match *key {
                "raddr" => candidate.related_address = Some((*value).to_string()),
                "rport" => {
                    candidate.related_port = Some(
                        value
                            .parse()
                            .map_err(|_| "candidate rport is not a number".to_string())?,
                    );
                }
                "tcptype" => candidate.tcp_type = Some((*value).to_string()),
                _ => candidate
                    .extensions
                    .push(((*key).to_string(), (*value).to_string())),
            }
        }
        Ok(candidate)
    }

    /// Address as an IP, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    /// Active TCP candidates only connect outwards and cannot be reached
    pub fn is_active_tcp(&self) -> bool {
        self.transport == "tcp" && self.tcp_type.as_deref() == Some("active")
    }

    /// Identity of the path this candidate offers, ignoring foundation,
    /// priority and extensions
    pub fn path_key(&self) -> (u32, String, String, u16, CandidateType) {
        (
            self.component,
            self.transport.clone(),
            self.address.clone(),
            self.port,
            self.kind,
        )
    }

    /// Same candidate without extension attributes
    #[must_use]
    pub fn compact(&self) -> Self {
        Self {
            extensions: Vec::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.kind.as_str()
        )?;
        if let Some(raddr) = &self.related_address {
            write!(f, " raddr {raddr}")?;
        }
        if let Some(rport) = self.related_port {
            write!(f, " rport {rport}")?;
        }
        if let Some(tcp_type) = &self.tcp_type {
            write!(f, " tcptype {tcp_type}")?;
        }
        for (key, value) in &self.extensions {
            write!(f, " {key} {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_srflx_with_extensions() {
        let c = IceCandidate::parse(
            "a=candidate:842163049 1 UDP 1677729535 203.0.113.7 61665 typ srflx raddr 192.168.1.20 rport 61665 generation 0 network-cost 999",
        )
        .unwrap();
        assert_eq!(c.transport, "udp");
        assert_eq!(c.kind, CandidateType::ServerReflexive);
        assert_eq!(c.related_address.as_deref(), Some("192.168.1.20"));
        assert_eq!(c.related_port, Some(61665));
        assert_eq!(c.extensions.len(), 2);
        assert_eq!(c.ip(), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_display_round_trips_compact_form() {
        let line = "candidate:1 1 tcp 1518280447 10.0.0.5 9 typ host tcptype active";
        let c = IceCandidate::parse(line).unwrap();
        assert!(c.is_active_tcp());
        assert_eq!(c.to_string(), line);
    }

    #[test]
    fn test_compact_drops_extensions_only() {
        let c = IceCandidate::parse(
            "candidate:1 1 udp 2122260223 10.0.0.5 50000 typ host generation 0 ufrag abcd",
        )
        .unwrap();
        assert_eq!(
            c.compact().to_string(),
            "candidate:1 1 udp 2122260223 10.0.0.5 50000 typ host"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(IceCandidate::parse("candidate:1 1 udp").is_err());
        assert!(IceCandidate::parse("candidate:1 1 udp 1 10.0.0.1 port typ host").is_err());
        assert!(IceCandidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ bogus").is_err());
        assert!(IceCandidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ host raddr").is_err());
    }

    #[test]
    fn test_mdns_host_has_no_ip() {
        let c = IceCandidate::parse(
            "candidate:1 1 udp 2122260223 4b1c2f7e-1111-2222-3333-444455556666.local 50000 typ host",
        )
        .unwrap();
        assert_eq!(c.kind, CandidateType::Host);
        assert!(c.ip().is_none());
    }
}
