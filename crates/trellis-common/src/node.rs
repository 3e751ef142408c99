//! Node identity and addressing.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Length in bytes of a node identifier.
pub const NODE_ID_LEN: usize = 64;

/// A 64-byte node identifier: the uncompressed secp256k1 public key of
/// the node with the point-format prefix stripped.
///
/// Identifiers are opaque handles; equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Wrap raw identifier bytes.
    #[must_use]
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero identifier, used as a placeholder before the
    /// encryption handshake reveals the real one.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; NODE_ID_LEN])
    }

    /// Whether this is the zero placeholder.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Hex digest of the identifier, recorded alongside node metadata.
    #[must_use]
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }

    /// Parse an identifier from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly [`NODE_ID_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeParseError> {
        let arr: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| NodeParseError::IdLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full ids are unwieldy in logs; show the head like a git hash.
        write!(f, "NodeId({}…)", &hex::encode(&self.0[..4]))
    }
}

impl FromStr for NodeId {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| NodeParseError::IdEncoding)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(D::Error::custom)
        } else {
            let bytes = <&[u8]>::deserialize(deserializer)?;
            Self::from_slice(bytes).map_err(D::Error::custom)
        }
    }
}

/// Error parsing a [`NodeId`] or [`Node`] URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeParseError {
    /// Identifier had the wrong length.
    #[error("node id must be {NODE_ID_LEN} bytes, got {0}")]
    IdLength(usize),
    /// Identifier was not valid hex.
    #[error("node id is not valid hex")]
    IdEncoding,
    /// URL did not start with the `trellis://` scheme.
    #[error("node url must start with trellis://")]
    Scheme,
    /// URL was missing the `@host:port` part.
    #[error("node url is missing the @host:port part")]
    Address,
    /// Host or port failed to parse.
    #[error("invalid host or port: {0}")]
    HostPort(String),
}

/// A node's identity plus its network endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier.
    pub id: NodeId,
    /// IP address.
    pub ip: IpAddr,
    /// TCP listening port.
    pub tcp: u16,
    /// UDP discovery port.
    pub udp: u16,
}

impl Node {
    /// Build a node record with matching TCP and UDP ports.
    #[must_use]
    pub fn new(id: NodeId, ip: IpAddr, port: u16) -> Self {
        Self {
            id,
            ip,
            tcp: port,
            udp: port,
        }
    }

    /// A zeroed node, returned by servers that are not running.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            id: NodeId::zero(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp: 0,
            udp: 0,
        }
    }

    /// The node's TCP endpoint.
    #[must_use]
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trellis://{}@{}:{}", self.id, self.ip, self.tcp)?;
        if self.udp != self.tcp {
            write!(f, "?udp={}", self.udp)?;
        }
        Ok(())
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("trellis://").ok_or(NodeParseError::Scheme)?;
        let (id_str, addr_str) = rest.split_once('@').ok_or(NodeParseError::Address)?;
        let id: NodeId = id_str.parse()?;

        let (addr_str, udp) = match addr_str.split_once("?udp=") {
            Some((a, u)) => {
                let udp = u
                    .parse::<u16>()
                    .map_err(|e| NodeParseError::HostPort(e.to_string()))?;
                (a, Some(udp))
            }
            None => (addr_str, None),
        };
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|e: std::net::AddrParseError| NodeParseError::HostPort(e.to_string()))?;

        Ok(Self {
            id,
            ip: addr.ip(),
            tcp: addr.port(),
            udp: udp.unwrap_or_else(|| addr.port()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with(byte: u8) -> NodeId {
        NodeId::new([byte; NODE_ID_LEN])
    }

    #[test]
    fn node_id_hex_round_trip() {
        let id = id_with(0xab);
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn node_id_rejects_short_hex() {
        let err = "abcd".parse::<NodeId>().unwrap_err();
        assert_eq!(err, NodeParseError::IdLength(2));
    }

    #[test]
    fn node_id_rejects_bad_hex() {
        assert_eq!(
            "zz".repeat(64).parse::<NodeId>().unwrap_err(),
            NodeParseError::IdEncoding
        );
    }

    #[test]
    fn zero_id_is_zero() {
        assert!(NodeId::zero().is_zero());
        assert!(!id_with(1).is_zero());
    }

    #[test]
    fn node_url_round_trip() {
        let node = Node::new(id_with(7), "10.1.2.3".parse().unwrap(), 30303);
        let parsed: Node = node.to_string().parse().unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn node_url_with_separate_udp_port() {
        let mut node = Node::new(id_with(9), "127.0.0.1".parse().unwrap(), 30303);
        node.udp = 30304;
        let s = node.to_string();
        assert!(s.ends_with("?udp=30304"));
        assert_eq!(s.parse::<Node>().unwrap(), node);
    }

    #[test]
    fn node_url_requires_scheme_and_address() {
        assert_eq!(
            "http://x@1.2.3.4:1".parse::<Node>().unwrap_err(),
            NodeParseError::Scheme
        );
        let bare = format!("trellis://{}", id_with(1));
        assert_eq!(bare.parse::<Node>().unwrap_err(), NodeParseError::Address);
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = id_with(3).digest();
        assert_eq!(d.len(), 64);
        assert_eq!(d, id_with(3).digest());
        assert_ne!(d, id_with(4).digest());
    }
}
