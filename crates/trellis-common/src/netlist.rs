//! IP network lists used for connection restriction.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A single CIDR block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    /// Whether `ip` falls inside this block. Mixed v4/v6 never matches.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_v4(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_v6(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix.min(128)))
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpNet {
    type Err = NetlistParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some(parts) => parts,
            None => (s, ""),
        };
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| NetlistParseError(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = if prefix_str.is_empty() {
            max
        } else {
            prefix_str
                .parse::<u8>()
                .map_err(|_| NetlistParseError(s.to_string()))?
        };
        if prefix > max {
            return Err(NetlistParseError(s.to_string()));
        }
        Ok(Self { addr, prefix })
    }
}

/// Error parsing a netlist entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CIDR block: {0}")]
pub struct NetlistParseError(String);

/// An ordered list of CIDR blocks, used for both the connectivity
/// allow-list and the deny-list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Netlist {
    nets: Vec<IpNet>,
}

impl Netlist {
    /// Whether any block in the list contains `ip`.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|n| n.contains(ip))
    }

    /// Whether the list has no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

impl FromStr for Netlist {
    type Err = NetlistParseError;

    /// Parse a comma-separated list of CIDR blocks, e.g.
    /// `"10.0.0.0/8,192.168.0.0/16"`. Whitespace around entries is
    /// ignored; empty entries are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let nets = s
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(IpNet::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nets })
    }
}

impl fmt::Display for Netlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, net) in self.nets.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{net}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(s: &str) -> Netlist {
        s.parse().unwrap()
    }

    #[test]
    fn v4_prefix_matching() {
        let l = list("10.0.0.0/8");
        assert!(l.contains("10.255.0.1".parse().unwrap()));
        assert!(!l.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn host_entry_without_prefix_matches_exactly() {
        let l = list("192.168.1.5");
        assert!(l.contains("192.168.1.5".parse().unwrap()));
        assert!(!l.contains("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn multiple_blocks_any_match() {
        let l = list("10.0.0.0/8, 172.16.0.0/12");
        assert!(l.contains("172.20.1.1".parse().unwrap()));
        assert!(l.contains("10.1.1.1".parse().unwrap()));
        assert!(!l.contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn v6_prefix_matching() {
        let l = list("fd00::/8");
        assert!(l.contains("fd12:3456::1".parse().unwrap()));
        assert!(!l.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn v4_never_matches_v6_block() {
        let l = list("::/0");
        assert!(!l.contains("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything_in_family() {
        let l = list("0.0.0.0/0");
        assert!(l.contains("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        assert!("10.0.0.0/33".parse::<Netlist>().is_err());
        assert!("not-an-ip/8".parse::<Netlist>().is_err());
    }

    #[test]
    fn empty_string_parses_to_empty_list() {
        assert!(list("").is_empty());
    }
}
