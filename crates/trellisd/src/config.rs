//! CLI argument parsing and server configuration.

use clap::Parser;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trellis_common::{Netlist, Node, SecretKey};

use crate::discovery::DiscoveryTable;
use crate::peer::Protocol;
use crate::persist::NodeSink;
use crate::transport::{Dialer, NatMapper, TransportFactory};

/// Default peer cap.
pub const DEFAULT_MAX_PEERS: usize = 25;
/// Default cap on concurrently dialing outbound connections.
pub const DEFAULT_MAX_DIAL: usize = 16;
/// Default number of inbound handshake slots when neither
/// `max_accept_conns` nor `max_pending_peers` is set.
pub const DEFAULT_PENDING_SLOTS: usize = 50;

/// CLI arguments for the trellis node.
#[derive(Parser, Debug, Clone)]
#[command(name = "trellisd")]
#[command(about = "Trellis overlay network node")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on for overlay connections.
    #[arg(long, default_value = "0.0.0.0:30311", env = "TRELLISD_LISTEN")]
    pub listen: SocketAddr,
    /// Disable the listener entirely.
    #[arg(long)]
    pub no_listen: bool,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9590", env = "TRELLISD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum number of connected peers.
    #[arg(long, default_value = "25", env = "TRELLISD_MAX_PEERS")]
    pub max_peers: usize,
    /// Ignore the peer cap, allowing unlimited connections.
    #[arg(long)]
    pub no_max_peers: bool,
    /// Maximum number of concurrently dialing outbound connections.
    #[arg(long, default_value = "16", env = "TRELLISD_MAX_DIAL")]
    pub max_dial: usize,
    /// Maximum inbound connections lingering in the handshake phase.
    #[arg(long, default_value = "0", env = "TRELLISD_MAX_PENDING_PEERS")]
    pub max_pending_peers: usize,
    /// Alternative name for the inbound handshake slot cap; the larger
    /// of the two wins.
    #[arg(long, default_value = "0", env = "TRELLISD_MAX_ACCEPT_CONNS")]
    pub max_accept_conns: usize,
    /// Disable candidate discovery (manual topology).
    #[arg(long)]
    pub no_discovery: bool,
    /// Never dial out; accept inbound connections only.
    #[arg(long)]
    pub no_dial: bool,
    /// Path to the node's secret key file.
    #[arg(long, env = "TRELLISD_KEY")]
    pub key: Option<PathBuf>,
    /// Client name advertised in the protocol handshake.
    #[arg(long, default_value = "trellisd", env = "TRELLISD_NAME")]
    pub name: String,
    /// Static node URL, kept connected indefinitely. Repeatable.
    #[arg(long = "static-node")]
    pub static_nodes: Vec<String>,
    /// Trusted node URL, allowed to bypass the peer cap. Repeatable.
    #[arg(long = "trusted-node")]
    pub trusted_nodes: Vec<String>,
    /// Bootstrap node URL handed to discovery. Repeatable.
    #[arg(long = "bootstrap-node")]
    pub bootstrap_nodes: Vec<String>,
    /// Comma-separated CIDR allow-list; when set, only matching
    /// addresses may connect or be dialed.
    #[arg(long, env = "TRELLISD_NET_RESTRICT")]
    pub net_restrict: Option<String>,
    /// Comma-separated CIDR deny-list.
    #[arg(long, env = "TRELLISD_DENY_LIST")]
    pub deny_list: Option<String>,
    /// Emit an event for every message sent to or received from a peer.
    #[arg(long)]
    pub enable_msg_events: bool,
}

/// Server configuration. Immutable once the server is started.
#[derive(Clone)]
pub struct Config {
    /// The node's secret key; its public half is the local identifier.
    pub secret_key: SecretKey,
    /// Client name advertised in the protocol handshake.
    pub name: String,
    /// Maximum number of connected peers. Must be non-zero unless
    /// `no_max_peers` is set.
    pub max_peers: usize,
    /// Ignore the peer cap.
    pub no_max_peers: bool,
    /// Maximum number of concurrently dialing outbound connections.
    pub max_dial: usize,
    /// Inbound handshake slot cap (one of two names; larger wins).
    pub max_accept_conns: usize,
    /// Inbound handshake slot cap (one of two names; larger wins).
    pub max_pending_peers: usize,
    /// Disable candidate discovery.
    pub no_discovery: bool,
    /// Never dial out.
    pub no_dial: bool,
    /// Listener address; `None` disables listening.
    pub listen_addr: Option<SocketAddr>,
    /// Sub-protocols the server speaks.
    pub protocols: Vec<Arc<dyn Protocol>>,
    /// Nodes handed to discovery to establish connectivity.
    pub bootstrap_nodes: Vec<Node>,
    /// Nodes the dial scheduler keeps connected indefinitely.
    pub static_nodes: Vec<Node>,
    /// Nodes allowed to bypass the peer cap. Immutable after start.
    pub trusted_nodes: Vec<Node>,
    /// When set, only addresses inside the list may connect or be dialed.
    pub net_restrict: Option<Netlist>,
    /// Addresses never allowed to connect or be dialed.
    pub deny_list: Option<Netlist>,
    /// Emit per-message events.
    pub enable_msg_events: bool,
    /// How long a destination stays off-limits after a completed dial.
    pub dial_cooldown: Duration,
    /// Outbound socket factory; defaults to 15-second-timeout TCP.
    pub dialer: Option<Arc<dyn Dialer>>,
    /// Transport factory; defaults to the reference framed transport.
    pub transport: Option<Arc<dyn TransportFactory>>,
    /// Discovery table collaborator.
    pub discovery: Option<Arc<dyn DiscoveryTable>>,
    /// Topic-discovery table. Runs alongside the server and is closed
    /// with it; the dial scheduler draws only from `discovery`.
    pub discovery_v5: Option<Arc<dyn DiscoveryTable>>,
    /// NAT port mapper collaborator.
    pub nat: Option<Arc<dyn NatMapper>>,
    /// Node-observation sink collaborator.
    pub sink: Option<Arc<dyn NodeSink>>,
}

impl Config {
    /// A configuration with defaults for everything but the key.
    #[must_use]
    pub fn new(secret_key: SecretKey) -> Self {
        Self {
            secret_key,
            name: "trellisd".to_string(),
            max_peers: DEFAULT_MAX_PEERS,
            no_max_peers: false,
            max_dial: DEFAULT_MAX_DIAL,
            max_accept_conns: 0,
            max_pending_peers: 0,
            no_discovery: false,
            no_dial: false,
            listen_addr: None,
            protocols: Vec::new(),
            bootstrap_nodes: Vec::new(),
            static_nodes: Vec::new(),
            trusted_nodes: Vec::new(),
            net_restrict: None,
            deny_list: None,
            enable_msg_events: false,
            dial_cooldown: crate::dial::DIAL_HISTORY_EXPIRATION,
            dialer: None,
            transport: None,
            discovery: None,
            discovery_v5: None,
            nat: None,
            sink: None,
        }
    }

    /// Build a configuration from parsed CLI arguments and a loaded key.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed node URL or CIDR
    /// list.
    pub fn from_args(args: &Args, secret_key: SecretKey) -> Result<Self, String> {
        let parse_nodes = |urls: &[String], what: &str| -> Result<Vec<Node>, String> {
            urls.iter()
                .map(|u| {
                    u.parse::<Node>()
                        .map_err(|e| format!("invalid {what} node url {u:?}: {e}"))
                })
                .collect()
        };
        let parse_netlist = |s: &Option<String>, what: &str| -> Result<Option<Netlist>, String> {
            s.as_deref()
                .map(|s| {
                    s.parse::<Netlist>()
                        .map_err(|e| format!("invalid {what}: {e}"))
                })
                .transpose()
        };

        let mut config = Self::new(secret_key);
        config.name = args.name.clone();
        config.max_peers = args.max_peers;
        config.no_max_peers = args.no_max_peers;
        config.max_dial = args.max_dial;
        config.max_accept_conns = args.max_accept_conns;
        config.max_pending_peers = args.max_pending_peers;
        config.no_discovery = args.no_discovery;
        config.no_dial = args.no_dial;
        config.listen_addr = (!args.no_listen).then_some(args.listen);
        config.bootstrap_nodes = parse_nodes(&args.bootstrap_nodes, "bootstrap")?;
        config.static_nodes = parse_nodes(&args.static_nodes, "static")?;
        config.trusted_nodes = parse_nodes(&args.trusted_nodes, "trusted")?;
        config.net_restrict = parse_netlist(&args.net_restrict, "net-restrict")?;
        config.deny_list = parse_netlist(&args.deny_list, "deny-list")?;
        config.enable_msg_events = args.enable_msg_events;
        Ok(config)
    }

    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_peers == 0 && !self.no_max_peers {
            return Err("max_peers must be greater than 0".to_string());
        }
        if self.max_peers > 100_000 {
            return Err("max_peers exceeds reasonable limit (100,000)".to_string());
        }
        if self.max_dial > 1_000 {
            return Err("max_dial exceeds reasonable limit (1,000)".to_string());
        }
        if self.handshake_slots() > 10_000 {
            return Err("pending handshake slots exceed reasonable limit (10,000)".to_string());
        }
        Ok(())
    }

    /// Number of inbound handshake slots: the larger of the two
    /// configured caps, or the default when neither is set.
    #[must_use]
    pub fn handshake_slots(&self) -> usize {
        let slots = self.max_accept_conns.max(self.max_pending_peers);
        if slots == 0 {
            DEFAULT_PENDING_SLOTS
        } else {
            slots
        }
    }

    /// Target number of dynamically dialed peers: `max_dial` while
    /// discovery is available, zero otherwise.
    #[must_use]
    pub fn dyn_dial_target(&self) -> usize {
        if self.no_discovery || self.discovery.is_none() {
            0
        } else {
            self.max_dial
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("max_peers", &self.max_peers)
            .field("no_max_peers", &self.no_max_peers)
            .field("max_dial", &self.max_dial)
            .field("handshake_slots", &self.handshake_slots())
            .field("no_discovery", &self.no_discovery)
            .field("no_dial", &self.no_dial)
            .field("listen_addr", &self.listen_addr)
            .field("protocols", &self.protocols.len())
            .field("static_nodes", &self.static_nodes.len())
            .field("trusted_nodes", &self.trusted_nodes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::new(SecretKey::from_bytes(&[1u8; 32]).unwrap())
    }

    #[test]
    fn default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn zero_max_peers_is_rejected() {
        let mut c = valid_config();
        c.max_peers = 0;
        assert!(c.validate().unwrap_err().contains("max_peers"));
    }

    #[test]
    fn zero_max_peers_is_fine_with_no_max_peers() {
        let mut c = valid_config();
        c.max_peers = 0;
        c.no_max_peers = true;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn max_peers_too_large() {
        let mut c = valid_config();
        c.max_peers = 100_001;
        assert!(c.validate().unwrap_err().contains("max_peers"));
    }

    #[test]
    fn larger_handshake_slot_cap_wins() {
        let mut c = valid_config();
        c.max_accept_conns = 10;
        c.max_pending_peers = 40;
        assert_eq!(c.handshake_slots(), 40);
        c.max_accept_conns = 80;
        assert_eq!(c.handshake_slots(), 80);
    }

    #[test]
    fn handshake_slots_default_when_unset() {
        assert_eq!(valid_config().handshake_slots(), DEFAULT_PENDING_SLOTS);
    }

    #[test]
    fn dyn_dial_target_is_zero_without_discovery() {
        let c = valid_config();
        // No discovery table configured.
        assert_eq!(c.dyn_dial_target(), 0);
    }
}
