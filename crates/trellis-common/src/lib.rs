//! Common types shared across the trellis overlay stack.
//!
//! This crate provides:
//! - Node identity and addressing ([`node`])
//! - Secret-key handling ([`identity`])
//! - Sub-protocol capability pairs ([`caps`])
//! - Wire disconnect reasons ([`disconnect`])
//! - IP network allow/deny lists ([`netlist`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod caps;
pub mod disconnect;
pub mod identity;
pub mod netlist;
pub mod node;

pub use caps::Cap;
pub use disconnect::DisconnectReason;
pub use identity::SecretKey;
pub use netlist::Netlist;
pub use node::{Node, NodeId};
