//! Wire-level disconnect reasons.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason codes sent to the remote before a connection is closed.
///
/// Admission rejections map onto these one-to-one; the numeric code is
/// what travels in the disconnect frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Disconnect was requested locally by the operator.
    #[error("disconnect requested")]
    Requested = 0x00,
    /// Underlying network error.
    #[error("network error")]
    TcpError = 0x01,
    /// The remote violated the wire protocol.
    #[error("breach of protocol")]
    ProtocolBreach = 0x02,
    /// No shared sub-protocol capability.
    #[error("useless peer")]
    UselessPeer = 0x03,
    /// The peer cap is saturated.
    #[error("too many peers")]
    TooManyPeers = 0x04,
    /// A peer with this identifier is already connected.
    #[error("already connected")]
    AlreadyConnected = 0x05,
    /// Incompatible base protocol version.
    #[error("incompatible protocol version")]
    IncompatibleVersion = 0x06,
    /// The remote presented an invalid identity.
    #[error("invalid identity")]
    InvalidIdentity = 0x07,
    /// The server is shutting down.
    #[error("server quitting")]
    QuittingServer = 0x08,
    /// The identity did not match the one expected or previously seen.
    #[error("unexpected identity")]
    UnexpectedIdentity = 0x09,
    /// The connection is to our own identifier.
    #[error("connected to self")]
    SelfConnect = 0x0a,
    /// The remote was idle past the read deadline.
    #[error("read timeout")]
    ReadTimeout = 0x0b,
    /// Some other reason, carried for forward compatibility.
    #[error("unknown disconnect reason")]
    Other = 0x10,
}

impl DisconnectReason {
    /// The numeric wire code.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code, mapping unknown codes to [`Self::Other`].
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Requested,
            0x01 => Self::TcpError,
            0x02 => Self::ProtocolBreach,
            0x03 => Self::UselessPeer,
            0x04 => Self::TooManyPeers,
            0x05 => Self::AlreadyConnected,
            0x06 => Self::IncompatibleVersion,
            0x07 => Self::InvalidIdentity,
            0x08 => Self::QuittingServer,
            0x09 => Self::UnexpectedIdentity,
            0x0a => Self::SelfConnect,
            0x0b => Self::ReadTimeout,
            _ => Self::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for reason in [
            DisconnectReason::Requested,
            DisconnectReason::TcpError,
            DisconnectReason::ProtocolBreach,
            DisconnectReason::UselessPeer,
            DisconnectReason::TooManyPeers,
            DisconnectReason::AlreadyConnected,
            DisconnectReason::IncompatibleVersion,
            DisconnectReason::InvalidIdentity,
            DisconnectReason::QuittingServer,
            DisconnectReason::UnexpectedIdentity,
            DisconnectReason::SelfConnect,
            DisconnectReason::ReadTimeout,
        ] {
            assert_eq!(DisconnectReason::from_code(reason.code()), reason);
        }
    }

    #[test]
    fn unknown_codes_become_other() {
        assert_eq!(DisconnectReason::from_code(0x77), DisconnectReason::Other);
    }

    #[test]
    fn admission_rejections_have_messages() {
        assert_eq!(DisconnectReason::TooManyPeers.to_string(), "too many peers");
        assert_eq!(
            DisconnectReason::AlreadyConnected.to_string(),
            "already connected"
        );
        assert_eq!(
            DisconnectReason::SelfConnect.to_string(),
            "connected to self"
        );
        assert_eq!(DisconnectReason::UselessPeer.to_string(), "useless peer");
    }
}
