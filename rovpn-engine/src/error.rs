//! Error types for the VPN engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the control-plane caller.
///
/// Data-path problems (malformed packets, auth failures, replay) are
/// resolved locally by dropping the packet and never show up here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ovpn_protocol::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer {id} already exists")]
    PeerAlreadyExists { id: u32 },

    #[error("peer {id} not found")]
    PeerNotFound { id: u32 },

    #[error("peer id {id} outside the 24-bit wire range")]
    InvalidPeerId { id: u32 },

    #[error("peer has no transport attached")]
    NoTransport,

    #[error("no key slot carries key id {key_id}")]
    KeyNotFound { key_id: u8 },

    #[error("a send is already in flight on this connection")]
    TxBusy,

    #[error("a transport is already attached to this peer")]
    SocketBusy,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
