//! VPN data-plane engine
//!
//! This crate drives the data channel implemented by `ovpn-protocol`: it
//! owns the peers, routes packets to them, multiplexes the transport
//! sockets and keeps per-peer liveness state.
//!
//! An [`Instance`] is created in one of two topologies: point-to-point
//! (exactly one remote) or multi-peer (many remotes multiplexed over one
//! shared UDP socket, or one TCP connection each). Peers and key material
//! arrive from a trusted control plane through the `Instance` API; the
//! engine itself never negotiates keys.
//!
//! Packets entering through [`Instance::send`] are encrypted and handed to
//! the owning peer's transport; packets arriving on a transport are
//! decrypted, checked against the reverse-path filter and injected into the
//! [`tun::TunSink`] collaborator.

mod bind;
pub mod config;
mod error;
pub mod event;
mod instance;
mod io;
mod ip;
mod keepalive;
mod peer;
mod registry;
mod socket;
mod tcp;
pub mod tun;

pub use config::{Config, Mode};
pub use error::{Error, Result};
pub use event::{EventHandler, LoggingEventHandler};
pub use instance::{Instance, PeerConfig};
pub use peer::{DelPeerReason, StatsSnapshot};
pub use registry::{DirectRoute, RouteLookup};

pub use ovpn_protocol::{CipherAlg, KeyConfig, KeyDirection};
