//! Notifications surfaced to the control plane

use crate::peer::DelPeerReason;

/// Callbacks for events the control plane needs to observe.
///
/// Handlers run on data-path and scheduler contexts; implementations must
/// be cheap and non-blocking.
pub trait EventHandler: Send + Sync {
    /// A peer was torn down. Fires exactly once per peer, after the last
    /// in-flight reference has been released.
    fn peer_deleted(&self, _peer_id: u32, _reason: DelPeerReason) {}

    /// A key slot ran out of transmit packet IDs and must be rekeyed
    /// before the peer can transmit again.
    fn key_exhausted(&self, _peer_id: u32, _key_id: u8) {}
}

/// Default handler that just logs every event
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn peer_deleted(&self, peer_id: u32, reason: DelPeerReason) {
        log::info!("peer {peer_id} deleted: {reason:?}");
    }

    fn key_exhausted(&self, peer_id: u32, key_id: u8) {
        log::warn!("peer {peer_id}: key {key_id} exhausted, rekey required");
    }
}
