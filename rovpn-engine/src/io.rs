//! The per-packet encrypt/decrypt pipeline
//!
//! Both directions are split into a submit half and a completion half. The
//! completion half takes a [`CryptoOutcome`] and returns immediately on
//! [`CryptoOutcome::Pending`]: the bundled cipher backends complete
//! synchronously, but an offload backend re-enters the completion half
//! from its callback with the final result, and everything after the
//! crypto operation lives in that half.
//!
//! Per-packet failures drop that packet and bump a counter; they never
//! abort sibling packets of the same batch and never panic the data path.

use std::sync::Arc;

use ovpn_protocol::{is_keepalive, key_id_from, KeySlot, EXPLICIT_EXIT_NOTIFY_FIRST_BYTE};

use crate::instance::InstanceState;
use crate::ip;
use crate::peer::{DelPeerReason, Peer, Transport};

/// Result of an AEAD operation as seen by the completion half
pub(crate) enum CryptoOutcome {
    /// Operation still running on an async backend; the completion half
    /// will be re-entered later with the real result
    Pending,
    Done(ovpn_protocol::Result<Vec<u8>>),
}

/// Encrypt a batch of tunnel packets and hand them to their peers'
/// transports.
///
/// With `explicit_peer` unset each packet independently resolves its peer
/// from the destination address, so one bad packet never affects its
/// siblings.
pub(crate) fn send_many(
    state: &Arc<InstanceState>,
    packets: &[Vec<u8>],
    explicit_peer: Option<&Arc<Peer>>,
) {
    for pkt in packets {
        if ip::version(pkt).is_none() {
            log::debug!("dropping malformed payload packet");
            state.tx_dropped();
            continue;
        }

        let peer = match explicit_peer {
            Some(p) => p.clone(),
            None => {
                let Some(peer) = ip::dst_addr(pkt)
                    .and_then(|dst| state.registry.get_by_dst(dst, state.route.as_ref()))
                else {
                    log::debug!("no peer to send data to");
                    state.tx_dropped();
                    continue;
                };
                peer
            }
        };

        if !encrypt_one(state, &peer, pkt) {
            state.tx_dropped();
        }
    }
}

/// Transmit an in-band message (keepalive, exit notification) through the
/// normal encrypt path
pub(crate) fn xmit_special(state: &Arc<InstanceState>, peer: &Arc<Peer>, payload: &[u8]) {
    if !encrypt_one(state, peer, payload) {
        state.tx_dropped();
    }
}

fn encrypt_one(state: &Arc<InstanceState>, peer: &Arc<Peer>, payload: &[u8]) -> bool {
    let Some(ks) = peer.crypto.primary() else {
        log::warn!("peer {}: no primary key slot, dropping packet", peer.id());
        return false;
    };

    let outcome = CryptoOutcome::Done(ks.encapsulate(peer.id(), payload));
    encrypt_post(state, peer, &ks, payload.len(), outcome)
}

/// Completion half of the transmit path: statistics and transport hand-off
pub(crate) fn encrypt_post(
    state: &Arc<InstanceState>,
    peer: &Arc<Peer>,
    ks: &Arc<KeySlot>,
    orig_len: usize,
    outcome: CryptoOutcome,
) -> bool {
    let CryptoOutcome::Done(result) = outcome else {
        return true;
    };

    let wire = match result {
        Ok(wire) => wire,
        Err(ovpn_protocol::Error::IdExhausted) => {
            log::error!(
                "peer {}: key {} out of transmit ids, rekey required",
                peer.id(),
                ks.key_id()
            );
            state.events.key_exhausted(peer.id(), ks.key_id());
            return false;
        }
        Err(e) => {
            log::debug!("peer {}: encrypt failed: {e}", peer.id());
            return false;
        }
    };

    let sent = peer.with_transport(|transport| match transport {
        Some(Transport::Udp(sock)) => {
            let Some(remote) = peer.remote() else {
                log::debug!("peer {}: no remote endpoint bound", peer.id());
                return false;
            };
            match sock.try_send_to(&wire, remote) {
                Ok(_) => true,
                Err(e) => {
                    log::debug!("peer {}: udp send failed: {e}", peer.id());
                    false
                }
            }
        }
        Some(Transport::Tcp(tcp)) => match tcp.send_frame(&wire) {
            Ok(()) => true,
            Err(e) => {
                // single outstanding message per stream; the caller
                // retries on the next write opportunity
                log::debug!("peer {}: tcp send deferred: {e}", peer.id());
                false
            }
        },
        None => {
            log::debug!("peer {}: no transport configured yet", peer.id());
            false
        }
    });

    if sent {
        peer.link_stats.tx_add(wire.len());
        peer.vpn_stats.tx_add(orig_len);
        peer.on_sent();
    }
    sent
}

/// Decrypt one wire packet arriving on a transport
pub(crate) fn recv(state: &Arc<InstanceState>, peer: &Arc<Peer>, wire: &[u8]) {
    let Ok(key_id) = key_id_from(wire) else {
        state.rx_dropped();
        return;
    };

    // pick the slot matching the wire key id, whichever of the two it is
    let Some(ks) = peer.crypto.slot_for_key_id(key_id) else {
        log::debug!(
            "peer {}: no available key for key-id {key_id}",
            peer.id()
        );
        state.rx_dropped();
        return;
    };

    let outcome = CryptoOutcome::Done(ks.decapsulate(wire));
    decrypt_post(state, peer, wire.len(), outcome);
}

/// Completion half of the receive path: liveness, sentinel handling,
/// protocol sniff, reverse-path filter, injection
pub(crate) fn decrypt_post(
    state: &Arc<InstanceState>,
    peer: &Arc<Peer>,
    orig_len: usize,
    outcome: CryptoOutcome,
) {
    let CryptoOutcome::Done(result) = outcome else {
        return;
    };

    let plaintext = match result {
        Ok(pt) => pt,
        Err(e) => {
            log::debug!("peer {}: decrypt failed: {e}", peer.id());
            state.rx_dropped();

            // a corrupted byte stream cannot be resynchronized
            if peer.is_tcp() {
                log::warn!(
                    "peer {}: tearing down tcp transport after decrypt failure",
                    peer.id()
                );
                let _ = state.registry.del(peer, DelPeerReason::TransportError);
            }
            return;
        }
    };

    peer.on_recv();

    if is_keepalive(&plaintext) {
        log::debug!("ping received from peer {}", peer.id());
        return;
    }

    if plaintext.first() == Some(&EXPLICIT_EXIT_NOTIFY_FIRST_BYTE) {
        // exit handling belongs to the control plane
        log::debug!("exit notification received from peer {}", peer.id());
        state.rx_dropped();
        return;
    }

    let Some(src) = ip::src_addr(&plaintext) else {
        log::debug!("unsupported protocol received from peer {}", peer.id());
        state.rx_dropped();
        return;
    };

    if !state.registry.check_by_src(src, peer, state.route.as_ref()) {
        log::debug!("rpf dropped packet from peer {}, src {src}", peer.id());
        state.rx_dropped();
        return;
    }

    peer.vpn_stats.rx_add(plaintext.len());
    peer.link_stats.rx_add(orig_len);

    state.tun.inject(&plaintext);
}
