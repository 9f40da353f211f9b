//! Peer registry for both topologies
//!
//! Point-to-point keeps a single peer slot; multi-peer keeps three indices
//! over the shared peer pool (by id, by tunnel address, by transport
//! address). Structural mutations take the registry-wide write lock;
//! lookups run under the read lock and re-validate the candidate against
//! the exact key before handing out a reference, so a reader racing a
//! delete or a float either gets a fully consistent peer or nothing.
//!
//! A peer's own scalar state (binding, timestamps) lives under the peer's
//! lock, which nests *outside* the table lock: `float` holds the binding
//! lock while rehashing, and nothing ever takes a binding lock while
//! holding the table lock.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Mode;
use crate::peer::{DelPeerReason, Peer};
use crate::{Error, Result};

/// Nexthop resolution for tunnel addresses.
///
/// The host routing table is an external collaborator; the default
/// resolves every address to itself, which is also what the routing table
/// answers when no gateway route exists.
pub trait RouteLookup: Send + Sync {
    fn nexthop(&self, dst: IpAddr) -> IpAddr;
}

/// Identity nexthop resolution
pub struct DirectRoute;

impl RouteLookup for DirectRoute {
    fn nexthop(&self, dst: IpAddr) -> IpAddr {
        dst
    }
}

#[derive(Default)]
struct MpTables {
    by_id: HashMap<u32, Arc<Peer>>,
    by_vpn_addr: HashMap<IpAddr, Arc<Peer>>,
    by_transp_addr: HashMap<SocketAddr, Arc<Peer>>,
}

pub(crate) enum PeerRegistry {
    P2p(RwLock<Option<Arc<Peer>>>),
    Mp(RwLock<MpTables>),
}

impl PeerRegistry {
    pub(crate) fn new(mode: Mode) -> Self {
        match mode {
            Mode::P2p => PeerRegistry::P2p(RwLock::new(None)),
            Mode::MultiPeer => PeerRegistry::Mp(RwLock::new(MpTables::default())),
        }
    }

    /// Hash a peer into the registry.
    ///
    /// In P2P mode the new peer replaces any existing one, which is torn
    /// down with reason [`DelPeerReason::Teardown`]. In multi-peer mode a
    /// duplicate id is rejected.
    pub(crate) fn add(&self, peer: Arc<Peer>) -> Result<()> {
        match self {
            PeerRegistry::P2p(slot) => {
                let old = {
                    let mut slot = slot.write();
                    slot.replace(peer.clone())
                };
                if let Some(old) = old {
                    old.set_delete_reason(DelPeerReason::Teardown);
                    old.detach_transport();
                }
                peer.mark_hashed();
                Ok(())
            }
            PeerRegistry::Mp(tables) => {
                // the peer is not yet visible, its binding is ours to read
                let remote = peer.remote();

                let mut t = tables.write();
                if t.by_id.contains_key(&peer.id()) {
                    return Err(Error::PeerAlreadyExists { id: peer.id() });
                }

                t.by_id.insert(peer.id(), peer.clone());

                // peers on stream transports carry no binding
                if let Some(remote) = remote {
                    t.by_transp_addr.insert(remote, peer.clone());
                    *peer.transp_key.lock() = Some(remote);
                }

                for addr in peer.vpn_addrs().iter() {
                    t.by_vpn_addr.insert(addr, peer.clone());
                }

                peer.mark_hashed();
                Ok(())
            }
        }
    }

    /// Unhash a peer from every index and record its delete reason.
    ///
    /// The peer stays alive for any in-flight processing that already
    /// holds a reference; final release happens when the last reference
    /// drops.
    pub(crate) fn del(&self, peer: &Arc<Peer>, reason: DelPeerReason) -> Result<()> {
        match self {
            PeerRegistry::P2p(slot) => {
                {
                    let mut slot = slot.write();
                    match &*slot {
                        Some(cur) if Arc::ptr_eq(cur, peer) => *slot = None,
                        _ => return Err(Error::PeerNotFound { id: peer.id() }),
                    }
                }
            }
            PeerRegistry::Mp(tables) => {
                let mut t = tables.write();
                match t.by_id.get(&peer.id()) {
                    Some(cur) if Arc::ptr_eq(cur, peer) => {}
                    _ => return Err(Error::PeerNotFound { id: peer.id() }),
                }
                t.by_id.remove(&peer.id());

                for addr in peer.vpn_addrs().iter() {
                    if t.by_vpn_addr.get(&addr).is_some_and(|p| Arc::ptr_eq(p, peer)) {
                        t.by_vpn_addr.remove(&addr);
                    }
                }

                let key = peer.transp_key.lock().take();
                if let Some(key) = key {
                    if t.by_transp_addr.get(&key).is_some_and(|p| Arc::ptr_eq(p, peer)) {
                        t.by_transp_addr.remove(&key);
                    }
                }
            }
        }

        peer.set_delete_reason(reason);
        peer.detach_transport();
        Ok(())
    }

    pub(crate) fn get_by_id(&self, id: u32) -> Option<Arc<Peer>> {
        match self {
            PeerRegistry::P2p(slot) => slot.read().clone().filter(|p| p.id() == id),
            PeerRegistry::Mp(tables) => tables
                .read()
                .by_id
                .get(&id)
                .filter(|p| p.id() == id)
                .cloned(),
        }
    }

    /// Resolve a peer from an inbound packet's transport source address
    pub(crate) fn get_by_transp_addr(&self, src: &SocketAddr) -> Option<Arc<Peer>> {
        let candidate = match self {
            PeerRegistry::P2p(slot) => slot.read().clone(),
            PeerRegistry::Mp(tables) => tables.read().by_transp_addr.get(src).cloned(),
        };

        // the binding may have floated since the entry was hashed
        candidate.filter(|p| p.bind_src_match(src))
    }

    pub(crate) fn get_by_vpn_addr(&self, addr: &IpAddr) -> Option<Arc<Peer>> {
        match self {
            PeerRegistry::P2p(slot) => slot.read().clone(),
            PeerRegistry::Mp(tables) => tables
                .read()
                .by_vpn_addr
                .get(addr)
                .filter(|p| p.vpn_addrs().contains(addr))
                .cloned(),
        }
    }

    /// Resolve the peer serving an outgoing packet's destination.
    ///
    /// In P2P mode every packet goes to the single peer, no matter the
    /// destination.
    pub(crate) fn get_by_dst(&self, dst: IpAddr, route: &dyn RouteLookup) -> Option<Arc<Peer>> {
        match self {
            PeerRegistry::P2p(slot) => slot.read().clone(),
            PeerRegistry::Mp(_) => self.get_by_vpn_addr(&route.nexthop(dst)),
        }
    }

    /// Reverse-path check: is `peer` the peer we would route a reply to
    /// `src` through?
    pub(crate) fn check_by_src(
        &self,
        src: IpAddr,
        peer: &Arc<Peer>,
        route: &dyn RouteLookup,
    ) -> bool {
        match self {
            PeerRegistry::P2p(slot) => slot
                .read()
                .as_ref()
                .is_some_and(|cur| Arc::ptr_eq(cur, peer)),
            PeerRegistry::Mp(_) => self
                .get_by_vpn_addr(&route.nexthop(src))
                .is_some_and(|cur| Arc::ptr_eq(&cur, peer)),
        }
    }

    /// Re-bind a peer to a newly observed remote address.
    ///
    /// No-op when the source already matches the binding or the peer has
    /// no binding at all (stream transports). In multi-peer mode the
    /// transport-address index entry moves to the new key.
    pub(crate) fn float(&self, peer: &Arc<Peer>, remote: SocketAddr) {
        let mut bind = peer.bind_lock();
        let Some(cur) = bind.as_ref() else {
            return;
        };
        if cur.src_match(&remote) {
            return;
        }

        log::debug!("peer {} floated to {remote}", peer.id());
        *bind = Some(cur.floated(remote));

        // rehashing is only needed in MP mode; P2P has no index to move
        if let PeerRegistry::Mp(tables) = self {
            let mut t = tables.write();
            let mut key = peer.transp_key.lock();
            if let Some(old) = key.take() {
                if t.by_transp_addr.get(&old).is_some_and(|p| Arc::ptr_eq(p, peer)) {
                    t.by_transp_addr.remove(&old);
                }
            }
            t.by_transp_addr.insert(remote, peer.clone());
            *key = Some(remote);
        }
    }

    /// Snapshot every hashed peer (keepalive walk, teardown)
    pub(crate) fn peers(&self) -> Vec<Arc<Peer>> {
        match self {
            PeerRegistry::P2p(slot) => slot.read().iter().cloned().collect(),
            PeerRegistry::Mp(tables) => tables.read().by_id.values().cloned().collect(),
        }
    }

    /// Unhash every peer with the given reason (instance teardown)
    pub(crate) fn release_all(&self, reason: DelPeerReason) {
        for peer in self.peers() {
            let _ = self.del(&peer, reason);
        }
    }
}
