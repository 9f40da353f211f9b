//! Peer objects and per-peer state
//!
//! A peer represents one remote tunnel endpoint. It owns its crypto state,
//! its transport binding, its liveness timestamps and its traffic counters.
//! Peers are handed around as `Arc<Peer>`: the registry indices hold one
//! reference each, in-flight packet processing holds short-lived ones, and
//! the teardown notification fires from the destructor once the last
//! reference is gone.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ovpn_protocol::CryptoState;
use parking_lot::{Mutex, MutexGuard};

use crate::bind::Binding;
use crate::event::EventHandler;
use crate::socket::OvpnSocket;
use crate::tcp::TcpTransport;

/// Why a peer was removed; carried on the delete notification so the
/// control plane can react (reconnect, clean up, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelPeerReason {
    /// Instance or peer torn down administratively
    Teardown,
    /// Removed on explicit control-plane request
    Userspace,
    /// Receive timeout elapsed without traffic
    Expired,
    /// Transport-level failure (socket error, stream desync)
    TransportError,
    /// Remote closed the transport connection
    TransportDisconnect,
}

/// Plain-value copy of one traffic counter pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Byte and packet counters for one direction pair.
///
/// Updated with relaxed ordering: no cross-peer or cross-counter ordering
/// is promised.
#[derive(Debug, Default)]
pub struct PeerStats {
    rx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
}

impl PeerStats {
    pub fn rx_add(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_add(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
        }
    }
}

/// Tunnel-internal addresses assigned to a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VpnAddrs {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl VpnAddrs {
    pub(crate) fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(a) => self.ipv4 == Some(*a),
            IpAddr::V6(a) => self.ipv6 == Some(*a),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.ipv6.map(IpAddr::V6))
    }
}

/// The transport a peer transmits over
pub(crate) enum Transport {
    /// Shared UDP socket, possibly serving many peers
    Udp(Arc<OvpnSocket>),
    /// Dedicated stream connection
    Tcp(Arc<TcpTransport>),
}

#[derive(Debug)]
pub(crate) struct KeepaliveState {
    interval: Option<Duration>,
    timeout: Option<Duration>,
    last_recv: Instant,
    last_sent: Instant,
    recv_exp: Instant,
    xmit_exp: Instant,
}

/// Outcome of one keepalive evaluation for a single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveTick {
    /// Timers not configured; contributes no deadline
    Unconfigured,
    /// Receive timeout elapsed, the peer is dead
    Expired,
    /// Peer is alive; `next` is its nearest deadline
    Live { next: Instant, xmit_due: bool },
}

pub(crate) struct Peer {
    id: u32,
    vpn_addrs: VpnAddrs,
    bind: Mutex<Option<Binding>>,
    /// Key this peer is currently hashed under in the transport-address
    /// index; updated only under the registry write lock
    pub(crate) transp_key: Mutex<Option<SocketAddr>>,
    pub(crate) crypto: CryptoState,
    transport: Mutex<Option<Transport>>,
    keepalive: Mutex<KeepaliveState>,
    delete_reason: Mutex<Option<DelPeerReason>>,
    hashed: AtomicBool,
    pub(crate) vpn_stats: PeerStats,
    pub(crate) link_stats: PeerStats,
    events: Arc<dyn EventHandler>,
}

impl Peer {
    pub(crate) fn new(
        id: u32,
        vpn_addrs: VpnAddrs,
        remote: Option<SocketAddr>,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            vpn_addrs,
            bind: Mutex::new(remote.map(Binding::new)),
            transp_key: Mutex::new(None),
            crypto: CryptoState::new(),
            transport: Mutex::new(None),
            keepalive: Mutex::new(KeepaliveState {
                interval: None,
                timeout: None,
                last_recv: now,
                last_sent: now,
                recv_exp: now,
                xmit_exp: now,
            }),
            delete_reason: Mutex::new(None),
            hashed: AtomicBool::new(false),
            vpn_stats: PeerStats::default(),
            link_stats: PeerStats::default(),
            events,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn vpn_addrs(&self) -> &VpnAddrs {
        &self.vpn_addrs
    }

    pub(crate) fn bind_lock(&self) -> MutexGuard<'_, Option<Binding>> {
        self.bind.lock()
    }

    /// Current remote endpoint, if any
    pub(crate) fn remote(&self) -> Option<SocketAddr> {
        self.bind.lock().as_ref().map(|b| b.remote)
    }

    /// Check an inbound packet source against the current binding
    pub(crate) fn bind_src_match(&self, src: &SocketAddr) -> bool {
        self.bind
            .lock()
            .as_ref()
            .is_some_and(|b| b.src_match(src))
    }

    /// Learn the local address used to reach this peer from the
    /// destination of an inbound packet
    pub(crate) fn update_local_endpoint(&self, local: IpAddr) {
        let mut bind = self.bind.lock();
        if let Some(b) = bind.as_mut() {
            if b.local != Some(local) {
                log::debug!(
                    "peer {}: learning local address {:?} -> {}",
                    self.id,
                    b.local,
                    local
                );
                b.local = Some(local);
            }
        }
    }

    pub(crate) fn set_transport(&self, transport: Transport) -> crate::Result<()> {
        let mut slot = self.transport.lock();
        if slot.is_some() {
            return Err(crate::Error::SocketBusy);
        }
        *slot = Some(transport);
        Ok(())
    }

    pub(crate) fn with_transport<R>(
        &self,
        f: impl FnOnce(Option<&Transport>) -> R,
    ) -> R {
        f(self.transport.lock().as_ref())
    }

    pub(crate) fn is_tcp(&self) -> bool {
        matches!(&*self.transport.lock(), Some(Transport::Tcp(_)))
    }

    pub(crate) fn tcp_transport(&self) -> Option<Arc<TcpTransport>> {
        match &*self.transport.lock() {
            Some(Transport::Tcp(t)) => Some(t.clone()),
            _ => None,
        }
    }

    /// Drop the transport and cancel any async work tied to it.
    ///
    /// Called from the unhash path; idempotent.
    pub(crate) fn detach_transport(&self) {
        if let Some(Transport::Tcp(t)) = self.transport.lock().take() {
            t.detach();
        }
    }

    /// Record why this peer is going away. Only the first reason sticks.
    pub(crate) fn set_delete_reason(&self, reason: DelPeerReason) {
        let mut slot = self.delete_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub(crate) fn mark_hashed(&self) {
        self.hashed.store(true, Ordering::Release);
    }

    /// Configure the keepalive timers; zero disables either side
    pub(crate) fn keepalive_set(&self, interval: Duration, timeout: Duration) {
        let now = Instant::now();
        let mut ks = self.keepalive.lock();

        log::debug!(
            "peer {}: scheduling keepalive: interval={interval:?} timeout={timeout:?}",
            self.id
        );

        ks.interval = (!interval.is_zero()).then_some(interval);
        ks.last_sent = now;
        ks.xmit_exp = now + interval;

        ks.timeout = (!timeout.is_zero()).then_some(timeout);
        ks.last_recv = now;
        ks.recv_exp = now + timeout;
    }

    pub(crate) fn on_recv(&self) {
        self.keepalive.lock().last_recv = Instant::now();
    }

    pub(crate) fn on_sent(&self) {
        self.keepalive.lock().last_sent = Instant::now();
    }

    /// Evaluate both keepalive timers against `now`.
    ///
    /// Expiry wins over a due transmit: a dead peer sends nothing and
    /// contributes no deadline.
    pub(crate) fn keepalive_tick(&self, now: Instant) -> KeepaliveTick {
        let mut ks = self.keepalive.lock();

        let (Some(timeout), Some(interval)) = (ks.timeout, ks.interval) else {
            return KeepaliveTick::Unconfigured;
        };

        let next_recv;
        let delta = now.saturating_duration_since(ks.last_recv);
        if delta < timeout {
            ks.recv_exp = now + (timeout - delta);
            next_recv = ks.recv_exp;
        } else if ks.recv_exp > now {
            next_recv = ks.recv_exp;
        } else {
            return KeepaliveTick::Expired;
        }

        let mut xmit_due = false;
        let next_xmit;
        let delta = now.saturating_duration_since(ks.last_sent);
        if delta < interval {
            ks.xmit_exp = now + (interval - delta);
            next_xmit = ks.xmit_exp;
        } else if ks.xmit_exp > now {
            next_xmit = ks.xmit_exp;
        } else {
            xmit_due = true;
            next_xmit = now + interval;
        }

        KeepaliveTick::Live {
            next: next_recv.min(next_xmit),
            xmit_due,
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        // Last reference is gone. Peers that never made it into the
        // registry (rejected duplicates) disappear silently.
        if self.hashed.load(Ordering::Acquire) {
            let reason = self
                .delete_reason
                .lock()
                .unwrap_or(DelPeerReason::Teardown);
            self.events.peer_deleted(self.id, reason);
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("vpn_addrs", &self.vpn_addrs)
            .finish_non_exhaustive()
    }
}
