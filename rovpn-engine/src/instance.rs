//! The per-tunnel instance and its control-plane API
//!
//! An [`Instance`] bundles the registry, the transports, the injection
//! seam and the keepalive scheduler for one tunnel. The methods on it are
//! the boundary the (external, trusted) control plane drives: peer and key
//! CRUD, socket attachment, keepalive configuration. Everything arriving
//! here is already negotiated and authenticated out of band.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ovpn_protocol::{KeyConfig, KeySlot, PEER_ID_MASK, PEER_ID_UNDEF};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{Config, Mode};
use crate::event::{EventHandler, LoggingEventHandler};
use crate::io;
use crate::keepalive;
use crate::peer::{DelPeerReason, Peer, StatsSnapshot, Transport, VpnAddrs};
use crate::registry::{DirectRoute, PeerRegistry, RouteLookup};
use crate::socket::OvpnSocket;
use crate::tcp::TcpTransport;
use crate::tun::TunSink;
use crate::{Error, Result};

/// Control-plane description of a new peer
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// Unique 24-bit peer id
    pub id: u32,
    /// Tunnel-internal IPv4 address
    pub vpn_ipv4: Option<Ipv4Addr>,
    /// Tunnel-internal IPv6 address
    pub vpn_ipv6: Option<Ipv6Addr>,
    /// Remote transport endpoint; absent for peers attached over TCP,
    /// where the connection itself identifies the peer
    pub remote: Option<SocketAddr>,
}

#[derive(Default)]
struct DropCounters {
    tx: AtomicU64,
    rx: AtomicU64,
}

pub(crate) struct InstanceState {
    pub(crate) config: Config,
    pub(crate) registry: PeerRegistry,
    pub(crate) route: Box<dyn RouteLookup>,
    pub(crate) tun: Arc<dyn TunSink>,
    pub(crate) events: Arc<dyn EventHandler>,
    pub(crate) keepalive_kick: Arc<Notify>,
    halted: AtomicBool,
    udp: Mutex<Option<Arc<OvpnSocket>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    drops: DropCounters,
}

impl InstanceState {
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn tx_dropped(&self) {
        self.drops.tx.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_dropped(&self) {
        self.drops.rx.fetch_add(1, Ordering::Relaxed);
    }
}

/// One tunnel instance.
///
/// Dropping the instance tears everything down; [`Instance::shutdown`]
/// does the same explicitly.
pub struct Instance {
    state: Arc<InstanceState>,
}

impl Instance {
    /// Create an instance with the default collaborators (logging events,
    /// identity routing).
    ///
    /// Must be called inside a tokio runtime: the keepalive scheduler is
    /// spawned here.
    pub fn new(config: Config, tun: Arc<dyn TunSink>) -> Result<Self> {
        Self::with_collaborators(config, tun, Arc::new(LoggingEventHandler), Box::new(DirectRoute))
    }

    /// Create an instance with explicit event and routing collaborators
    pub fn with_collaborators(
        config: Config,
        tun: Arc<dyn TunSink>,
        events: Arc<dyn EventHandler>,
        route: Box<dyn RouteLookup>,
    ) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(InstanceState {
            registry: PeerRegistry::new(config.mode),
            config,
            route,
            tun,
            events,
            keepalive_kick: Arc::new(Notify::new()),
            halted: AtomicBool::new(false),
            udp: Mutex::new(None),
            keepalive_task: Mutex::new(None),
            drops: DropCounters::default(),
        });

        *state.keepalive_task.lock() = Some(keepalive::spawn(&state));

        Ok(Self { state })
    }

    pub fn mode(&self) -> Mode {
        self.state.config.mode
    }

    /// Bind a fresh UDP socket and attach it as this instance's shared
    /// transport. Returns the bound local address.
    pub fn udp_bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;

        self.udp_attach(socket.into())
    }

    /// Attach an already-bound UDP socket.
    ///
    /// One UDP socket legitimately serves every peer of the instance, so
    /// attaching while a socket is already present reuses the existing
    /// one and reports its address.
    pub fn udp_attach(&self, socket: std::net::UdpSocket) -> Result<SocketAddr> {
        let mut slot = self.state.udp.lock();
        if let Some(existing) = &*slot {
            return Ok(existing.local_addr());
        }

        let sock = OvpnSocket::attach(&self.state, socket)?;
        let addr = sock.local_addr();
        *slot = Some(sock);
        Ok(addr)
    }

    /// Create a peer and hash it into the registry.
    ///
    /// Peers with a remote endpoint transmit over the instance's UDP
    /// socket (attach one first); peers without get their transport from
    /// a later [`Instance::tcp_attach`].
    pub fn peer_new(&self, cfg: PeerConfig) -> Result<()> {
        if cfg.id > PEER_ID_MASK || cfg.id == PEER_ID_UNDEF {
            return Err(Error::InvalidPeerId { id: cfg.id });
        }

        let peer = Peer::new(
            cfg.id,
            VpnAddrs {
                ipv4: cfg.vpn_ipv4,
                ipv6: cfg.vpn_ipv6,
            },
            cfg.remote,
            self.state.events.clone(),
        );

        if cfg.remote.is_some() {
            if let Some(sock) = self.state.udp.lock().clone() {
                peer.set_transport(Transport::Udp(sock))?;
            }
        }

        self.state.registry.add(peer.clone())?;
        log::info!("peer {} added", cfg.id);

        if let Some((interval, timeout)) = self.state.config.keepalive() {
            peer.keepalive_set(interval, timeout);
        }
        self.state.keepalive_kick.notify_one();

        Ok(())
    }

    /// Remove a peer on control-plane request
    pub fn peer_del(&self, peer_id: u32) -> Result<()> {
        let peer = self.peer(peer_id)?;
        self.state.registry.del(&peer, DelPeerReason::Userspace)
    }

    /// Flush every peer, keeping the instance and its transports up
    pub fn peers_free(&self) {
        self.state.registry.release_all(DelPeerReason::Userspace);
    }

    /// Configure a peer's keepalive timers; zero durations disable them
    pub fn keepalive_set(&self, peer_id: u32, interval: Duration, timeout: Duration) -> Result<()> {
        let peer = self.peer(peer_id)?;
        peer.keepalive_set(interval, timeout);

        // wake the scheduler so the next delay is recomputed
        self.state.keepalive_kick.notify_one();
        Ok(())
    }

    /// Install a new key slot as primary, demoting the current primary
    pub fn key_install(&self, peer_id: u32, kc: &KeyConfig) -> Result<()> {
        let peer = self.peer(peer_id)?;
        peer.crypto.install(KeySlot::new(kc)?);
        log::debug!("peer {peer_id}: installed key {}", kc.key_id);
        Ok(())
    }

    /// Promote the secondary key slot to primary
    pub fn key_swap(&self, peer_id: u32) -> Result<()> {
        let peer = self.peer(peer_id)?;
        peer.crypto.swap();
        Ok(())
    }

    /// Drop the key slot carrying `key_id`
    pub fn key_del(&self, peer_id: u32, key_id: u8) -> Result<()> {
        let peer = self.peer(peer_id)?;
        if !peer.crypto.kill_key(key_id) {
            return Err(Error::KeyNotFound { key_id });
        }
        Ok(())
    }

    /// Attach an established TCP connection as a peer's transport
    pub fn tcp_attach(&self, peer_id: u32, stream: TcpStream) -> Result<()> {
        let peer = self.peer(peer_id)?;
        let transport = TcpTransport::attach(&self.state, &peer, stream)?;

        if let Err(e) = peer.set_transport(Transport::Tcp(transport.clone())) {
            transport.detach();
            return Err(e);
        }
        Ok(())
    }

    /// Read the next control (non-data) frame from a peer's TCP stream.
    ///
    /// Returns `None` once the transport is gone.
    pub async fn recv_control(&self, peer_id: u32) -> Result<Option<Vec<u8>>> {
        let transport = self
            .peer(peer_id)?
            .tcp_transport()
            .ok_or(Error::NoTransport)?;
        Ok(transport.recv_control().await)
    }

    /// Encrypt one tunnel packet and transmit it to the peer serving its
    /// destination address. Failures drop the packet and bump a counter.
    pub fn send(&self, packet: &[u8]) {
        let packets = [packet.to_vec()];
        io::send_many(&self.state, &packets, None);
    }

    /// Encrypt a batch of tunnel packets (e.g. the output of segmentation
    /// done upstream); each packet resolves its peer independently
    pub fn send_batch(&self, packets: &[Vec<u8>]) {
        io::send_many(&self.state, packets, None);
    }

    /// Encrypt one packet for an explicit peer
    pub fn send_to_peer(&self, peer_id: u32, packet: &[u8]) -> Result<()> {
        let peer = self.peer(peer_id)?;
        let packets = [packet.to_vec()];
        io::send_many(&self.state, &packets, Some(&peer));
        Ok(())
    }

    /// Per-peer traffic counters as `(vpn, link)` snapshots
    pub fn peer_stats(&self, peer_id: u32) -> Result<(StatsSnapshot, StatsSnapshot)> {
        let peer = self.peer(peer_id)?;
        Ok((peer.vpn_stats.snapshot(), peer.link_stats.snapshot()))
    }

    /// Packets dropped by this instance as `(tx, rx)`
    pub fn drop_stats(&self) -> (u64, u64) {
        (
            self.state.drops.tx.load(Ordering::Relaxed),
            self.state.drops.rx.load(Ordering::Relaxed),
        )
    }

    /// Tear the instance down: stop the scheduler, detach the transports
    /// and release every peer. Idempotent.
    pub fn shutdown(&self) {
        if self.state.halted.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!("instance shutting down");
        self.state.keepalive_kick.notify_one();
        if let Some(task) = self.state.keepalive_task.lock().take() {
            task.abort();
        }
        if let Some(sock) = self.state.udp.lock().take() {
            sock.detach();
        }

        self.state.registry.release_all(DelPeerReason::Teardown);
    }

    fn peer(&self, id: u32) -> Result<Arc<Peer>> {
        self.state
            .registry
            .get_by_id(id)
            .ok_or(Error::PeerNotFound { id })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
