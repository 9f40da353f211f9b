//! UDP transport multiplexer
//!
//! One UDP socket serves an entire instance: outgoing packets for any
//! number of peers are sent through it, and inbound datagrams are
//! demultiplexed to the owning peer. The socket is wrapped in a
//! reference-counted [`OvpnSocket`] shared by every peer transmitting over
//! it; attaching a second peer reuses the existing wrapper instead of
//! erroring.
//!
//! Inbound resolution order: a defined 24-bit peer ID in the op header
//! resolves through the by-id index (this is what lets a floated peer be
//! recognized on its new address); an undefined peer ID falls back to the
//! transport-address index.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use ovpn_protocol::{opcode_from, peer_id_from, OPCODE_DATA_V2, OP_SIZE_V2, PEER_ID_UNDEF};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::instance::InstanceState;
use crate::io::recv;
use crate::Result;

/// Reference-counted wrapper around the instance's UDP socket.
///
/// Owns the demux task; detaching aborts it exactly once.
pub(crate) struct OvpnSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OvpnSocket {
    /// Adopt a bound, unconnected UDP socket and start demultiplexing.
    ///
    /// Must run inside a tokio runtime.
    pub(crate) fn attach(
        state: &Arc<InstanceState>,
        socket: std::net::UdpSocket,
    ) -> Result<Arc<Self>> {
        socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let local_addr = socket.local_addr()?;

        let me = Arc::new(Self {
            socket: socket.clone(),
            local_addr,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::demux(
            Arc::downgrade(state),
            socket,
            local_addr,
            state.config.recv_buffer,
        ));
        *me.task.lock() = Some(task);

        log::info!("udp transport attached on {local_addr}");
        Ok(me)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand one wire packet to the kernel; never blocks the data path
    pub(crate) fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(buf, target)
    }

    /// Stop the demux task; safe to call from teardown paths racing
    /// inbound packet processing
    pub(crate) fn detach(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn demux(
        state: Weak<InstanceState>,
        socket: Arc<UdpSocket>,
        local_addr: SocketAddr,
        buf_size: usize,
    ) {
        let mut buf = vec![0u8; buf_size];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("udp receive error on {local_addr}: {e}");
                    break;
                }
            };

            let Some(state) = state.upgrade() else {
                break;
            };
            udp_recv(&state, &buf[..len], src, local_addr);
        }
    }
}

impl Drop for OvpnSocket {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Demultiplex one inbound datagram to its peer and feed the decrypt
/// pipeline
fn udp_recv(state: &Arc<InstanceState>, pkt: &[u8], src: SocketAddr, local: SocketAddr) {
    if pkt.len() < OP_SIZE_V2 {
        log::debug!("runt datagram of {} bytes from {src}", pkt.len());
        state.rx_dropped();
        return;
    }

    // only data-channel packets are handled here; the control channel
    // lives in userspace
    if opcode_from(pkt) != Ok(OPCODE_DATA_V2) {
        log::debug!("non-data opcode from {src}, dropping");
        state.rx_dropped();
        return;
    }

    let peer = match peer_id_from(pkt) {
        Ok(PEER_ID_UNDEF) => state.registry.get_by_transp_addr(&src),
        Ok(peer_id) => state.registry.get_by_id(peer_id),
        Err(_) => None,
    };

    let Some(peer) = peer else {
        log::debug!("no peer for datagram from {src}");
        state.rx_dropped();
        return;
    };

    // the peer may have moved behind a NAT; follow its observed source
    state.registry.float(&peer, src);
    if !local.ip().is_unspecified() {
        peer.update_local_endpoint(local.ip());
    }

    recv(state, &peer, pkt);
}
