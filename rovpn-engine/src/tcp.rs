//! Per-peer TCP transport
//!
//! A TCP connection inherently identifies its peer, so each stream
//! transport belongs to exactly one peer. Inbound bytes run through the
//! length-prefixed [`StreamFramer`]; data-channel frames feed the decrypt
//! pipeline, everything else lands in a per-peer control queue read by the
//! control plane via [`TcpTransport::recv_control`].
//!
//! Outbound writes keep at most one message in flight: a send attempted
//! while another is outstanding fails with [`Error::TxBusy`] and the
//! caller retries once the writer task has drained the slot. This is a
//! deliberate backpressure mechanism, not a queue.
//!
//! A framing error is unrecoverable (byte boundaries are lost for good)
//! and any socket error invalidates the stream, so both tear the peer
//! down.

use std::sync::{Arc, Weak};

use ovpn_protocol::{encode_frame, opcode_from, StreamFramer, OPCODE_DATA_V2};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::instance::InstanceState;
use crate::io::recv;
use crate::peer::{DelPeerReason, Peer};
use crate::{Error, Result};

pub(crate) struct TcpTransport {
    /// The one outstanding outbound frame, length prefix included
    tx_slot: Mutex<Option<Vec<u8>>>,
    tx_notify: Arc<Notify>,
    ctrl_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Take ownership of an established stream and start its rx/tx tasks.
    ///
    /// Must run inside a tokio runtime.
    pub(crate) fn attach(
        state: &Arc<InstanceState>,
        peer: &Arc<Peer>,
        stream: TcpStream,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (ctrl_tx, ctrl_rx) = mpsc::channel(state.config.control_queue);

        let me = Arc::new(Self {
            tx_slot: Mutex::new(None),
            tx_notify: Arc::new(Notify::new()),
            ctrl_rx: tokio::sync::Mutex::new(ctrl_rx),
            tasks: Mutex::new(Vec::new()),
        });

        let rx = tokio::spawn(rx_task(
            Arc::downgrade(state),
            peer.clone(),
            read_half,
            ctrl_tx,
            state.config.recv_buffer,
        ));
        let tx = tokio::spawn(tx_task(
            Arc::downgrade(state),
            peer.clone(),
            me.clone(),
            write_half,
        ));
        me.tasks.lock().extend([rx, tx]);

        log::info!("tcp transport attached for peer {} ({peer_addr})", peer.id());
        Ok(me)
    }

    /// Queue one wire packet for transmission.
    ///
    /// Fails with [`Error::TxBusy`] while a previous frame is still being
    /// written.
    pub(crate) fn send_frame(&self, wire: &[u8]) -> Result<()> {
        let framed = encode_frame(wire).map_err(Error::Protocol)?;

        {
            let mut slot = self.tx_slot.lock();
            if slot.is_some() {
                return Err(Error::TxBusy);
            }
            *slot = Some(framed);
        }

        self.tx_notify.notify_one();
        Ok(())
    }

    /// Receive the next non-data frame queued for the control plane
    pub(crate) async fn recv_control(&self) -> Option<Vec<u8>> {
        self.ctrl_rx.lock().await.recv().await
    }

    /// Abort both stream tasks; idempotent
    pub(crate) fn detach(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Tear the owning peer down after a stream failure
fn stream_teardown(state: &Weak<InstanceState>, peer: &Arc<Peer>, reason: DelPeerReason) {
    if let Some(state) = state.upgrade() {
        let _ = state.registry.del(peer, reason);
    }
}

async fn rx_task(
    state: Weak<InstanceState>,
    peer: Arc<Peer>,
    mut read_half: OwnedReadHalf,
    ctrl_tx: mpsc::Sender<Vec<u8>>,
    buf_size: usize,
) {
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; buf_size];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                log::info!("peer {}: tcp connection closed by remote", peer.id());
                stream_teardown(&state, &peer, DelPeerReason::TransportDisconnect);
                return;
            }
            Ok(n) => {
                framer.push(&buf[..n]);
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) => {
                            if opcode_from(&frame) == Ok(OPCODE_DATA_V2) {
                                let Some(state) = state.upgrade() else {
                                    return;
                                };
                                recv(&state, &peer, &frame);
                            } else if ctrl_tx.try_send(frame).is_err() {
                                log::warn!(
                                    "peer {}: control queue full, dropping frame",
                                    peer.id()
                                );
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // a desynced stream cannot be recovered
                            log::warn!("peer {}: tcp framing error: {e}", peer.id());
                            stream_teardown(&state, &peer, DelPeerReason::TransportError);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("peer {}: tcp read error: {e}", peer.id());
                stream_teardown(&state, &peer, DelPeerReason::TransportError);
                return;
            }
        }
    }
}

async fn tx_task(
    state: Weak<InstanceState>,
    peer: Arc<Peer>,
    transport: Arc<TcpTransport>,
    mut write_half: OwnedWriteHalf,
) {
    let notify = transport.tx_notify.clone();
    loop {
        notify.notified().await;

        // the slot stays occupied until the frame is fully on the wire,
        // rejecting concurrent senders in the meantime
        let frame = transport.tx_slot.lock().clone();
        let Some(frame) = frame else {
            continue;
        };

        match write_half.write_all(&frame).await {
            Ok(()) => {
                *transport.tx_slot.lock() = None;
            }
            Err(e) => {
                log::warn!("peer {}: tcp write error: {e}", peer.id());
                stream_teardown(&state, &peer, DelPeerReason::TransportError);
                return;
            }
        }
    }
}
