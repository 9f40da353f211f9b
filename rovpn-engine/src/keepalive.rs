//! Peer liveness scheduler
//!
//! One task per instance walks every peer, expires the dead ones and
//! transmits synthetic keepalives for the quiet ones, then sleeps until
//! the nearest deadline across all peers. It never polls on a fixed
//! period: reconfiguring a peer's timers kicks the task so the next delay
//! is recomputed, and instance teardown stops it for good.

use std::sync::{Arc, Weak};
use std::time::Instant;

use ovpn_protocol::KEEPALIVE_MESSAGE;
use tokio::task::JoinHandle;

use crate::instance::InstanceState;
use crate::io::xmit_special;
use crate::peer::{DelPeerReason, KeepaliveTick};

pub(crate) fn spawn(state: &Arc<InstanceState>) -> JoinHandle<()> {
    let weak = Arc::downgrade(state);
    tokio::spawn(run(weak))
}

async fn run(weak: Weak<InstanceState>) {
    loop {
        let next_run = {
            let Some(state) = weak.upgrade() else {
                return;
            };
            if state.is_halted() {
                return;
            }
            tick(&state)
        };

        let Some(state) = weak.upgrade() else {
            return;
        };
        let kick = state.keepalive_kick.clone();
        drop(state);

        match next_run {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at.into()) => {}
                    _ = kick.notified() => {}
                }
            }
            // no peer carries a deadline; wait for a kick
            None => kick.notified().await,
        }
    }
}

/// Run one pass over all peers; returns the nearest next deadline
fn tick(state: &Arc<InstanceState>) -> Option<Instant> {
    let now = Instant::now();
    let mut next_run: Option<Instant> = None;

    for peer in state.registry.peers() {
        match peer.keepalive_tick(now) {
            KeepaliveTick::Unconfigured => {}
            KeepaliveTick::Expired => {
                // peer is dead, kill it and move on
                log::debug!("peer {} expired", peer.id());
                let _ = state.registry.del(&peer, DelPeerReason::Expired);
            }
            KeepaliveTick::Live { next, xmit_due } => {
                if xmit_due {
                    log::debug!("sending keepalive to peer {}", peer.id());
                    xmit_special(state, &peer, &KEEPALIVE_MESSAGE);
                }
                next_run = Some(next_run.map_or(next, |cur| cur.min(next)));
            }
        }
    }

    next_run
}
