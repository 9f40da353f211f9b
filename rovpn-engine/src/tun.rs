//! Network-stack injection seam
//!
//! After decryption and validation the engine hands plaintext tunnel
//! packets to a [`TunSink`]. Production embedders back this with a tun
//! device writer; tests use [`MockTun`] to capture what would have hit the
//! interface.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Receives validated plaintext packets leaving the tunnel.
///
/// Called from transport receive contexts; implementations must not
/// block.
pub trait TunSink: Send + Sync {
    fn inject(&self, packet: &[u8]);
}

/// Capturing sink for tests
#[derive(Default)]
pub struct MockTun {
    packets: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
}

impl MockTun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything injected so far
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` packets have been injected
    pub async fn wait_for(&self, n: usize) {
        loop {
            if self.packets.lock().len() >= n {
                return;
            }
            self.notify.notified().await;
        }
    }
}

impl TunSink for MockTun {
    fn inject(&self, packet: &[u8]) {
        self.packets.lock().push(packet.to_vec());
        self.notify.notify_one();
    }
}
