//! Keepalive scheduler tests
//!
//! Short real-time timers over loopback sockets: quiet peers expire with
//! reason `Expired`, quiet links get a synthetic 16-byte sentinel through
//! the normal encrypt path, and received keepalives hold the far side's
//! receive timeout open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ovpn_protocol::{is_keepalive, KeySlot, KEEPALIVE_MESSAGE};
use parking_lot::Mutex;
use rovpn_engine::tun::MockTun;
use rovpn_engine::{
    CipherAlg, Config, DelPeerReason, DirectRoute, EventHandler, Instance, KeyConfig,
    KeyDirection, PeerConfig,
};
use tokio::sync::Notify;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[derive(Default)]
struct RecordingEvents {
    deleted: Mutex<Vec<(u32, DelPeerReason)>>,
    notify: Notify,
}

impl RecordingEvents {
    async fn wait_deleted(&self) -> (u32, DelPeerReason) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(first) = self.deleted.lock().first().copied() {
                    return first;
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for a delete notification")
    }
}

impl EventHandler for RecordingEvents {
    fn peer_deleted(&self, peer_id: u32, reason: DelPeerReason) {
        self.deleted.lock().push((peer_id, reason));
        self.notify.notify_one();
    }
}

fn key_pair(key_id: u8) -> (KeyConfig, KeyConfig) {
    let a = KeyDirection {
        cipher_key: rand::random::<[u8; 32]>().to_vec(),
        nonce_tail: rand::random::<[u8; 8]>().to_vec(),
    };
    let b = KeyDirection {
        cipher_key: rand::random::<[u8; 32]>().to_vec(),
        nonce_tail: rand::random::<[u8; 8]>().to_vec(),
    };
    (
        KeyConfig {
            alg: CipherAlg::Aes256Gcm,
            key_id,
            encrypt: a.clone(),
            decrypt: b.clone(),
        },
        KeyConfig {
            alg: CipherAlg::Aes256Gcm,
            key_id,
            encrypt: b,
            decrypt: a,
        },
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quiet_peer_expires() {
    init_logs();

    let events = Arc::new(RecordingEvents::default());
    let inst = Instance::with_collaborators(
        Config::p2p(),
        Arc::new(MockTun::new()),
        events.clone(),
        Box::new(DirectRoute),
    )
    .unwrap();
    inst.udp_bind(any_addr()).unwrap();

    let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    inst.peer_new(PeerConfig {
        id: 1,
        remote: Some(sink.local_addr().unwrap()),
        ..Default::default()
    })
    .unwrap();

    // nothing will ever be received: the peer is dead after the timeout
    inst.keepalive_set(1, Duration::from_secs(60), Duration::from_millis(100))
        .unwrap();

    assert_eq!(events.wait_deleted().await, (1, DelPeerReason::Expired));
    assert!(inst.peer_del(1).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quiet_link_transmits_the_sentinel() {
    init_logs();

    let inst = Instance::new(Config::p2p(), Arc::new(MockTun::new())).unwrap();
    inst.udp_bind(any_addr()).unwrap();

    let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sink.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    inst.peer_new(PeerConfig {
        id: 1,
        remote: Some(sink.local_addr().unwrap()),
        ..Default::default()
    })
    .unwrap();

    let (driver_cfg, engine_cfg) = key_pair(1);
    inst.key_install(1, &engine_cfg).unwrap();
    let slot = KeySlot::new(&driver_cfg).unwrap();

    inst.keepalive_set(1, Duration::from_millis(100), Duration::from_secs(60))
        .unwrap();

    // the sentinel travels encrypted like any data packet
    let mut buf = [0u8; 256];
    let (n, _) = sink.recv_from(&mut buf).unwrap();
    let payload = slot.decapsulate(&buf[..n]).unwrap();
    assert_eq!(payload, KEEPALIVE_MESSAGE);
    assert!(is_keepalive(&payload));

    // the transmit counter reflects the synthetic send
    let (vpn, _) = inst.peer_stats(1).unwrap();
    assert!(vpn.tx_packets >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keepalive_traffic_holds_the_timeout_open() {
    init_logs();

    let events_b = Arc::new(RecordingEvents::default());
    let tun_a = Arc::new(MockTun::new());
    let tun_b = Arc::new(MockTun::new());

    let a = Instance::new(Config::p2p(), tun_a).unwrap();
    let b = Instance::with_collaborators(
        Config::p2p(),
        tun_b,
        events_b.clone(),
        Box::new(DirectRoute),
    )
    .unwrap();

    let addr_a = a.udp_bind(any_addr()).unwrap();
    let addr_b = b.udp_bind(any_addr()).unwrap();

    a.peer_new(PeerConfig {
        id: 1,
        remote: Some(addr_b),
        ..Default::default()
    })
    .unwrap();
    b.peer_new(PeerConfig {
        id: 1,
        remote: Some(addr_a),
        ..Default::default()
    })
    .unwrap();

    let (ka, kb) = key_pair(0);
    a.key_install(1, &ka).unwrap();
    b.key_install(1, &kb).unwrap();

    // a pings every 50ms; b would expire after 300ms of silence
    a.keepalive_set(1, Duration::from_millis(50), Duration::from_secs(60))
        .unwrap();
    b.keepalive_set(1, Duration::from_secs(60), Duration::from_millis(300))
        .unwrap();

    // well past b's timeout, the steady keepalives have kept the peer alive
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(events_b.deleted.lock().is_empty());

    // silence a; b's receive timeout now runs out for real
    a.shutdown();
    assert_eq!(events_b.wait_deleted().await, (1, DelPeerReason::Expired));
}
