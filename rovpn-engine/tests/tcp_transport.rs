//! Per-peer TCP transport tests
//!
//! One engine instance owns the accepted end of a loopback TCP connection;
//! the test drives the other end by hand: length-prefixed frames out of a
//! mirrored key slot, raw bytes for the failure cases.

use std::sync::Arc;
use std::time::Duration;

use ovpn_protocol::{encode_frame, KeySlot, StreamFramer, EXPLICIT_EXIT_NOTIFY_FIRST_BYTE};
use parking_lot::Mutex;
use rovpn_engine::tun::MockTun;
use rovpn_engine::{
    CipherAlg, Config, DelPeerReason, DirectRoute, EventHandler, Instance, KeyConfig,
    KeyDirection, PeerConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Captures delete notifications for assertion
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

fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..].copy_from_slice(payload);
    pkt
}

/// Connect a loopback pair and attach the accepted end to the peer.
/// Returns the driver's end of the stream.
async fn attach_stream(inst: &Instance, peer_id: u32) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (driver, accepted) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await.unwrap().0
    });
    inst.tcp_attach(peer_id, accepted).unwrap();
    driver.unwrap()
}

/// Instance with a TCP-only peer (no binding: the connection is the peer)
fn tcp_instance(
    tun: Arc<MockTun>,
    events: Arc<RecordingEvents>,
    peer_id: u32,
) -> (Instance, KeySlot) {
    let inst =
        Instance::with_collaborators(Config::p2p(), tun, events, Box::new(DirectRoute)).unwrap();
    inst.peer_new(PeerConfig {
        id: peer_id,
        vpn_ipv4: Some("10.8.0.2".parse().unwrap()),
        ..Default::default()
    })
    .unwrap();

    let (driver_cfg, engine_cfg) = key_pair(0);
    inst.key_install(peer_id, &engine_cfg).unwrap();
    (inst, KeySlot::new(&driver_cfg).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_framed_round_trip() {
    init_logs();

    let tun = Arc::new(MockTun::new());
    let (inst, slot) = tcp_instance(tun.clone(), Arc::new(RecordingEvents::default()), 3);
    let mut driver = attach_stream(&inst, 3).await;

    // driver -> engine: a framed data packet decrypts and injects
    let inner = ipv4_packet([10, 8, 0, 2], [10, 8, 0, 1], b"over tcp");
    let frame = encode_frame(&slot.encapsulate(3, &inner).unwrap()).unwrap();
    driver.write_all(&frame).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), tun.wait_for(1))
        .await
        .expect("timed out waiting for injection");
    assert_eq!(tun.packets()[0], inner);

    // engine -> driver: the reply arrives as one length-prefixed frame
    let reply = ipv4_packet([10, 8, 0, 1], [10, 8, 0, 2], b"reply");
    inst.send_to_peer(3, &reply).unwrap();

    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 4096];
    let wire = loop {
        let n = tokio::time::timeout(Duration::from_secs(5), driver.read(&mut buf))
            .await
            .expect("timed out reading the reply")
            .unwrap();
        assert!(n > 0, "stream closed before a frame arrived");
        framer.push(&buf[..n]);
        if let Some(frame) = framer.next_frame().unwrap() {
            break frame;
        }
    };
    assert_eq!(slot.decapsulate(&wire).unwrap(), reply);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_byte_dribble_reassembles_one_frame() {
    init_logs();

    let tun = Arc::new(MockTun::new());
    let (inst, slot) = tcp_instance(tun.clone(), Arc::new(RecordingEvents::default()), 3);
    let mut driver = attach_stream(&inst, 3).await;

    let inner = ipv4_packet([10, 8, 0, 2], [10, 8, 0, 1], b"dribbled");
    let frame = encode_frame(&slot.encapsulate(3, &inner).unwrap()).unwrap();

    // deliver the frame one byte at a time; nothing shows up early
    for &byte in &frame[..frame.len() - 1] {
        driver.write_all(&[byte]).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tun.is_empty());

    driver.write_all(&[frame[frame.len() - 1]]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), tun.wait_for(1))
        .await
        .expect("timed out waiting for the completed frame");
    assert_eq!(tun.packets(), vec![inner]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_control_frames_surface_to_the_control_plane() {
    init_logs();

    let tun = Arc::new(MockTun::new());
    let (inst, _slot) = tcp_instance(tun.clone(), Arc::new(RecordingEvents::default()), 3);
    let mut driver = attach_stream(&inst, 3).await;

    // an exit notification is not data-channel traffic; it bypasses the
    // decrypt pipeline and lands in the control queue
    let exit_notify = vec![EXPLICIT_EXIT_NOTIFY_FIRST_BYTE, 0x00, 0x11, 0x22];
    driver
        .write_all(&encode_frame(&exit_notify).unwrap())
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), inst.recv_control(3))
        .await
        .expect("timed out waiting for the control frame")
        .unwrap();
    assert_eq!(got, Some(exit_notify));
    assert!(tun.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_desync_tears_the_peer_down() {
    init_logs();

    let events = Arc::new(RecordingEvents::default());
    let tun = Arc::new(MockTun::new());
    let (inst, _slot) = tcp_instance(tun, events.clone(), 3);
    let mut driver = attach_stream(&inst, 3).await;

    // length prefix below the minimum: byte boundaries are lost for good
    driver.write_all(&[0x00, 0x01, 0xaa]).await.unwrap();

    assert_eq!(events.wait_deleted().await, (3, DelPeerReason::TransportError));
    assert!(inst.send_to_peer(3, b"gone").is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_auth_failure_tears_the_peer_down() {
    init_logs();

    let events = Arc::new(RecordingEvents::default());
    let tun = Arc::new(MockTun::new());
    let (inst, slot) = tcp_instance(tun.clone(), events.clone(), 3);
    let mut driver = attach_stream(&inst, 3).await;

    // well-framed but tampered: on a stream, one bad packet means the
    // whole connection can no longer be trusted
    let inner = ipv4_packet([10, 8, 0, 2], [10, 8, 0, 1], b"tampered");
    let mut wire = slot.encapsulate(3, &inner).unwrap();
    wire[10] ^= 0x01;
    driver
        .write_all(&encode_frame(&wire).unwrap())
        .await
        .unwrap();

    assert_eq!(events.wait_deleted().await, (3, DelPeerReason::TransportError));
    assert!(tun.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_disconnect_tears_the_peer_down() {
    init_logs();

    let events = Arc::new(RecordingEvents::default());
    let tun = Arc::new(MockTun::new());
    let (inst, _slot) = tcp_instance(tun, events.clone(), 3);
    let driver = attach_stream(&inst, 3).await;

    drop(driver);

    assert_eq!(
        events.wait_deleted().await,
        (3, DelPeerReason::TransportDisconnect)
    );
}
