//! AEAD key slots and the per-peer crypto-state container
//!
//! A key slot bundles everything one negotiated key provides: two
//! independent cipher contexts (one per direction), the two pre-shared
//! 8-byte nonce tails, the transmit packet-ID counter and the receive
//! replay window, all labelled by a 3-bit wire key ID.
//!
//! Nonce construction:
//!
//! ```text
//!    00000005 521c3b01 4308c041
//!    [seq # ] [    nonce tail  ]
//!    [      12-byte full IV    ]
//!    [4 bytes
//!    on wire]
//! ```
//!
//! Only the 4-byte packet ID travels on the wire; the tail is derived from
//! key material out of band and never transmitted.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use parking_lot::RwLock;

use crate::pktid::{PacketIdXmit, ReplayWindow};
use crate::{
    compose_op, Error, Result, AUTH_TAG_SIZE, KEY_ID_MASK, MIN_PACKET_SIZE, NONCE_SIZE,
    NONCE_TAIL_SIZE, NONCE_WIRE_SIZE, OPCODE_DATA_V2, OP_SIZE_V2,
};

/// Supported AEAD cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlg {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherAlg {
    pub const fn key_len(&self) -> usize {
        32
    }

    const fn name(&self) -> &'static str {
        match self {
            CipherAlg::Aes256Gcm => "aes-256-gcm",
            CipherAlg::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

/// Key material for one direction of a slot
#[derive(Clone)]
pub struct KeyDirection {
    pub cipher_key: Vec<u8>,
    pub nonce_tail: Vec<u8>,
}

impl fmt::Debug for KeyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // key material never ends up in logs
        f.debug_struct("KeyDirection").finish_non_exhaustive()
    }
}

/// Complete configuration for one key slot, as delivered by the control
/// plane after key negotiation
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub alg: CipherAlg,
    pub key_id: u8,
    pub encrypt: KeyDirection,
    pub decrypt: KeyDirection,
}

enum CipherCtx {
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl CipherCtx {
    fn new(alg: CipherAlg, key: &[u8]) -> Result<Self> {
        if key.len() != alg.key_len() {
            return Err(Error::BadKeyLength {
                alg: alg.name(),
                len: key.len(),
            });
        }

        match alg {
            CipherAlg::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(|c| CipherCtx::Aes256Gcm(Box::new(c)))
                .map_err(|_| Error::BadKeyLength {
                    alg: alg.name(),
                    len: key.len(),
                }),
            CipherAlg::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(|c| CipherCtx::ChaCha20Poly1305(Box::new(c)))
                .map_err(|_| Error::BadKeyLength {
                    alg: alg.name(),
                    len: key.len(),
                }),
        }
    }

    /// Seal `msg`; returns ciphertext with the tag appended
    fn seal(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
        let nonce = aes_gcm::Nonce::from_slice(nonce);
        let payload = Payload { msg, aad };
        match self {
            CipherCtx::Aes256Gcm(c) => c.encrypt(nonce, payload).map_err(|_| Error::Encrypt),
            CipherCtx::ChaCha20Poly1305(c) => {
                c.encrypt(nonce, payload).map_err(|_| Error::Encrypt)
            }
        }
    }

    /// Open ciphertext-with-appended-tag; any mismatch is an auth failure
    fn open(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
        let nonce = aes_gcm::Nonce::from_slice(nonce);
        let payload = Payload { msg, aad };
        match self {
            CipherCtx::Aes256Gcm(c) => c.decrypt(nonce, payload).map_err(|_| Error::AuthFailed),
            CipherCtx::ChaCha20Poly1305(c) => {
                c.decrypt(nonce, payload).map_err(|_| Error::AuthFailed)
            }
        }
    }
}

/// One complete key slot: both directional contexts plus packet-ID state
pub struct KeySlot {
    key_id: u8,
    encrypt: CipherCtx,
    decrypt: CipherCtx,
    nonce_tail_xmit: [u8; NONCE_TAIL_SIZE],
    nonce_tail_recv: [u8; NONCE_TAIL_SIZE],
    pid_xmit: PacketIdXmit,
    pid_recv: ReplayWindow,
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySlot")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

fn nonce_tail(dir: &KeyDirection) -> Result<[u8; NONCE_TAIL_SIZE]> {
    dir.nonce_tail
        .as_slice()
        .try_into()
        .map_err(|_| Error::BadNonceTail {
            len: dir.nonce_tail.len(),
        })
}

impl KeySlot {
    pub fn new(kc: &KeyConfig) -> Result<Self> {
        if kc.key_id > KEY_ID_MASK {
            return Err(Error::KeyIdOutOfRange { id: kc.key_id });
        }

        Ok(Self {
            key_id: kc.key_id,
            encrypt: CipherCtx::new(kc.alg, &kc.encrypt.cipher_key)?,
            decrypt: CipherCtx::new(kc.alg, &kc.decrypt.cipher_key)?,
            nonce_tail_xmit: nonce_tail(&kc.encrypt)?,
            nonce_tail_recv: nonce_tail(&kc.decrypt)?,
            pid_xmit: PacketIdXmit::new(),
            pid_recv: ReplayWindow::new(),
        })
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    /// Encapsulate a plaintext payload into a wire packet.
    ///
    /// The op header and the wire packet ID form the associated data, so
    /// any header tamper fails authentication on the far side.
    pub fn encapsulate(&self, peer_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let pktid = self.pid_xmit.next()?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_WIRE_SIZE].copy_from_slice(&pktid.to_be_bytes());
        nonce[NONCE_WIRE_SIZE..].copy_from_slice(&self.nonce_tail_xmit);

        let op = compose_op(OPCODE_DATA_V2, self.key_id, peer_id);
        let mut aad = [0u8; OP_SIZE_V2 + NONCE_WIRE_SIZE];
        aad[..OP_SIZE_V2].copy_from_slice(&op.to_be_bytes());
        aad[OP_SIZE_V2..].copy_from_slice(&pktid.to_be_bytes());

        let sealed = self.encrypt.seal(&nonce, &aad, payload)?;
        let (ct, tag) = sealed.split_at(sealed.len() - AUTH_TAG_SIZE);

        let mut wire = Vec::with_capacity(MIN_PACKET_SIZE + ct.len());
        wire.extend_from_slice(&aad);
        wire.extend_from_slice(tag);
        wire.extend_from_slice(ct);
        Ok(wire)
    }

    /// Decapsulate a wire packet back into its plaintext payload.
    ///
    /// Authentication runs first; only an authenticated packet ID is fed to
    /// the replay window.
    pub fn decapsulate(&self, wire: &[u8]) -> Result<Vec<u8>> {
        if wire.len() < MIN_PACKET_SIZE {
            return Err(Error::PacketTooShort {
                expected: MIN_PACKET_SIZE,
                actual: wire.len(),
            });
        }

        let aad = &wire[..OP_SIZE_V2 + NONCE_WIRE_SIZE];
        let pktid = u32::from_be_bytes([wire[4], wire[5], wire[6], wire[7]]);
        let tag = &wire[OP_SIZE_V2 + NONCE_WIRE_SIZE..MIN_PACKET_SIZE];
        let ct = &wire[MIN_PACKET_SIZE..];

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_WIRE_SIZE].copy_from_slice(&pktid.to_be_bytes());
        nonce[NONCE_WIRE_SIZE..].copy_from_slice(&self.nonce_tail_recv);

        let mut sealed = Vec::with_capacity(ct.len() + AUTH_TAG_SIZE);
        sealed.extend_from_slice(ct);
        sealed.extend_from_slice(tag);

        let plaintext = self.decrypt.open(&nonce, aad, &sealed)?;
        self.pid_recv.check(pktid)?;

        Ok(plaintext)
    }
}

#[derive(Default)]
struct Slots {
    primary: Option<Arc<KeySlot>>,
    secondary: Option<Arc<KeySlot>>,
}

/// Per-peer container of up to two key slots (primary + secondary).
///
/// Lookups hand out `Arc` clones, so a slot obtained just before a
/// concurrent [`CryptoState::release`] stays usable until the caller is
/// done with it.
#[derive(Default)]
pub struct CryptoState {
    slots: RwLock<Slots>,
}

impl CryptoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot used for encrypting outgoing traffic, if keyed
    pub fn primary(&self) -> Option<Arc<KeySlot>> {
        self.slots.read().primary.clone()
    }

    /// Find either slot by its wire key ID; used on decrypt so that traffic
    /// keyed against the outgoing-secondary still authenticates during a
    /// rekey transition
    pub fn slot_for_key_id(&self, key_id: u8) -> Option<Arc<KeySlot>> {
        let slots = self.slots.read();
        for slot in [&slots.primary, &slots.secondary].into_iter().flatten() {
            if slot.key_id() == key_id {
                return Some(slot.clone());
            }
        }
        None
    }

    /// Install a new slot as primary, demoting the current primary to
    /// secondary (which drops a previous secondary, if any)
    pub fn install(&self, slot: KeySlot) {
        let mut slots = self.slots.write();
        slots.secondary = slots.primary.take();
        slots.primary = Some(Arc::new(slot));
    }

    /// Promote the secondary slot to primary after a rekey completes
    pub fn swap(&self) {
        let mut slots = self.slots.write();
        let slots = &mut *slots;
        std::mem::swap(&mut slots.primary, &mut slots.secondary);
    }

    /// Drop the slot carrying `key_id`, if present
    pub fn kill_key(&self, key_id: u8) -> bool {
        let mut slots = self.slots.write();
        let slots = &mut *slots;
        for entry in [&mut slots.primary, &mut slots.secondary] {
            if entry.as_ref().is_some_and(|s| s.key_id() == key_id) {
                *entry = None;
                return true;
            }
        }
        false
    }

    /// Drop both slots
    pub fn release(&self) {
        let mut slots = self.slots.write();
        slots.primary = None;
        slots.secondary = None;
    }
}
