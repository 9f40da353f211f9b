//! OpenVPN data-channel protocol implementation
//!
//! This crate implements the pure (no I/O) half of the data channel: the
//! wire header codec, packet-ID generation and replay validation, AEAD key
//! slots with encapsulation/decapsulation, and the length-prefixed framer
//! used when the channel runs over a byte stream.
//!
//! The transport and peer machinery built on top of it lives in
//! `rovpn-engine`.

mod crypto;
mod error;
mod framing;
mod packet;
mod pktid;

pub use crypto::{CipherAlg, CryptoState, KeyConfig, KeyDirection, KeySlot};
pub use error::{Error, Result};
pub use framing::{encode_frame, StreamFramer, FRAME_PREFIX_LEN};
pub use packet::{
    compose_op, is_keepalive, key_id_from, opcode_from, peer_id_from,
    EXPLICIT_EXIT_NOTIFY_FIRST_BYTE, KEEPALIVE_FIRST_BYTE, KEEPALIVE_MESSAGE,
};
pub use pktid::{PacketIdXmit, ReplayWindow};

/// Data channel V1 opcode (1-byte header, no peer ID)
pub const OPCODE_DATA_V1: u8 = 6;
/// Data channel V2 opcode (4-byte header carrying a 24-bit peer ID)
pub const OPCODE_DATA_V2: u8 = 9;

/// Low 3 bits of the first byte carry the key ID
pub const KEY_ID_MASK: u8 = 0x07;
/// High 5 bits of the first byte carry the opcode
pub const OPCODE_SHIFT: u8 = 3;
pub const OPCODE_MASK: u8 = 0x1f;

/// Size of the V2 op header: opcode/key-id byte plus 24-bit peer ID
pub const OP_SIZE_V2: usize = 4;

/// 24-bit peer ID space; the all-ones value means "undefined"
pub const PEER_ID_MASK: u32 = 0x00ff_ffff;
pub const PEER_ID_UNDEF: u32 = 0x00ff_ffff;

/// Full AEAD nonce size
pub const NONCE_SIZE: usize = 12;
/// Leading part of the nonce carried on the wire (the packet ID)
pub const NONCE_WIRE_SIZE: usize = 4;
/// Trailing part of the nonce, pre-shared and never transmitted
pub const NONCE_TAIL_SIZE: usize = 8;

/// AEAD authentication tag size
pub const AUTH_TAG_SIZE: usize = 16;

/// Smallest possible data-channel packet: op header, wire packet ID and tag
pub const MIN_PACKET_SIZE: usize = OP_SIZE_V2 + NONCE_WIRE_SIZE + AUTH_TAG_SIZE;
