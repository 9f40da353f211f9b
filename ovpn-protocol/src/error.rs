//! Error types for the data-channel protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while framing, validating or transforming packets
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("transmit packet-id space exhausted, key must be retired")]
    IdExhausted,

    #[error("replayed or out-of-window packet id {id}")]
    Replay { id: u32 },

    #[error("packet failed authentication")]
    AuthFailed,

    #[error("encryption failure")]
    Encrypt,

    #[error("invalid cipher key length {len} for {alg}")]
    BadKeyLength { alg: &'static str, len: usize },

    #[error("invalid nonce tail length {len}")]
    BadNonceTail { len: usize },

    #[error("key id {id} outside the 3-bit wire range")]
    KeyIdOutOfRange { id: u8 },

    #[error("invalid stream frame prefix {len}")]
    BadFramePrefix { len: u16 },

    #[error("frame of {len} bytes exceeds the 16-bit length prefix")]
    FrameTooLong { len: usize },

    #[error("framer is poisoned after a stream error")]
    StreamPoisoned,
}
