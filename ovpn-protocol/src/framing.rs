//! Length-prefixed framing for stream transports
//!
//! When the data channel runs over TCP, every packet is written as a
//! 2-byte big-endian length prefix followed by that many bytes:
//!
//! ```text
//! +--------+--------+----------------------------------+
//! |  length (uint16, BE)  |  packet (length bytes)  ...
//! +--------+--------+----------------------------------+
//! ```
//!
//! The prefix covers everything that follows it, from the op header to the
//! end of payload and tag. A prefix below the minimum is unrecoverable:
//! once byte boundaries are lost there is no way to resynchronize the
//! stream, so the framer poisons itself and the connection must be torn
//! down.

use crate::{Error, Result};

/// Size of the length prefix preceding every frame
pub const FRAME_PREFIX_LEN: usize = 2;

/// Smallest length prefix considered valid
const MIN_FRAME_LEN: u16 = 2;

/// Encode one packet as a length-prefixed stream frame
pub fn encode_frame(packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() > u16::MAX as usize {
        return Err(Error::FrameTooLong { len: packet.len() });
    }

    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + packet.len());
    out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    out.extend_from_slice(packet);
    Ok(out)
}

/// Incremental parser turning a TCP byte stream back into discrete frames
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
    poisoned: bool,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Extract the next complete frame, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed prefix
    /// fails with [`Error::BadFramePrefix`] and poisons the framer; every
    /// later call then fails with [`Error::StreamPoisoned`].
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.poisoned {
            return Err(Error::StreamPoisoned);
        }

        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        if len < MIN_FRAME_LEN {
            self.poisoned = true;
            return Err(Error::BadFramePrefix { len });
        }

        let total = FRAME_PREFIX_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = self.buf[FRAME_PREFIX_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05]);

        assert_eq!(
            framer.next_frame().unwrap(),
            Some(vec![0x01, 0x02, 0x03, 0x04, 0x05])
        );
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x00, 0x05, 0x01, 0x02]);
        assert_eq!(framer.next_frame().unwrap(), None);

        framer.push(&[0x03, 0x04, 0x05]);
        assert_eq!(
            framer.next_frame().unwrap(),
            Some(vec![0x01, 0x02, 0x03, 0x04, 0x05])
        );
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut framer = StreamFramer::new();
        let mut stream = encode_frame(b"first").unwrap();
        stream.extend(encode_frame(b"second!").unwrap());
        stream.extend(encode_frame(b"3rd").unwrap());
        framer.push(&stream);

        assert_eq!(framer.next_frame().unwrap(), Some(b"first".to_vec()));
        assert_eq!(framer.next_frame().unwrap(), Some(b"second!".to_vec()));
        assert_eq!(framer.next_frame().unwrap(), Some(b"3rd".to_vec()));
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn test_split_prefix() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x00]);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.push(&[0x03, 0xaa, 0xbb, 0xcc]);
        assert_eq!(framer.next_frame().unwrap(), Some(vec![0xaa, 0xbb, 0xcc]));
    }

    #[test]
    fn test_bad_prefix_poisons_the_stream() {
        let mut framer = StreamFramer::new();
        framer.push(&[0x00, 0x01, 0xff, 0xff]);

        assert_eq!(
            framer.next_frame(),
            Err(Error::BadFramePrefix { len: 1 })
        );
        framer.push(&[0x00, 0x05]);
        assert_eq!(framer.next_frame(), Err(Error::StreamPoisoned));
    }

    #[test]
    fn test_encode_round_trip() {
        let packet = vec![0x48u8; 300];
        let mut framer = StreamFramer::new();
        framer.push(&encode_frame(&packet).unwrap());
        assert_eq!(framer.next_frame().unwrap(), Some(packet));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let packet = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            encode_frame(&packet),
            Err(Error::FrameTooLong { .. })
        ));
    }
}
