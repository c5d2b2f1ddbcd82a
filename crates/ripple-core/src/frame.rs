//! IPC frame codec.
//!
//! Every message on an IPC pipe is preceded by a fixed 16-byte header:
//!
//! ```text
//!   offset 0:  opcode (u8)
//!   offset 1:  7 bytes padding (zero)
//!   offset 8:  u64 union, host byte order:
//!                RAW_DATA -> payload length in bytes
//!                STREAM   -> stream kind tag (low 32 bits)
//! ```
//!
//! A RAW_DATA frame is followed by exactly `raw_len` payload bytes. A
//! STREAM frame carries no inline bytes; the passed descriptor rides as
//! ancillary data on the same message as the header. Both ends of a
//! channel live on the same machine, so host byte order is the wire
//! order.
//!
//! The opcode space is closed. A receiver that sees anything else is
//! reading a corrupted stream and must not try to resynchronize.

use crate::handle::HandleKind;

pub const FRAME_HEADER_LEN: usize = 16;

pub const OP_RAW_DATA: u8 = 0;
pub const OP_STREAM: u8 = 1;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// `len` payload bytes follow.
    RawData { len: u64 },
    /// A stream descriptor accompanies this header as ancillary data.
    Stream { kind: HandleKind },
}

impl Frame {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        match *self {
            Frame::RawData { len } => {
                buf[0] = OP_RAW_DATA;
                buf[8..16].copy_from_slice(&len.to_ne_bytes());
            }
            Frame::Stream { kind } => {
                buf[0] = OP_STREAM;
                buf[8..16].copy_from_slice(&(kind as u8 as u64).to_ne_bytes());
            }
        }
        buf
    }

    /// Decode a header. `None` means the opcode is outside the protocol;
    /// the caller must treat the channel as corrupt.
    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Option<Frame> {
        let union = u64::from_ne_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        match buf[0] {
            OP_RAW_DATA => Some(Frame::RawData { len: union }),
            OP_STREAM => Some(Frame::Stream {
                kind: HandleKind::from(union as u8),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_data_layout() {
        let h = Frame::RawData { len: 6 }.encode();
        assert_eq!(h[0], OP_RAW_DATA);
        assert_eq!(&h[1..8], &[0u8; 7]);
        assert_eq!(u64::from_ne_bytes(h[8..16].try_into().unwrap()), 6);
        assert_eq!(Frame::decode(&h), Some(Frame::RawData { len: 6 }));
    }

    #[test]
    fn test_stream_layout() {
        let h = Frame::Stream { kind: HandleKind::Tcp }.encode();
        assert_eq!(h[0], OP_STREAM);
        match Frame::decode(&h) {
            Some(Frame::Stream { kind }) => assert_eq!(kind, HandleKind::Tcp),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut h = [0u8; FRAME_HEADER_LEN];
        h[0] = 0x7f;
        assert_eq!(Frame::decode(&h), None);
    }
}
