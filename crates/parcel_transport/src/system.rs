//! Wire codec for the system bus (bus id 0): PING/PONG opcodes used for RTT
//! sampling and optional clock synchronization.
//!
//! Grounded on the same manual bit-packing idiom as
//! [`crate::packet::header`]: a single opcode/flags byte followed by
//! packed-big-endian fields, rather than a generic derive.

use bytes::{Bytes, BytesMut};

use crate::error::DecodeError;
use crate::packet::seq::bytes_needed;

/// A decoded system-bus parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    /// Sent by the RTT-measuring side; `sequence` correlates the reply.
    Ping {
        /// Correlates this ping with its pong.
        sequence: u16,
        /// Whether the sender wants clock-sync back.
        time_sync: bool,
    },
    /// Sent in reply to a [`SystemMessage::Ping`].
    Pong {
        /// Echoes the ping's sequence.
        sequence: u16,
        /// Echoes the ping's `time_sync` request.
        time_sync: bool,
        /// Present only when `time_sync` is set: the replier's local clock
        /// reading (nanoseconds) at the moment of reply.
        time: Option<u64>,
    },
}

const OPCODE_PING: u8 = 0;
const OPCODE_PONG: u8 = 1;

impl SystemMessage {
    /// Encodes this message onto the end of `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Self::Ping { sequence, time_sync } => {
                let seq_len = bytes_needed(u64::from(sequence)).min(2);
                let meta = (OPCODE_PING << 5) | ((seq_len - 1) << 4) | (u8::from(time_sync) << 3);
                buf.extend_from_slice(&[meta]);
                write_packed(buf, u64::from(sequence), seq_len);
            }
            Self::Pong { sequence, time_sync, time } => {
                let seq_len = bytes_needed(u64::from(sequence)).min(2);
                let time_len = time.map_or(1, bytes_needed);
                let meta = (OPCODE_PONG << 5)
                    | ((seq_len - 1) << 4)
                    | (u8::from(time_sync) << 3)
                    | (time_len - 1);
                buf.extend_from_slice(&[meta]);
                write_packed(buf, u64::from(sequence), seq_len);
                if let Some(time) = time {
                    write_packed(buf, time, time_len);
                }
            }
        }
    }

    /// Decodes a system message from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::BufferTooShort`] if fewer bytes are available
    /// than the meta byte claims are needed.
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::BufferTooShort);
        }
        let meta = buf.split_to(1)[0];
        let opcode = (meta >> 5) & 0b111;
        let seq_len = ((meta >> 4) & 1) + 1;
        let time_sync = (meta >> 3) & 1 != 0;

        let sequence = read_packed(buf, seq_len)? as u16;

        match opcode {
            OPCODE_PING => Ok(Self::Ping { sequence, time_sync }),
            _ => {
                let time_len = (meta & 0b111) + 1;
                let time = if time_sync {
                    Some(read_packed(buf, time_len)?)
                } else {
                    None
                };
                Ok(Self::Pong { sequence, time_sync, time })
            }
        }
    }
}

fn write_packed(buf: &mut BytesMut, value: u64, len: u8) {
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[(8 - len as usize)..]);
}

fn read_packed(buf: &mut Bytes, len: u8) -> Result<u64, DecodeError> {
    if buf.len() < len as usize {
        return Err(DecodeError::BufferTooShort);
    }
    let mut out = [0u8; 8];
    let start = 8 - len as usize;
    out[start..].copy_from_slice(&buf.split_to(len as usize));
    Ok(u64::from_be_bytes(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let msg = SystemMessage::Ping { sequence: 300, time_sync: true };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(SystemMessage::decode(&mut bytes).unwrap(), msg);
    }

    #[test]
    fn pong_with_time_sync_round_trips() {
        let msg = SystemMessage::Pong {
            sequence: 7,
            time_sync: true,
            time: Some(123_456_789),
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(SystemMessage::decode(&mut bytes).unwrap(), msg);
    }

    #[test]
    fn pong_without_time_sync_carries_no_time() {
        let msg = SystemMessage::Pong { sequence: 1, time_sync: false, time: None };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(SystemMessage::decode(&mut bytes).unwrap(), msg);
    }
}
