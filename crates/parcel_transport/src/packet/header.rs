//! The fragment header wire codec.
//!
//! Format (see the design notes for the full byte table): one meta byte
//! packing the fragment type and the byte-widths of the three length fields,
//! followed by `bus_id`, `fragment_index`, `last_index` and `sequence`
//! packed big-endian at their chosen widths. ACK fragments reuse the exact
//! header of their DATA counterpart (same type tag) with an empty payload.
//!
//! Grounded on the teacher's manual bit-twiddling codec style in
//! `aeronet_transport::packet` (header fields packed into a leading tag byte
//! rather than delegated to a generic derive), generalized from the
//! teacher's fixed 1-byte-per-field layout to the variable-width packing
//! this wire format calls for.

use bytes::{Bytes, BytesMut};

use crate::error::{DecodeError, EncodeRangeError};

/// The four kinds of fragment this layer puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FragmentType {
    /// Best-effort, unordered, no resends.
    Unreliable = 0,
    /// Best-effort, newer sequence numbers supersede older ones.
    Sequenced = 1,
    /// Guaranteed delivery via resend + ACK, in order per bus.
    Reliable = 2,
    /// Carries no payload; acknowledges one fragment of a RELIABLE parcel.
    Ack = 3,
}

impl FragmentType {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Unreliable,
            1 => Self::Sequenced,
            2 => Self::Reliable,
            _ => Self::Ack,
        }
    }

    const fn to_bits(self) -> u8 {
        self as u8
    }

    /// `true` for the modes that require per-fragment acknowledgement and
    /// resend.
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        matches!(self, Self::Reliable)
    }
}

/// Minimum possible encoded header size: 1 meta byte + 1 byte each for
/// `bus_id`, `fragment_index`, `last_index` + 1 byte for `sequence`.
pub const MIN_HEADER_LEN: usize = 5;

/// Maximum possible encoded header size: 1 meta byte + 2 bytes each for
/// `bus_id`, `fragment_index`, `last_index` + 8 bytes for `sequence`.
pub const MAX_HEADER_LEN: usize = 1 + 2 + 2 + 2 + 8;

/// A decoded fragment header.
///
/// `bus_id` uses wire numbering directly: `0` is the system bus, user bus
/// index `i` (0-based) is carried on the wire as `i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Fragment/parcel delivery mode.
    pub fragment_type: FragmentType,
    /// Wire bus id (0 = system bus).
    pub bus_id: u32,
    /// 0-based index of this fragment within its parcel.
    pub fragment_index: u32,
    /// 0-based index of the last fragment in this parcel (`fragment_count -
    /// 1`).
    pub last_index: u32,
    /// Parcel sequence number, scoped per bus and per mode.
    pub sequence: u64,
}

fn bytes_for_field(value: u32) -> Result<(u8, bool), EncodeRangeError> {
    if value <= u32::from(u8::MAX) {
        Ok((1, false))
    } else if value <= u32::from(u16::MAX) {
        Ok((2, true))
    } else {
        Err(EncodeRangeError {
            value: u64::from(value),
            max_bytes: 2,
        })
    }
}

fn write_packed(buf: &mut BytesMut, value: u32, len: u8) {
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[(4 - len as usize)..]);
}

fn read_packed(buf: &mut Bytes, len: u8) -> Result<u32, DecodeError> {
    if buf.len() < len as usize {
        return Err(DecodeError::BufferTooShort);
    }
    let mut out = [0u8; 4];
    let start = 4 - len as usize;
    out[start..].copy_from_slice(&buf.split_to(len as usize));
    Ok(u32::from_be_bytes(out))
}

fn write_packed_u64(buf: &mut BytesMut, value: u64, len: u8) {
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[(8 - len as usize)..]);
}

fn read_packed_u64(buf: &mut Bytes, len: u8) -> Result<u64, DecodeError> {
    if buf.len() < len as usize {
        return Err(DecodeError::BufferTooShort);
    }
    let mut out = [0u8; 8];
    let start = 8 - len as usize;
    out[start..].copy_from_slice(&buf.split_to(len as usize));
    Ok(u64::from_be_bytes(out))
}

impl FragmentHeader {
    /// Encodes this header onto the end of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if `bus_id`, `fragment_index` or `last_index` does
    /// not fit in 2 bytes, or `sequence` does not fit in 8 bytes (never, in
    /// practice, since `sequence` is a `u64`).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeRangeError> {
        let (bus_id_len, bus_id_wide) = bytes_for_field(self.bus_id)?;
        let (frag_idx_len, frag_idx_wide) = bytes_for_field(self.fragment_index)?;
        let (last_idx_len, last_idx_wide) = bytes_for_field(self.last_index)?;
        let seq_len = crate::packet::seq::bytes_needed(self.sequence);

        let meta = (self.fragment_type.to_bits() << 6)
            | (u8::from(bus_id_wide) << 5)
            | (u8::from(frag_idx_wide) << 4)
            | (u8::from(last_idx_wide) << 3)
            | (seq_len - 1);
        buf.extend_from_slice(&[meta]);

        write_packed(buf, self.bus_id, bus_id_len);
        write_packed(buf, self.fragment_index, frag_idx_len);
        write_packed(buf, self.last_index, last_idx_len);
        write_packed_u64(buf, self.sequence, seq_len);
        Ok(())
    }

    /// Decodes a header from the front of `buf`, consuming the bytes it
    /// used.
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

        let fragment_type = FragmentType::from_bits((meta >> 6) & 0b11);
        let bus_id_len = if (meta >> 5) & 1 == 0 { 1 } else { 2 };
        let frag_idx_len = if (meta >> 4) & 1 == 0 { 1 } else { 2 };
        let last_idx_len = if (meta >> 3) & 1 == 0 { 1 } else { 2 };
        let seq_len = (meta & 0b111) + 1;

        let bus_id = read_packed(buf, bus_id_len)?;
        let fragment_index = read_packed(buf, frag_idx_len)?;
        let last_index = read_packed(buf, last_idx_len)?;
        let sequence = read_packed_u64(buf, seq_len)?;

        if fragment_index > last_index {
            return Err(DecodeError::IndexOutOfRange {
                fragment_index,
                last_index,
            });
        }

        Ok(Self {
            fragment_type,
            bus_id,
            fragment_index,
            last_index,
            sequence,
        })
    }

    /// Byte length this header will encode to.
    #[must_use]
    pub fn encode_len(&self) -> usize {
        let (bus_id_len, _) = bytes_for_field(self.bus_id).unwrap_or((2, true));
        let (frag_idx_len, _) = bytes_for_field(self.fragment_index).unwrap_or((2, true));
        let (last_idx_len, _) = bytes_for_field(self.last_index).unwrap_or((2, true));
        let seq_len = crate::packet::seq::bytes_needed(self.sequence);
        1 + bus_id_len as usize + frag_idx_len as usize + last_idx_len as usize + seq_len as usize
    }

    /// Builds the ACK counterpart of a DATA header: same fields, tagged
    /// [`FragmentType::Ack`].
    #[must_use]
    pub const fn to_ack(self) -> Self {
        Self {
            fragment_type: FragmentType::Ack,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> Vec<FragmentHeader> {
        vec![
            FragmentHeader {
                fragment_type: FragmentType::Unreliable,
                bus_id: 0,
                fragment_index: 0,
                last_index: 0,
                sequence: 0,
            },
            FragmentHeader {
                fragment_type: FragmentType::Reliable,
                bus_id: 1,
                fragment_index: 3,
                last_index: 10,
                sequence: 42,
            },
            FragmentHeader {
                fragment_type: FragmentType::Sequenced,
                bus_id: 300,
                fragment_index: 65_000,
                last_index: 65_535,
                sequence: u64::MAX,
            },
            FragmentHeader {
                fragment_type: FragmentType::Ack,
                bus_id: 2,
                fragment_index: 0,
                last_index: 0,
                sequence: 1,
            },
        ]
    }

    #[test]
    fn header_round_trips() {
        for header in sample_headers() {
            let mut buf = BytesMut::new();
            header.encode(&mut buf).expect("encodable");
            assert_eq!(buf.len(), header.encode_len());
            let mut bytes = buf.freeze();
            let decoded = FragmentHeader::decode(&mut bytes).expect("decodable");
            assert_eq!(decoded, header);
            assert!(bytes.is_empty(), "decode should consume exactly the header");
        }
    }

    #[test]
    fn min_and_max_len_bounds_hold() {
        let min = FragmentHeader {
            fragment_type: FragmentType::Unreliable,
            bus_id: 0,
            fragment_index: 0,
            last_index: 0,
            sequence: 0,
        };
        assert_eq!(min.encode_len(), MIN_HEADER_LEN);

        let max = FragmentHeader {
            fragment_type: FragmentType::Reliable,
            bus_id: u16::MAX.into(),
            fragment_index: u16::MAX.into(),
            last_index: u16::MAX.into(),
            sequence: u64::MAX,
        };
        assert_eq!(max.encode_len(), MAX_HEADER_LEN);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let mut bytes = Bytes::from_static(&[]);
        assert_eq!(FragmentHeader::decode(&mut bytes), Err(DecodeError::BufferTooShort));
    }

    #[test]
    fn decode_rejects_fragment_index_past_last_index() {
        let header = FragmentHeader {
            fragment_type: FragmentType::Unreliable,
            bus_id: 0,
            fragment_index: 5,
            last_index: 2,
            sequence: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf).expect("encodable");
        let mut bytes = buf.freeze();
        assert_eq!(
            FragmentHeader::decode(&mut bytes),
            Err(DecodeError::IndexOutOfRange {
                fragment_index: 5,
                last_index: 2,
            })
        );
    }

    #[test]
    fn ack_preserves_fields_and_changes_type() {
        let data = FragmentHeader {
            fragment_type: FragmentType::Reliable,
            bus_id: 4,
            fragment_index: 1,
            last_index: 6,
            sequence: 99,
        };
        let ack = data.to_ack();
        assert_eq!(ack.fragment_type, FragmentType::Ack);
        assert_eq!(ack.bus_id, data.bus_id);
        assert_eq!(ack.sequence, data.sequence);
    }
}
