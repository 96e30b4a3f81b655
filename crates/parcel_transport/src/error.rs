//! Typed errors surfaced at the crate's fallible boundaries.
//!
//! Per-fragment conditions that the protocol says to drop silently (decode
//! failure, stale sequence, duplicate fragment, ...) are still represented as
//! one of these variants internally, logged at `trace`/`debug`, and then
//! discarded - never `unwrap`'d or `panic!`'d away.

use derive_more::{Display, Error};

use crate::packet::header::FragmentType;

/// Failure decoding or validating an inbound fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum DecodeError {
    /// Fewer bytes were available than the header claims to need.
    #[display("buffer too short to decode a fragment header")]
    BufferTooShort,
    /// `last_index` exceeds the context's configured `max_fragments`.
    #[display("last_index {last_index} exceeds max_fragments {max_fragments}")]
    TooManyFragments {
        /// Decoded `last_index`.
        last_index: u32,
        /// Configured ceiling.
        max_fragments: u32,
    },
    /// `fragment_index` is greater than `last_index`.
    #[display("fragment_index {fragment_index} exceeds last_index {last_index}")]
    IndexOutOfRange {
        /// Decoded fragment index.
        fragment_index: u32,
        /// Decoded last index.
        last_index: u32,
    },
}

/// A fragment was rejected by bus-level reassembly logic.
///
/// All of these are non-fatal: the fragment is dropped and, where the
/// protocol calls for it, an ACK may still be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum RecvError {
    /// Decoding the header or validating basic bounds failed.
    #[display("decode error: {_0}")]
    Decode(DecodeError),
    /// A fragment arrived for a user bus before the endpoint was marked
    /// ready.
    #[display("bus not ready")]
    BusNotReady,
    /// A reliable fragment arrived with a sequence that does not match the
    /// bus's current in-flight reliable receiver.
    #[display(
        "reliable reassembly mismatch: fragment sequence {fragment_seq} does not match \
         in-flight sequence {incomplete_seq}"
    )]
    ReliableMismatch {
        /// Sequence carried by the fragment.
        fragment_seq: u64,
        /// Sequence of the bus's current incomplete reliable receiver.
        incomplete_seq: u64,
    },
    /// A sequenced fragment's parcel sequence is older than the last one
    /// delivered upward.
    #[display("stale sequenced parcel: {seq} < {last_delivered}")]
    StaleSequenced {
        /// Sequence carried by the fragment.
        seq: u64,
        /// Last sequence already delivered on this bus.
        last_delivered: u64,
    },
    /// An existing receiver for this sequence has different metadata
    /// (fragment type or total fragment count) than this fragment.
    #[display("receiver metadata mismatch for sequence {seq}")]
    MetaMismatch {
        /// Sequence that mismatched.
        seq: u64,
    },
    /// This exact fragment index has already been received for this
    /// sequence.
    #[display("duplicate fragment {fragment_index} for sequence {seq}")]
    DuplicateFragment {
        /// Sequence of the parcel.
        seq: u64,
        /// Index of the duplicate fragment.
        fragment_index: u32,
    },
}

/// Failure acquiring a pool-backed entity (parcel, sender, dispatcher,
/// receiver).
///
/// Surfaces to the caller as the relevant entity being marked `FAILED`; never
/// panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum ResourceError {
    /// The parcel would need more chunks than `max_fragments` allows.
    #[display("parcel exceeds max_fragments ({max_fragments})")]
    TooManyFragments {
        /// Configured ceiling.
        max_fragments: u32,
    },
    /// The bus index requested does not exist on this endpoint.
    #[display("bus index {index} out of range (endpoint has {nbuses} user buses)")]
    InvalidBus {
        /// Requested bus index.
        index: u32,
        /// Number of user buses configured.
        nbuses: u32,
    },
    /// A pool-backed handle was stale (entity already released).
    #[display("stale handle")]
    StaleHandle,
}

/// Failure building a [`crate::packet::header::FragmentHeader`] from values
/// that don't fit the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("value {value} does not fit in {max_bytes} bytes")]
pub struct EncodeRangeError {
    /// Offending value.
    pub value: u64,
    /// Maximum byte width available for this field.
    pub max_bytes: u8,
}

static_assertions::assert_impl_all!(FragmentType: Copy, PartialEq);
