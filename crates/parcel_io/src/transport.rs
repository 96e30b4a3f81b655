//! The external transport collaborator: an unordered, unreliable datagram
//! channel that this crate fragments, sequences, and resends over.
//!
//! See the crate's out-of-scope notes: the concrete UDP/QUIC/whatever socket,
//! its handshake, and any encryption all live below this trait.

use core::fmt;

/// A single contiguous view into a buffer, used as one element of a gather
/// write passed to [`Transport::send`].
///
/// A single fragment is usually sent as `[header_view, content_view]`, plus an
/// optional third view carrying a trailing checksum.
#[derive(Clone, Copy)]
pub struct IoSlice<'a>(&'a [u8]);

impl<'a> IoSlice<'a> {
    /// Wraps a byte slice as a gather-write view.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    /// Borrows the underlying bytes.
    #[must_use]
    pub const fn as_slice(&self) -> &'a [u8] {
        self.0
    }

    /// Number of bytes in this view.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if this view is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for IoSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSlice").field("len", &self.len()).finish()
    }
}

/// Failure returned by [`Transport::send`].
///
/// Never fatal to the endpoint: a failed send is handled the same way as a
/// dropped packet would be (retried by the reliability layer if the mode
/// calls for it, or simply lost if unreliable).
#[derive(Debug, Clone, Copy, derive_more::Display, derive_more::Error)]
#[display("transport send failed")]
pub struct SendError;

/// The concrete datagram socket collaborator.
///
/// `parcel_transport` never constructs raw sockets itself; it is handed a
/// `Transport` implementation by the owning application (typically wrapping
/// the session/channel handshake mentioned as out of scope in the top-level
/// design).
pub trait Transport {
    /// Sends a gathered list of buffer views as a single datagram.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the underlying socket failed to send.
    fn send(&mut self, views: &[IoSlice<'_>]) -> Result<(), SendError>;

    /// Drains every complete, undecoded datagram payload received since the
    /// last call to this method.
    fn poll_recv(&mut self) -> Vec<Vec<u8>>;
}
