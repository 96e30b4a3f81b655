//! Read-only statistics gathered per [`crate::endpoint::Endpoint`].
//!
//! Supplemented ambient observability (see `SPEC_FULL.md` §1.2): pure
//! counters, never read back by the protocol logic itself, mirroring the
//! teacher's `MessageStats`.

use derive_more::{Add, AddAssign, Sub, SubAssign};

/// Snapshot of delivery statistics for one [`crate::endpoint::Endpoint`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(Add, AddAssign, Sub, SubAssign)]
pub struct Stats {
    /// Parcels handed off to a [`crate::sender::Sender`] that completed
    /// dispatch to at least one bus successfully.
    pub parcels_sent: usize,
    /// Parcels fully reassembled and delivered upward to the application.
    pub parcels_recv: usize,
    /// Individual fragment (re)transmissions triggered by a reliable
    /// dispatcher's resend timer.
    pub fragments_resent: usize,
    /// Receivers that failed checksum verification.
    pub checksum_failures: usize,
    /// ACK fragments received that matched an in-flight dispatcher.
    pub acks_recv: usize,
}
