//! User-configurable properties of a root [`crate::context::Context`].
//!
//! A `Config` is taken by value into [`crate::context::Context::new`] and has
//! no setter afterwards - this is what makes `max_fragments` structurally
//! immutable after context creation (see the resolved open question in the
//! design notes: a parcel already in reassembly must never be re-validated
//! against a changed `max_fragments`, so the simplest correct fix is to make
//! changing it impossible).

use core::time::Duration;

use crate::packet::header::MAX_HEADER_LEN;

/// Default cap on the number of fragments (chunks) a single parcel may be
/// split into.
pub const DEFAULT_MAX_FRAGMENTS: u32 = 256;

/// Hard upper bound on [`Config::max_fragments`], matching the width of the
/// wire's `last_index` field (up to 2 bytes, so up to `u16::MAX`).
pub const MAX_FRAGMENTS_HARD_CAP: u32 = 65_536;

/// Default memory ceiling for a single receiver's in-flight reassembly
/// buffer, mirroring `TransportConfig::max_memory_usage` in the teacher.
pub const DEFAULT_MAX_MEMORY_USAGE: usize = 4 * 1024 * 1024;

/// Default seed RTT before any samples have been taken, matching
/// [RFC 9002 §6.2.2](https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.2-1).
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

/// Default heartbeat tick rate (10 Hz, per §4.9).
pub const DEFAULT_HEARTBEAT_RATE: Duration = Duration::from_millis(100);

/// Root configuration for a [`crate::context::Context`].
///
/// Immutable for the lifetime of the context it's given to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// MTU in bytes: the maximum size of a single datagram this layer will
    /// produce, including the fragment header.
    ///
    /// Must exceed [`MAX_HEADER_LEN`].
    pub fragment_capacity: usize,
    /// Cap on the number of chunks (and therefore fragments) a single parcel
    /// may be split into.
    pub max_fragments: u32,
    /// Whether pools backing this context must be safe to access
    /// concurrently from multiple threads.
    ///
    /// When `false` (the default), entities are only ever touched from the
    /// context's owning thread, as reached through the
    /// [`parcel_io::sequencer::Sequencer`] - this is the common case for a
    /// single-threaded cooperative scheduler.
    pub synchronized: bool,
    /// Memory ceiling, in bytes, for a single in-flight receiver's
    /// reassembly buffer.
    pub max_memory_usage: usize,
    /// Seed value for each endpoint's RTT estimator before any samples have
    /// been taken.
    pub initial_rtt: Duration,
    /// Tick rate of the shared heartbeat driving endpoint pings.
    pub heartbeat_rate: Duration,
}

impl Config {
    /// Creates a config with the given MTU and otherwise-default settings.
    ///
    /// # Panics
    ///
    /// Panics if `fragment_capacity` does not exceed [`MAX_HEADER_LEN`].
    #[must_use]
    pub fn new(fragment_capacity: usize) -> Self {
        assert!(
            fragment_capacity > MAX_HEADER_LEN,
            "fragment_capacity ({fragment_capacity}) must exceed the maximum header length \
             ({MAX_HEADER_LEN})"
        );
        Self {
            fragment_capacity,
            max_fragments: DEFAULT_MAX_FRAGMENTS,
            synchronized: false,
            max_memory_usage: DEFAULT_MAX_MEMORY_USAGE,
            initial_rtt: DEFAULT_INITIAL_RTT,
            heartbeat_rate: DEFAULT_HEARTBEAT_RATE,
        }
    }

    /// Maximum content bytes a single fragment may carry, after subtracting
    /// the largest possible header.
    #[must_use]
    pub const fn fragment_content_capacity(&self) -> usize {
        self.fragment_capacity - MAX_HEADER_LEN
    }

    /// Builder-style override of `max_fragments`, clamped to
    /// [`MAX_FRAGMENTS_HARD_CAP`].
    #[must_use]
    pub const fn with_max_fragments(mut self, max_fragments: u32) -> Self {
        self.max_fragments = if max_fragments > MAX_FRAGMENTS_HARD_CAP {
            MAX_FRAGMENTS_HARD_CAP
        } else {
            max_fragments
        };
        self
    }

    /// Builder-style override of `synchronized`.
    #[must_use]
    pub const fn with_synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }

    /// Builder-style override of `max_memory_usage`.
    #[must_use]
    pub const fn with_max_memory_usage(mut self, max_memory_usage: usize) -> Self {
        self.max_memory_usage = max_memory_usage;
        self
    }

    /// Builder-style override of `initial_rtt`.
    #[must_use]
    pub const fn with_initial_rtt(mut self, initial_rtt: Duration) -> Self {
        self.initial_rtt = initial_rtt;
        self
    }

    /// Builder-style override of `heartbeat_rate`.
    #[must_use]
    pub const fn with_heartbeat_rate(mut self, heartbeat_rate: Duration) -> Self {
        self.heartbeat_rate = heartbeat_rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "must exceed")]
    fn rejects_too_small_mtu() {
        Config::new(4);
    }

    #[test]
    fn fragment_content_capacity_subtracts_max_header() {
        let config = Config::new(64);
        assert_eq!(config.fragment_content_capacity(), 64 - MAX_HEADER_LEN);
    }
}
