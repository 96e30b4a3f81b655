//! Endpoint clock: an estimate of the peer's wall-clock offset from our own,
//! updated via system-bus ping/pong time-sync exchanges.
//!
//! See the design notes on atomic clock offsets: this is written from the
//! endpoint's owning thread and may be read from any thread that wants to
//! compute adjusted wall time, so a relaxed atomic is sufficient.

use core::sync::atomic::{AtomicI64, Ordering};

/// Readable/writable estimate of the offset (in nanoseconds) to add to local
/// time to approximate the peer's wall time.
#[derive(Debug, Default)]
pub struct Clock {
    offset_nanos: AtomicI64,
}

impl Clock {
    /// Creates a clock with a zero offset.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            offset_nanos: AtomicI64::new(0),
        }
    }

    /// Reads the current offset estimate. May be called from any thread.
    #[must_use]
    pub fn offset_nanos(&self) -> i64 {
        self.offset_nanos.load(Ordering::Relaxed)
    }

    /// Updates the offset from one ping/pong exchange.
    ///
    /// `local_send_nanos` and `local_recv_nanos` are this endpoint's own
    /// monotonic timestamps for when the ping left and the pong arrived.
    /// `peer_time_nanos` is the wall-clock time the peer echoed back in the
    /// pong payload. The offset is estimated against the midpoint of the
    /// round trip, following the standard two-way time transfer assumption
    /// that the path is roughly symmetric.
    pub fn update(&self, local_send_nanos: i64, peer_time_nanos: i64, local_recv_nanos: i64) {
        let local_mid = local_send_nanos + (local_recv_nanos - local_send_nanos) / 2;
        let offset = peer_time_nanos - local_mid;
        self.offset_nanos.store(offset, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_path_estimates_offset() {
        let clock = Clock::new();
        // peer is 1000ns ahead of us; round trip takes 200ns, so the pong
        // arrives carrying peer_time = local_mid + 1000
        clock.update(0, 1100, 200);
        assert_eq!(clock.offset_nanos(), 1000);
    }
}
