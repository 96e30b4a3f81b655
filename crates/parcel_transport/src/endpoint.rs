//! See [`Endpoint`].

use ahash::AHashMap;
use web_time::Instant;

use crate::{bus::Bus, config::Config, packet::Seq, rtt::RttEstimator};

/// One outstanding RTT-measurement ping: when it was sent, so the pong
/// handler can compute the sample.
#[derive(Debug, Clone, Copy)]
struct PendingPing {
    sent_at: Instant,
    local_send_nanos: i64,
}

/// Owner of `nbuses` user buses plus one system bus (bus id 0), and
/// everything that's per-peer rather than per-bus: RTT estimation, clock
/// offset, readiness, and in-flight ping bookkeeping.
#[derive(Debug)]
pub struct Endpoint {
    buses: Vec<Bus>,
    rtt: RttEstimator,
    clock: parcel_io::clock::Clock,
    ready: bool,
    time_sync: bool,
    next_ping_sequence: u16,
    pending_pings: AHashMap<u16, PendingPing>,
    heartbeat_registered: bool,
}

impl Endpoint {
    /// Creates an endpoint with `nbuses` user buses (plus the system bus),
    /// seeded from `config`.
    #[must_use]
    pub fn new(nbuses: u32, config: Config) -> Self {
        let mut buses = Vec::with_capacity(nbuses as usize + 1);
        buses.push(Bus::new(0));
        for i in 1..=nbuses {
            buses.push(Bus::new(i));
        }
        Self {
            buses,
            rtt: RttEstimator::new(config.initial_rtt),
            clock: parcel_io::clock::Clock::new(),
            ready: false,
            time_sync: false,
            next_ping_sequence: 0,
            pending_pings: AHashMap::new(),
            heartbeat_registered: false,
        }
    }

    /// Number of user buses (not counting the system bus).
    #[must_use]
    pub fn nbuses(&self) -> u32 {
        (self.buses.len() - 1) as u32
    }

    /// Resolves a wire bus id (`0` = system, `i` = user bus `i - 1`) to a
    /// bus, if it exists.
    #[must_use]
    pub fn bus(&self, bus_id: u32) -> Option<&Bus> {
        self.buses.get(bus_id as usize)
    }

    /// Mutable counterpart of [`Endpoint::bus`].
    #[must_use]
    pub fn bus_mut(&mut self, bus_id: u32) -> Option<&mut Bus> {
        self.buses.get_mut(bus_id as usize)
    }

    /// Resolves a 0-based user bus index to its wire bus id, validating it
    /// against `nbuses`.
    #[must_use]
    pub fn user_bus_id(&self, index: u32) -> Option<u32> {
        (index < self.nbuses()).then_some(index + 1)
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    /// Marks the endpoint ready. Idempotent.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    #[must_use]
    pub const fn time_sync_enabled(&self) -> bool {
        self.time_sync
    }

    pub fn set_time_sync(&mut self, enabled: bool) {
        self.time_sync = enabled;
    }

    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    #[must_use]
    pub const fn clock(&self) -> &parcel_io::clock::Clock {
        &self.clock
    }

    #[must_use]
    pub const fn is_heartbeat_registered(&self) -> bool {
        self.heartbeat_registered
    }

    pub fn set_heartbeat_registered(&mut self, registered: bool) {
        self.heartbeat_registered = registered;
    }

    /// Allocates the next ping sequence and records its send time, for
    /// later correlation when the pong arrives.
    pub fn begin_ping(&mut self, sent_at: Instant, local_send_nanos: i64) -> u16 {
        let sequence = self.next_ping_sequence;
        self.next_ping_sequence = self.next_ping_sequence.wrapping_add(1);
        self.pending_pings.insert(sequence, PendingPing { sent_at, local_send_nanos });
        sequence
    }

    /// Consumes the pending ping record for `sequence`, if any, and folds
    /// the observed round trip into the RTT estimator.
    pub fn complete_ping(&mut self, sequence: u16, now: Instant) -> Option<i64> {
        let pending = self.pending_pings.remove(&sequence)?;
        self.rtt.update(now.duration_since(pending.sent_at));
        Some(pending.local_send_nanos)
    }

    /// Every bus, including the system bus at index 0.
    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    /// Mutable counterpart of [`Endpoint::buses`].
    pub fn buses_mut(&mut self) -> &mut [Bus] {
        &mut self.buses
    }
}

/// Per-receiver bookkeeping the endpoint's receive path needs that doesn't
/// belong to any one bus: the sequence used to key a just-created receiver
/// in its bus's map.
#[must_use]
pub fn sequence_from_header_field(value: u64) -> Seq {
    Seq(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_endpoint_has_system_bus_plus_nbuses_user_buses() {
        let endpoint = Endpoint::new(3, Config::new(64));
        assert_eq!(endpoint.nbuses(), 3);
        assert!(endpoint.bus(0).unwrap().is_system());
        assert!(!endpoint.bus(1).unwrap().is_system());
        assert!(endpoint.bus(4).is_none());
    }

    #[test]
    fn user_bus_id_offsets_by_one() {
        let endpoint = Endpoint::new(2, Config::new(64));
        assert_eq!(endpoint.user_bus_id(0), Some(1));
        assert_eq!(endpoint.user_bus_id(1), Some(2));
        assert_eq!(endpoint.user_bus_id(2), None);
    }

    #[test]
    fn complete_ping_updates_rtt_and_returns_send_time() {
        let mut endpoint = Endpoint::new(0, Config::new(64));
        let t0 = Instant::now();
        let seq = endpoint.begin_ping(t0, 0);
        let t1 = t0 + core::time::Duration::from_millis(20);
        let send_nanos = endpoint.complete_ping(seq, t1).unwrap();
        assert_eq!(send_nanos, 0);
        assert!(endpoint.rtt().mean() < Config::new(64).initial_rtt);
    }
}
