//! See [`RttEstimator`].
//!
//! Grounded directly on the teacher's `aeronet_transport::rtt`, itself based
//! on [`quinn-proto`'s `RttEstimator`](https://github.com/quinn-rs/quinn/blob/411abe9/quinn-proto/src/connection/paths.rs#L151).

use core::time::Duration;

use crate::config::DEFAULT_INITIAL_RTT;

/// Computes an RTT estimation for a network path, tracking a smoothed mean
/// and variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
    min: Duration,
}

const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

impl RttEstimator {
    /// Creates a new estimator seeded with `initial_rtt`.
    #[must_use]
    pub const fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: initial_rtt,
            var: Duration::new(
                initial_rtt.as_secs() / 2,
                (initial_rtt.subsec_nanos() / 2) as u32,
            ),
            min: initial_rtt,
        }
    }

    /// Gets the current best (smoothed) RTT estimation.
    #[must_use]
    pub const fn mean(&self) -> Duration {
        self.smoothed
    }

    /// Gets a conservative estimate of RTT: the maximum of smoothed and
    /// latest RTT, as recommended in §6.1.2 of the QUIC recovery spec.
    #[must_use]
    pub fn conservative(&self) -> Duration {
        self.mean().max(self.latest)
    }

    /// Gets the minimum RTT registered so far.
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Computes the probe timeout duration (PTO), per
    /// [RFC 9002 §6.2.1](https://www.rfc-editor.org/rfc/rfc9002.html#section-6.2.1).
    #[must_use]
    pub fn pto(&self) -> Duration {
        self.mean() + (self.var * 4).max(TIMER_GRANULARITY)
    }

    /// Adds an RTT sample to this estimation.
    pub fn update(&mut self, rtt: Duration) {
        self.latest = rtt;
        self.min = self.min.min(rtt);

        let var_sample = if self.smoothed > rtt {
            self.smoothed - rtt
        } else {
            rtt - self.smoothed
        };
        self.var = (3 * self.var + var_sample) / 4;
        self.smoothed = (7 * self.smoothed + rtt) / 8;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

/// Clamps `rtt * factor` into `[min, max]`, as used to derive the reliable
/// resend period and the non-reliable receiver expiry timeout from the
/// current RTT estimate.
#[must_use]
pub fn clamp_scaled(rtt: Duration, factor: u32, min: Duration, max: Duration) -> Duration {
    (rtt * factor).clamp(min, max)
}

/// Resend timer period bounds, per §5: `clamp(rtt_mean * 1, [10ms, 100ms])`.
pub const RESEND_MIN: Duration = Duration::from_millis(10);
/// See [`RESEND_MIN`].
pub const RESEND_MAX: Duration = Duration::from_millis(100);
/// Non-reliable receiver expiry bounds, per §5:
/// `clamp(rtt_mean * 10, [100ms, 1s])`.
pub const EXPIRY_MIN: Duration = Duration::from_millis(100);
/// See [`EXPIRY_MIN`].
pub const EXPIRY_MAX: Duration = Duration::from_secs(1);

/// Computes the reliable dispatcher resend period from an RTT estimate.
#[must_use]
pub fn resend_period(rtt_mean: Duration) -> Duration {
    clamp_scaled(rtt_mean, 1, RESEND_MIN, RESEND_MAX)
}

/// Computes the non-reliable receiver expiry timeout from an RTT estimate.
#[must_use]
pub fn expiry_timeout(rtt_mean: Duration) -> Duration {
    clamp_scaled(rtt_mean, 10, EXPIRY_MIN, EXPIRY_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resend_period_is_clamped() {
        assert_eq!(resend_period(Duration::from_millis(1)), RESEND_MIN);
        assert_eq!(resend_period(Duration::from_secs(10)), RESEND_MAX);
        assert_eq!(resend_period(Duration::from_millis(50)), Duration::from_millis(50));
    }

    #[test]
    fn expiry_timeout_is_clamped() {
        assert_eq!(expiry_timeout(Duration::from_millis(1)), EXPIRY_MIN);
        assert_eq!(expiry_timeout(Duration::from_secs(10)), EXPIRY_MAX);
        assert_eq!(expiry_timeout(Duration::from_millis(50)), Duration::from_millis(500));
    }

    #[test]
    fn min_tracks_minimum_sample() {
        let mut rtt = RttEstimator::new(Duration::from_millis(500));
        assert_eq!(rtt.min(), Duration::from_millis(500));
        rtt.update(Duration::from_millis(750));
        assert_eq!(rtt.min(), Duration::from_millis(500));
        rtt.update(Duration::from_millis(250));
        assert_eq!(rtt.min(), Duration::from_millis(250));
    }
}
