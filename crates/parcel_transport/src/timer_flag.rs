//! See [`TimerFlag`].
//!
//! Pooled entities (e.g. [`crate::dispatcher::Dispatcher`]) need to remember
//! that a resend timer fired, but they are plain data stored in a
//! [`crate::pool::Pool`] - they cannot themselves hold a
//! `D::Handle` for a generic [`parcel_io::timer::TimerDriver`] `D` without
//! infecting every entity type with that generic parameter. Instead, an
//! entity holds a cheap `Clone + Send + 'static` flag; the
//! [`parcel_io::timer::TimerDriver`] handle itself (which the flag's owner
//! needs to cancel the timer) lives in a side table on
//! [`crate::context::Context`], keyed by the entity's pool handle.

use std::sync::{atomic::{AtomicBool, Ordering}, Arc};

/// A flag a timer callback sets and a poll loop later takes (swaps back to
/// `false`), used to bridge an arbitrary-thread timer callback back to the
/// single-threaded context that owns the entity the timer is armed for.
#[derive(Debug, Clone, Default)]
pub struct TimerFlag(Arc<AtomicBool>);

impl TimerFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Sets the flag. Called from the timer callback, on whatever thread
    /// the [`parcel_io::timer::TimerDriver`] fires on.
    pub fn mark(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Reads and clears the flag in one step.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_the_flag() {
        let flag = TimerFlag::new();
        assert!(!flag.take());
        flag.mark();
        assert!(flag.take());
        assert!(!flag.take());
    }
}
