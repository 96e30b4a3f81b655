//! The external platform timer collaborator: one-shot and repeating timers
//! used for resend, receiver expiry, and the heartbeat.

use core::time::Duration;
use std::sync::{Arc, Mutex};

/// Handle to an armed timer.
pub trait TimerHandle {
    /// Cancels this timer. Idempotent - cancelling an already-fired or
    /// already-cancelled timer is a no-op.
    fn cancel(&mut self);
}

/// Starts platform timers.
///
/// Out of scope for this crate: the concrete event loop backing this (an
/// `epoll`/`kqueue`/`IOCP` reactor, or a simple thread with a sleep loop).
/// `parcel_transport` only ever arms timers through this trait and reacts to
/// their fire callback, which implementations should route through a
/// [`crate::sequencer::Sequencer`] so it's safe to touch owning-thread state.
pub trait TimerDriver {
    /// Concrete handle type returned by [`TimerDriver::start`].
    type Handle: TimerHandle;

    /// Arms a timer that invokes `on_fire` after `period` elapses. If
    /// `repeating` is `true`, it fires again every `period` until cancelled;
    /// otherwise it fires once.
    fn start(&self, period: Duration, repeating: bool, on_fire: Box<dyn FnMut() + Send>)
    -> Self::Handle;
}

struct ArmedTimer {
    repeating: bool,
    on_fire: Box<dyn FnMut() + Send>,
    canceled: bool,
}

/// A [`TimerDriver`] with no real clock behind it: timers never fire on
/// their own. A test drives time forward explicitly by calling
/// [`InlineTimerDriver::fire_all`], which is what lets resend/expiry/
/// heartbeat behaviour be exercised deterministically without sleeping.
#[derive(Default, Clone)]
pub struct InlineTimerDriver {
    armed: Arc<Mutex<Vec<ArmedTimer>>>,
}

impl core::fmt::Debug for InlineTimerDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("InlineTimerDriver")
    }
}

/// Handle to a timer armed on an [`InlineTimerDriver`].
#[derive(Clone)]
pub struct InlineTimerHandle {
    index: usize,
    armed: Arc<Mutex<Vec<ArmedTimer>>>,
}

impl TimerHandle for InlineTimerHandle {
    fn cancel(&mut self) {
        if let Some(timer) = self.armed.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get_mut(self.index) {
            timer.canceled = true;
        }
    }
}

impl TimerDriver for InlineTimerDriver {
    type Handle = InlineTimerHandle;

    fn start(
        &self,
        _period: Duration,
        repeating: bool,
        on_fire: Box<dyn FnMut() + Send>,
    ) -> Self::Handle {
        let mut armed = self.armed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let index = armed.len();
        armed.push(ArmedTimer { repeating, on_fire, canceled: false });
        InlineTimerHandle { index, armed: self.armed.clone() }
    }
}

impl InlineTimerDriver {
    /// Creates a driver with nothing armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires every non-canceled armed timer once, in arming order. One-shot
    /// timers are removed (in place, as no-ops) after firing; repeating
    /// timers stay armed for the next call.
    pub fn fire_all(&self) {
        let mut armed = self.armed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for timer in armed.iter_mut() {
            if timer.canceled {
                continue;
            }
            (timer.on_fire)();
            if !timer.repeating {
                timer.canceled = true;
            }
        }
    }
}
