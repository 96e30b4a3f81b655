//! See [`Heartbeat`].

use crate::pool::Handle;

/// Tracks which endpoints are subscribed to the shared 10 Hz heartbeat tick
/// and the platform timer handle backing it, if one is currently armed.
///
/// Mirrors the component design's single-timer-many-subscribers shape: an
/// empty subscriber list means the timer should be stopped; the first
/// subscription starts it again.
#[derive(Debug, Default)]
pub struct Heartbeat<TimerHandle> {
    endpoints: Vec<Handle<crate::endpoint::Endpoint>>,
    timer: Option<TimerHandle>,
}

impl<TimerHandle> Heartbeat<TimerHandle> {
    /// Creates an empty, unarmed heartbeat.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            timer: None,
        }
    }

    /// Subscribes an endpoint. Returns `true` if this was the first
    /// subscriber (the caller should arm the platform timer and store its
    /// handle via [`Heartbeat::set_timer`]).
    pub fn subscribe(&mut self, endpoint: Handle<crate::endpoint::Endpoint>) -> bool {
        let was_empty = self.endpoints.is_empty();
        if !self.endpoints.contains(&endpoint) {
            self.endpoints.push(endpoint);
        }
        was_empty
    }

    /// Unsubscribes an endpoint. Returns `true` if the list just became
    /// empty (the caller should stop and clear the platform timer).
    pub fn unsubscribe(&mut self, endpoint: Handle<crate::endpoint::Endpoint>) -> bool {
        self.endpoints.retain(|&e| e != endpoint);
        self.endpoints.is_empty()
    }

    /// Every currently-subscribed endpoint, to fan a tick out to.
    #[must_use]
    pub fn endpoints(&self) -> &[Handle<crate::endpoint::Endpoint>] {
        &self.endpoints
    }

    pub fn set_timer(&mut self, timer: TimerHandle) {
        self.timer = Some(timer);
    }

    pub fn take_timer(&mut self) -> Option<TimerHandle> {
        self.timer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_subscriber_and_last_unsubscriber_are_reported() {
        let mut pool: crate::pool::Pool<crate::endpoint::Endpoint> = crate::pool::Pool::new();
        let a = pool.acquire(crate::endpoint::Endpoint::new(0, crate::config::Config::new(64)));
        let b = pool.acquire(crate::endpoint::Endpoint::new(0, crate::config::Config::new(64)));

        let mut heartbeat: Heartbeat<()> = Heartbeat::new();
        assert!(heartbeat.subscribe(a));
        assert!(!heartbeat.subscribe(b));
        assert!(!heartbeat.unsubscribe(a));
        assert!(heartbeat.unsubscribe(b));
    }
}
