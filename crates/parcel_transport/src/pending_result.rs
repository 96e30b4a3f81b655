//! See [`PendingResult`].
//!
//! Same bridge role as [`crate::timer_flag::TimerFlag`], but for a
//! [`parcel_io::worker::Worker`] completion callback that carries a value
//! (the computed checksum) rather than a bare signal.

use std::sync::{Arc, Mutex};

/// A one-shot, `Clone + Send + 'static` slot a worker completion callback
/// writes into, polled later by the single-threaded context that owns the
/// entity waiting on it.
#[derive(Debug, Clone, Default)]
pub struct PendingResult(Arc<Mutex<Option<Vec<u8>>>>);

impl PendingResult {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Writes the result. Called from the worker completion callback, on
    /// whatever thread the [`parcel_io::worker::Worker`] runs it on.
    pub fn complete(&self, value: Vec<u8>) {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(value);
    }

    /// Takes the result if one has been written.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}
