//! The external collaborator that serialises deferred callbacks onto one
//! owning thread.

use core::fmt;

/// Serialises deferred callbacks so they run, one at a time and in submission
/// order, on some single "owning" thread.
///
/// Every pipeline-bearing entity in `parcel_transport` (`Sender`,
/// `Dispatcher`, `Receiver`) submits its resume/ack/timeout callbacks through
/// a `Sequencer` rather than running them in-line - this is what lets a
/// worker-thread checksum completion or a timer fire safely re-enter state
/// that's otherwise only ever touched from one thread.
pub trait Sequencer {
    /// Submits a task to run later on the owning thread.
    fn submit(&self, task: Box<dyn FnOnce() + Send>);
}

/// A [`Sequencer`] that runs every submitted task immediately, in-line on the
/// calling thread.
///
/// This is safe to use in `parcel_transport` specifically because the
/// `Pipeline` driver's BUSY/NEXT_PENDING/FINISH_PENDING flags tolerate
/// synchronous re-entrancy - see `parcel_transport::pipeline`. Useful for
/// single-threaded, deterministic tests.
#[derive(Default, Clone, Copy)]
pub struct InlineSequencer;

impl fmt::Debug for InlineSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InlineSequencer")
    }
}

impl Sequencer for InlineSequencer {
    fn submit(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}
