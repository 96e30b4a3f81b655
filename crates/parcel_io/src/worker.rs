//! The external worker-thread collaborator used to offload checksum
//! computation off the owning thread, and the checksum algorithm collaborator
//! itself.

/// Computes a checksum over a sequence of buffer chunks.
///
/// Out of scope for this crate: the concrete hashing/crypto algorithm backing
/// this. `parcel_transport` treats the result as an opaque byte string of
/// fixed length.
pub trait Checksum: Send + Sync + 'static {
    /// Number of bytes this algorithm's checksum occupies on the wire.
    const LEN: usize;

    /// Computes the checksum over all chunks, concatenated in the order
    /// given.
    fn compute(&self, chunks: &[&[u8]]) -> Vec<u8>;
}

/// Submits checksum computation to run off the owning thread.
///
/// Implementations typically route `on_complete` back through a
/// [`crate::sequencer::Sequencer`] so it re-enters the owning thread safely.
pub trait Worker {
    /// Opaque handle to an in-flight task, used for cancellation.
    type TaskHandle: Clone + Send;

    /// Submits work to run off-thread, invoking `on_complete` with the result
    /// once finished.
    fn submit(
        &self,
        work: Box<dyn FnOnce() -> Vec<u8> + Send>,
        on_complete: Box<dyn FnOnce(Vec<u8>) + Send>,
    ) -> Self::TaskHandle;

    /// Cancels a previously submitted task.
    ///
    /// Best-effort: if the task has already completed, or completes
    /// concurrently with this call, `on_complete` may still run. Callers must
    /// tolerate a completion callback firing after cancellation.
    fn cancel(&self, handle: &Self::TaskHandle);
}

/// A [`Worker`] that runs work synchronously, in-line on the calling thread.
///
/// Useful for deterministic single-threaded tests; there is no real
/// off-thread work happening, so [`Worker::cancel`] is always a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineWorker;

/// Handle type for [`InlineWorker`]. Carries no state, since work has already
/// completed by the time [`Worker::submit`] returns.
#[derive(Debug, Clone, Copy)]
pub struct InlineTaskHandle;

impl Worker for InlineWorker {
    type TaskHandle = InlineTaskHandle;

    fn submit(
        &self,
        work: Box<dyn FnOnce() -> Vec<u8> + Send>,
        on_complete: Box<dyn FnOnce(Vec<u8>) + Send>,
    ) -> Self::TaskHandle {
        let result = work();
        on_complete(result);
        InlineTaskHandle
    }

    fn cancel(&self, _handle: &Self::TaskHandle) {}
}
