//! See [`Bus`].

use std::collections::{BinaryHeap, VecDeque};

use ahash::AHashMap;
use web_time::Instant;

use crate::{
    packet::Seq,
    pool::Handle,
    receiver::{ExpiryEntry, Receiver},
};

/// One logical channel on an [`crate::endpoint::Endpoint`]: bus id `0` is
/// the system bus (ping/pong, reserved), ids `1..=nbuses` are user buses.
///
/// Holds everything needed for head-of-line-blocked reliable dispatch and
/// per-sequence receive reassembly. Lives directly inside its owning
/// endpoint's `Vec<Bus>` rather than in its own pool, since an endpoint's
/// bus count never changes after construction.
#[derive(Debug)]
pub struct Bus {
    id: u32,
    pending_dispatch: VecDeque<Handle<crate::dispatcher::Dispatcher>>,
    incomplete_reliable_dispatcher: Option<Handle<crate::dispatcher::Dispatcher>>,
    receivers_by_seq: AHashMap<Seq, Handle<Receiver>>,
    expiry_heap: BinaryHeap<ExpiryEntry>,
    incomplete_reliable_receiver: Option<Handle<Receiver>>,
    last_recv_reliable_sequence: Seq,
    last_recv_sequenced_sequence: Seq,
    sequence_generator: Seq,
    processing: bool,
    stopping: bool,
}

impl Bus {
    /// Creates a fresh, empty bus with the given wire id.
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self {
            id,
            pending_dispatch: VecDeque::new(),
            incomplete_reliable_dispatcher: None,
            receivers_by_seq: AHashMap::new(),
            expiry_heap: BinaryHeap::new(),
            incomplete_reliable_receiver: None,
            last_recv_reliable_sequence: Seq::ZERO,
            last_recv_sequenced_sequence: Seq::ZERO,
            sequence_generator: Seq::ZERO,
            processing: false,
            stopping: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        self.id == 0
    }

    /// Draws the next dense outgoing parcel sequence for this bus (1, 2,
    /// 3, ...).
    pub fn next_sequence(&mut self) -> Seq {
        self.sequence_generator = self.sequence_generator.next();
        self.sequence_generator
    }

    /// Enqueues a freshly-created dispatcher at the back of the pending
    /// FIFO.
    pub fn enqueue_dispatcher(&mut self, dispatcher: Handle<crate::dispatcher::Dispatcher>) {
        self.pending_dispatch.push_back(dispatcher);
    }

    #[must_use]
    pub const fn incomplete_reliable_dispatcher(&self) -> Option<Handle<crate::dispatcher::Dispatcher>> {
        self.incomplete_reliable_dispatcher
    }

    /// Pops and returns the next dispatcher to submit, per the
    /// head-of-line-blocking rule: keep popping while no reliable dispatcher
    /// is currently in flight and the bus is not stopping. A popped reliable
    /// dispatcher is installed as `incomplete_reliable_dispatcher` and the
    /// loop should stop after submitting it (call this again only once that
    /// one completes).
    ///
    /// Returns `None` when the queue is empty or a reliable dispatcher is
    /// already in flight.
    pub fn pop_next_to_submit(&mut self, is_reliable: impl Fn(Handle<crate::dispatcher::Dispatcher>) -> bool) -> Option<Handle<crate::dispatcher::Dispatcher>> {
        if self.incomplete_reliable_dispatcher.is_some() || self.stopping {
            return None;
        }
        let dispatcher = self.pending_dispatch.pop_front()?;
        if is_reliable(dispatcher) {
            self.incomplete_reliable_dispatcher = Some(dispatcher);
        }
        Some(dispatcher)
    }

    /// Called when a dispatcher finishes (success/failure/cancel); clears
    /// the reliable gate if this was the incomplete reliable dispatcher, so
    /// the next call to [`Bus::pop_next_to_submit`] can proceed.
    pub fn on_dispatcher_completed(&mut self, dispatcher: Handle<crate::dispatcher::Dispatcher>) {
        if self.incomplete_reliable_dispatcher == Some(dispatcher) {
            self.incomplete_reliable_dispatcher = None;
        }
    }

    #[must_use]
    pub const fn last_recv_reliable_sequence(&self) -> Seq {
        self.last_recv_reliable_sequence
    }

    #[must_use]
    pub const fn last_recv_sequenced_sequence(&self) -> Seq {
        self.last_recv_sequenced_sequence
    }

    #[must_use]
    pub const fn incomplete_reliable_receiver(&self) -> Option<Handle<Receiver>> {
        self.incomplete_reliable_receiver
    }

    #[must_use]
    pub fn receiver_for(&self, sequence: Seq) -> Option<Handle<Receiver>> {
        self.receivers_by_seq.get(&sequence).copied()
    }

    pub fn insert_receiver(&mut self, sequence: Seq, receiver: Handle<Receiver>, is_reliable: bool) {
        self.receivers_by_seq.insert(sequence, receiver);
        if is_reliable {
            self.incomplete_reliable_receiver = Some(receiver);
            self.last_recv_reliable_sequence = sequence;
        }
    }

    pub fn push_expiry(&mut self, entry: ExpiryEntry) {
        self.expiry_heap.push(entry);
    }

    /// Pops every receiver whose expiry deadline has passed, up to `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Handle<Receiver>> {
        let mut expired = Vec::new();
        while let Some(top) = self.expiry_heap.peek() {
            if top.expires_at > now {
                break;
            }
            let entry = self.expiry_heap.pop().expect("just peeked");
            expired.push(entry.receiver);
        }
        expired
    }

    /// Removes a receiver from the sequence map and clears the reliable
    /// gate if it was the incomplete reliable receiver. The expiry heap is
    /// left with a stale entry, if any - harmless, since
    /// [`Bus::pop_expired`] checks the map is still consulted by the caller
    /// before acting on an expired handle.
    pub fn remove_receiver(&mut self, sequence: Seq, receiver: Handle<Receiver>) {
        self.receivers_by_seq.remove(&sequence);
        if self.incomplete_reliable_receiver == Some(receiver) {
            self.incomplete_reliable_receiver = None;
        }
    }

    /// Updates the high-water mark for sequenced delivery. The caller is
    /// responsible for having already checked `sequence >=
    /// last_recv_sequenced_sequence`.
    pub fn advance_sequenced(&mut self, sequence: Seq) {
        self.last_recv_sequenced_sequence = sequence;
    }

    #[must_use]
    pub const fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    #[must_use]
    pub const fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Begins stopping this bus: if currently processing a callback, the
    /// caller must defer the actual teardown (drain queues et al.) until
    /// processing finishes, to avoid tearing down state a pipeline callback
    /// is mid-way through touching.
    ///
    /// Returns `true` if teardown can proceed immediately.
    pub fn begin_stop(&mut self) -> bool {
        self.stopping = true;
        !self.processing
    }

    /// Drains all queues/maps/counters back to a fresh-bus state. Callers
    /// are expected to have already canceled every entity these handles
    /// pointed to.
    pub fn reset(&mut self) {
        self.pending_dispatch.clear();
        self.incomplete_reliable_dispatcher = None;
        self.receivers_by_seq.clear();
        self.expiry_heap.clear();
        self.incomplete_reliable_receiver = None;
        self.last_recv_reliable_sequence = Seq::ZERO;
        self.last_recv_sequenced_sequence = Seq::ZERO;
        self.sequence_generator = Seq::ZERO;
        self.stopping = false;
    }

    /// Every dispatcher handle currently queued or in flight, for
    /// cancellation during stop.
    #[must_use]
    pub fn all_dispatchers(&self) -> Vec<Handle<crate::dispatcher::Dispatcher>> {
        let mut all: Vec<_> = self.pending_dispatch.iter().copied().collect();
        all.extend(self.incomplete_reliable_dispatcher);
        all
    }

    /// Every receiver handle currently tracked, for cancellation during
    /// stop.
    #[must_use]
    pub fn all_receivers(&self) -> Vec<Handle<Receiver>> {
        self.receivers_by_seq.values().copied().collect()
    }
}
