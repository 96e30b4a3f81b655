//! See [`Receiver`].

use web_time::Instant;

use crate::{
    fragment::Fragment,
    packet::{header::FragmentType, Seq},
    parcel::Parcel,
    pending_result::PendingResult,
    pipeline::Pipeline,
    pool::Handle,
};

/// Pipeline stage indices for a [`Receiver`]: `wait_fragments -> verify_checksum -> complete`.
pub mod stage {
    /// Waiting for every fragment of the parcel to arrive.
    pub const WAIT_FRAGMENTS: u8 = 0;
    /// All fragments in; verifying the checksum off-thread (if any).
    pub const VERIFY_CHECKSUM: u8 = 1;
    /// Delivering upward (or dropping) and releasing back to the pool.
    pub const COMPLETE: u8 = 2;
}

/// Last pipeline stage for a receiver.
pub const LAST_STAGE: u8 = stage::COMPLETE;

/// Non-owning reference to the bus a [`Receiver`] or
/// [`crate::dispatcher::Dispatcher`] belongs to. Buses live directly inside
/// their owning [`crate::endpoint::Endpoint`] rather than in their own pool
/// (an endpoint's bus count is fixed at construction), so this pairs an
/// endpoint handle with a plain bus index instead of a second `Handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusRef {
    /// Owning endpoint.
    pub endpoint: Handle<crate::endpoint::Endpoint>,
    /// 0 = system bus, 1..=nbuses = user buses.
    pub bus_id: u32,
}

/// Per-incoming-parcel reassembly state.
///
/// Created on the first fragment of a new parcel sequence on a bus, lives in
/// that bus's `sequence -> receiver` map (and, for non-reliable modes, its
/// expiry min-heap) until it completes, is canceled, or expires.
#[derive(Debug)]
pub struct Receiver {
    bus: BusRef,
    fragment_type: FragmentType,
    sequence: Seq,
    fragments: Vec<Fragment>,
    recv_fragments: usize,
    /// Only set for non-reliable receivers; reliable receivers never expire.
    expires_at: Option<Instant>,
    pipeline: Pipeline,
    canceled: bool,
    failed: bool,
    checksum_len: usize,
    embedded_checksum: Option<Vec<u8>>,
    computed_checksum: Option<Vec<u8>>,
    verify_pending: PendingResult,
}

impl Receiver {
    /// Creates a receiver for a parcel with `total_fragments` expected
    /// fragments, in the `WAIT_FRAGMENTS` stage.
    #[must_use]
    pub fn new(bus: BusRef, fragment_type: FragmentType, sequence: Seq, total_fragments: u32) -> Self {
        Self {
            bus,
            fragment_type,
            sequence,
            fragments: vec![Fragment::empty(); total_fragments.max(1) as usize],
            recv_fragments: 0,
            expires_at: None,
            pipeline: Pipeline::new(),
            canceled: false,
            failed: false,
            checksum_len: 0,
            embedded_checksum: None,
            computed_checksum: None,
            verify_pending: PendingResult::new(),
        }
    }

    /// The slot a checksum-verify worker task's completion callback writes
    /// into.
    #[must_use]
    pub fn verify_pending(&self) -> PendingResult {
        self.verify_pending.clone()
    }

    /// The bus this receiver belongs to.
    #[must_use]
    pub const fn bus(&self) -> BusRef {
        self.bus
    }

    /// The delivery mode this receiver is reassembling.
    #[must_use]
    pub const fn fragment_type(&self) -> FragmentType {
        self.fragment_type
    }

    /// The parcel sequence this receiver is keyed by.
    #[must_use]
    pub const fn sequence(&self) -> Seq {
        self.sequence
    }

    /// Total fragments expected.
    #[must_use]
    pub fn total_fragments(&self) -> u32 {
        self.fragments.len() as u32
    }

    /// Whether an existing receiver's metadata (mode, total fragment count)
    /// matches a newly-arrived fragment's header, per the bus's mismatch
    /// check.
    #[must_use]
    pub fn matches(&self, fragment_type: FragmentType, sequence: Seq, last_index: u32) -> bool {
        self.fragment_type == fragment_type
            && self.sequence == sequence
            && self.total_fragments() == last_index + 1
    }

    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        self.canceled
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    #[must_use]
    pub const fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub(crate) const fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub(crate) const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Begins `wait_fragments`: arms the expiry deadline for non-reliable
    /// modes. Reliable receivers never expire (the sender retransmits until
    /// ACKed).
    pub fn begin_wait(&mut self, now: Instant, expiry_timeout: core::time::Duration) {
        if !self.fragment_type.is_reliable() {
            self.expires_at = Some(now + expiry_timeout);
        }
    }

    /// Attaches content to the fragment at `fragment_index`. Returns `true`
    /// if this completed reassembly (every fragment slot now filled) and the
    /// caller should advance the pipeline to `verify_checksum`.
    ///
    /// Ignores (returns `false` without effect on `recv_fragments`) a
    /// duplicate fragment index that already has content.
    pub fn add_fragment(&mut self, fragment_index: u32, content: crate::parcel::Chunk) -> bool {
        let Some(slot) = self.fragments.get_mut(fragment_index as usize) else {
            return false;
        };
        if !slot.fill(content) {
            return false;
        }
        self.recv_fragments += 1;
        self.recv_fragments == self.fragments.len()
    }

    /// `true` if this fragment index has already been received.
    #[must_use]
    pub fn has_fragment(&self, fragment_index: u32) -> bool {
        self.fragments
            .get(fragment_index as usize)
            .is_some_and(|f| !f.is_missing())
    }

    /// Runs the checksum-trim step: if fewer than 2 fragments, there is no
    /// embedded checksum to strip (per the dispatcher's own placement rule,
    /// which only appends a checksum when there are 2+ chunks). Otherwise
    /// trims `checksum_len` trailing bytes off the last fragment and remembers
    /// the embedded bytes for comparison.
    ///
    /// Returns the embedded checksum bytes to compare against, or `None` if
    /// checksum verification should be skipped entirely.
    pub fn prepare_checksum_verify(&mut self, checksum_len: usize) -> Option<Vec<u8>> {
        if self.fragments.len() < 2 {
            return None;
        }
        self.checksum_len = checksum_len;
        let last = self.fragments.last()?;
        let content = last.content()?;
        let bytes = content.as_slice();
        if bytes.len() < checksum_len {
            return None;
        }
        let embedded = bytes[bytes.len() - checksum_len..].to_vec();
        if let Some(last) = self.fragments.last_mut() {
            last.trim_content_end(checksum_len as u32);
        }
        self.embedded_checksum = Some(embedded.clone());
        Some(embedded)
    }

    /// Clones every fragment's current content bytes, in order. Used to
    /// hand owned, `'static` data to an off-thread checksum verify task.
    #[must_use]
    pub fn cloned_fragment_contents(&self) -> Vec<Vec<u8>> {
        self.fragments
            .iter()
            .filter_map(|f| f.content())
            .map(|c| c.as_slice().to_vec())
            .collect()
    }

    /// Records the outcome of the off-thread checksum computation.
    pub fn set_computed_checksum(&mut self, computed: Vec<u8>) {
        self.computed_checksum = Some(computed);
    }

    /// Compares the computed checksum (if verification ran) against the
    /// embedded bytes captured by [`Receiver::prepare_checksum_verify`].
    #[must_use]
    pub fn checksum_matches(&self) -> bool {
        match &self.embedded_checksum {
            Some(embedded) => self.computed_checksum.as_deref() == Some(embedded.as_slice()),
            None => true,
        }
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Marks canceled. Idempotent: returns `false` if already canceled.
    pub fn cancel(&mut self) -> bool {
        if self.canceled {
            return false;
        }
        self.canceled = true;
        true
    }

    /// Builds the delivered [`Parcel`] from this receiver's fragment
    /// content, consuming the receiver.
    #[must_use]
    pub fn into_parcel(self) -> Parcel {
        let chunks = self
            .fragments
            .into_iter()
            .filter_map(|f| f.content().cloned())
            .collect();
        Parcel::from_fragment_chunks(chunks)
    }
}

/// Min-heap ordering key: receivers expire soonest-first. Reliable receivers
/// (no `expires_at`) are never pushed onto the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryEntry {
    pub expires_at: Instant,
    pub receiver: Handle<Receiver>,
}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // Reversed so a `BinaryHeap<ExpiryEntry>` pops the soonest deadline
        // first (`BinaryHeap` is a max-heap).
        other.expires_at.cmp(&self.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parcel::Chunk;
    use std::sync::Arc;

    fn bus_ref() -> BusRef {
        BusRef {
            endpoint: dummy_handle(),
            bus_id: 1,
        }
    }

    fn dummy_handle() -> Handle<crate::endpoint::Endpoint> {
        let mut pool = crate::pool::Pool::new();
        pool.acquire(crate::endpoint::Endpoint::new(0, crate::config::Config::new(64)))
    }

    #[test]
    fn add_fragment_reports_completion_once_all_slots_filled() {
        let mut recv = Receiver::new(bus_ref(), FragmentType::Reliable, Seq(1), 2);
        let chunk = Chunk::whole(Arc::from(&b"ab"[..]));
        assert!(!recv.add_fragment(0, chunk.clone()));
        assert!(recv.add_fragment(1, chunk));
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut recv = Receiver::new(bus_ref(), FragmentType::Reliable, Seq(1), 2);
        let chunk = Chunk::whole(Arc::from(&b"ab"[..]));
        assert!(!recv.add_fragment(0, chunk.clone()));
        assert!(!recv.add_fragment(0, chunk));
        assert_eq!(recv.recv_fragments, 1);
    }

    #[test]
    fn single_fragment_skips_checksum_verification() {
        let mut recv = Receiver::new(bus_ref(), FragmentType::Unreliable, Seq(1), 1);
        recv.add_fragment(0, Chunk::whole(Arc::from(&b"hi"[..])));
        assert!(recv.prepare_checksum_verify(16).is_none());
    }
}
