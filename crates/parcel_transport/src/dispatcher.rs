//! See [`Dispatcher`].

use crate::{
    fragment::Fragment,
    packet::{header::FragmentType, Seq},
    parcel::Parcel,
    pipeline::Pipeline,
    pool::Handle,
    receiver::BusRef,
    timer_flag::TimerFlag,
};

/// Pipeline stage indices for a [`Dispatcher`]: `dispatch -> complete`.
pub mod stage {
    /// Sending (or resending) non-ACKed fragments.
    pub const DISPATCH: u8 = 0;
    /// Notifying the owning sender and bus, then releasing to the pool.
    pub const COMPLETE: u8 = 1;
}

/// Last pipeline stage for a dispatcher.
pub const LAST_STAGE: u8 = stage::COMPLETE;

/// Where the content checksum for this dispatcher's parcel lives on the
/// wire, decided once at dispatcher creation from how much slack the final
/// fragment has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Fewer than 2 chunks: no checksum is sent (matches the receiver's own
    /// skip-if-single-fragment rule).
    None,
    /// Appended to the final fragment's content view.
    Embedded,
    /// Sent as its own trailing fragment, carrying only checksum bytes.
    Extra,
}

/// Per-outgoing-parcel-per-bus dispatch state.
///
/// Created by a [`crate::sender::Sender`], enqueued on its bus's pending
/// FIFO, and - once selected for sending - promoted to the bus's
/// `incomplete_reliable_dispatcher` slot if its mode is
/// [`FragmentType::Reliable`]. Released back to the pool once complete,
/// canceled, or failed.
#[derive(Debug)]
pub struct Dispatcher {
    bus: BusRef,
    fragment_type: FragmentType,
    sequence: Seq,
    parcel: Parcel,
    fragments: Vec<Fragment>,
    acked_counter: usize,
    checksum_mode: ChecksumMode,
    checksum: Option<Vec<u8>>,
    pipeline: Pipeline,
    canceled: bool,
    failed: bool,
    owner: Handle<crate::sender::Sender>,
    /// Set by the armed resend timer's callback; checked and cleared by
    /// [`crate::context::Context::poll`]. Only ever armed for reliable
    /// dispatchers.
    resend_due: TimerFlag,
}

/// Bytes a checksum occupies on the wire; a `0` value (as produced by a
/// checksum implementation with `LEN == 0`) degenerates every dispatcher to
/// [`ChecksumMode::None`].
pub const fn checksum_mode_for(chunk_count: usize, last_chunk_slack: usize, checksum_len: usize) -> ChecksumMode {
    if checksum_len == 0 || chunk_count < 2 {
        ChecksumMode::None
    } else if last_chunk_slack >= checksum_len {
        ChecksumMode::Embedded
    } else {
        ChecksumMode::Extra
    }
}

impl Dispatcher {
    /// Creates a dispatcher for `parcel` on `bus`, with `sequence` freshly
    /// drawn from the bus's sequence generator.
    ///
    /// `fragment_content_capacity` and `checksum_len` decide
    /// [`ChecksumMode`] per the placement rule: embed the checksum in the
    /// final fragment's slack if it fits, otherwise send it as an extra
    /// trailing fragment.
    #[must_use]
    pub fn new(
        bus: BusRef,
        fragment_type: FragmentType,
        sequence: Seq,
        parcel: Parcel,
        fragment_content_capacity: usize,
        checksum_len: usize,
        checksum: Option<Vec<u8>>,
        owner: Handle<crate::sender::Sender>,
    ) -> Self {
        let chunk_count = parcel.chunks().len();
        let last_chunk_len = parcel.chunks().last().map_or(0, crate::parcel::Chunk::len);
        let slack = fragment_content_capacity.saturating_sub(last_chunk_len);
        let checksum_mode = checksum_mode_for(chunk_count, slack, checksum_len);

        let mut fragments: Vec<Fragment> = parcel
            .chunks()
            .iter()
            .cloned()
            .map(Fragment::with_content)
            .collect();
        if fragments.is_empty() {
            fragments.push(Fragment::with_content(crate::parcel::Chunk::whole(
                std::sync::Arc::from(&[][..]),
            )));
        }
        if matches!(checksum_mode, ChecksumMode::Extra) {
            if let Some(checksum) = &checksum {
                fragments.push(Fragment::with_content(crate::parcel::Chunk::whole(
                    std::sync::Arc::from(checksum.as_slice()),
                )));
            }
        }

        Self {
            bus,
            fragment_type,
            sequence,
            parcel,
            fragments,
            acked_counter: 0,
            checksum_mode,
            checksum,
            pipeline: Pipeline::new(),
            canceled: false,
            failed: false,
            owner,
            resend_due: TimerFlag::new(),
        }
    }

    /// The flag a resend timer's callback marks. Cloned into the timer
    /// callback at the point the timer is armed.
    #[must_use]
    pub fn resend_flag(&self) -> TimerFlag {
        self.resend_due.clone()
    }

    /// Reads and clears the resend-due flag.
    pub fn take_resend_due(&self) -> bool {
        self.resend_due.take()
    }

    #[must_use]
    pub const fn bus(&self) -> BusRef {
        self.bus
    }

    #[must_use]
    pub const fn fragment_type(&self) -> FragmentType {
        self.fragment_type
    }

    #[must_use]
    pub const fn sequence(&self) -> Seq {
        self.sequence
    }

    #[must_use]
    pub const fn owner(&self) -> Handle<crate::sender::Sender> {
        self.owner
    }

    #[must_use]
    pub const fn is_reliable(&self) -> bool {
        self.fragment_type.is_reliable()
    }

    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        self.canceled
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) const fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub(crate) const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Index of the last fragment (`fragment_count - 1`).
    #[must_use]
    pub fn last_index(&self) -> u32 {
        (self.fragments.len() - 1) as u32
    }

    /// Iterates fragments not yet acknowledged, yielding `(fragment_index,
    /// content bytes, is_last_fragment_with_embedded_checksum)`.
    pub fn unacked_fragments(&self) -> impl Iterator<Item = (u32, &[u8], bool)> {
        let last_index = self.last_index();
        let embedded = matches!(self.checksum_mode, ChecksumMode::Embedded);
        self.fragments.iter().enumerate().filter_map(move |(i, f)| {
            if f.is_acked() {
                return None;
            }
            let content = f.content()?.as_slice();
            let i = i as u32;
            Some((i, content, embedded && i == last_index))
        })
    }

    /// The checksum bytes to embed on the final fragment, when
    /// [`ChecksumMode::Embedded`].
    #[must_use]
    pub fn embedded_checksum(&self) -> Option<&[u8]> {
        matches!(self.checksum_mode, ChecksumMode::Embedded)
            .then(|| self.checksum.as_deref())
            .flatten()
    }

    /// Marks the fragment at `fragment_index` acknowledged. Returns `true`
    /// if this was the final unacknowledged fragment (the caller should
    /// advance to `complete`). A repeat ACK is ignored.
    pub fn ack(&mut self, fragment_index: u32) -> bool {
        let Some(fragment) = self.fragments.get_mut(fragment_index as usize) else {
            return false;
        };
        if !fragment.ack() {
            return false;
        }
        self.acked_counter += 1;
        self.acked_counter == self.fragments.len()
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Marks canceled. Idempotent.
    pub fn cancel(&mut self) -> bool {
        if self.canceled {
            return false;
        }
        self.canceled = true;
        true
    }
}
