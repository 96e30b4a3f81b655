//! See [`Fragment`].

use std::sync::Arc;

use crate::parcel::Chunk;

/// One in-flight fragment, as tracked by a [`crate::dispatcher::Dispatcher`]
/// (content always present, `acked` mutated as ACKs arrive) or a
/// [`crate::receiver::Receiver`] (content absent until
/// [`crate::receiver::Receiver::add_fragment`] fills the slot).
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    content: Option<Chunk>,
    acked: bool,
}

impl Fragment {
    /// An empty, unacknowledged fragment slot (the receiver's initial
    /// state).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            content: None,
            acked: false,
        }
    }

    /// A fragment already carrying its content (the dispatcher's initial
    /// state, built from the parcel's own chunks).
    #[must_use]
    pub const fn with_content(content: Chunk) -> Self {
        Self {
            content: Some(content),
            acked: false,
        }
    }

    /// This fragment's content, if it has arrived (receiver) or been
    /// assigned (dispatcher).
    #[must_use]
    pub const fn content(&self) -> Option<&Chunk> {
        self.content.as_ref()
    }

    /// `true` if content has not yet been attached.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        self.content.is_none()
    }

    /// Attaches content to this fragment. Used by a receiver on first
    /// arrival; a no-op return value of `false` signals a duplicate that the
    /// caller should otherwise ignore.
    pub fn fill(&mut self, content: Chunk) -> bool {
        if self.content.is_some() {
            return false;
        }
        self.content = Some(content);
        true
    }

    /// `true` if an ACK has been received for this fragment.
    #[must_use]
    pub const fn is_acked(&self) -> bool {
        self.acked
    }

    /// Marks this fragment acknowledged. Returns `true` the first time (a
    /// repeated ACK is a no-op that the caller should ignore).
    pub fn ack(&mut self) -> bool {
        if self.acked {
            return false;
        }
        self.acked = true;
        true
    }

    /// Trims `n` trailing bytes off this fragment's content, used to strip
    /// an embedded checksum before the content is handed up as part of a
    /// delivered parcel.
    pub fn trim_content_end(&mut self, n: u32) {
        if let Some(content) = &self.content {
            self.content = Some(content.trim_end(n));
        }
    }
}

/// Standalone buffer holding a just-received fragment's raw bytes, before
/// the header is stripped off and the remainder becomes a [`Chunk`].
#[must_use]
pub fn content_chunk(bytes: Arc<[u8]>) -> Chunk {
    Chunk::whole(bytes)
}
