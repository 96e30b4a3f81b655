//! See [`Parcel`], [`ParcelWriter`], [`ParcelReader`].
//!
//! A parcel is ref-counted the way the teacher's aeronet buffers are: here
//! via `Arc` directly rather than a hand-rolled refcount, since `Arc`
//! already gives exactly the "finalizes when the last reference drops"
//! behaviour called for, with none of a manual pool's bookkeeping. Chunk
//! buffers are independently `Arc`-backed so cloning a chunk (e.g. handing
//! one dispatcher's fragment to a second dispatcher sending on a different
//! bus) is a refcount bump, not a copy.

use std::sync::Arc;

use crate::error::ResourceError;

/// One contiguous slice of a [`Parcel`]'s content, backed by its own
/// independently ref-counted buffer.
#[derive(Debug, Clone)]
pub struct Chunk {
    buffer: Arc<[u8]>,
    offset: u32,
    len: u32,
}

impl Chunk {
    /// Wraps an entire buffer as a single chunk.
    #[must_use]
    pub fn whole(buffer: Arc<[u8]>) -> Self {
        let len = buffer.len() as u32;
        Self {
            buffer,
            offset: 0,
            len,
        }
    }

    /// Creates a chunk viewing `buffer[offset..offset + len]`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds for `buffer`.
    #[must_use]
    pub fn new(buffer: Arc<[u8]>, offset: u32, len: u32) -> Self {
        assert!((offset as usize + len as usize) <= buffer.len());
        Self {
            buffer,
            offset,
            len,
        }
    }

    /// Borrows this chunk's bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.offset as usize..(self.offset as usize + self.len as usize)]
    }

    /// Number of bytes this chunk carries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// `true` if this chunk carries no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a new chunk with its tail `n` bytes trimmed off, used to
    /// strip a trailing embedded checksum off the final fragment before it
    /// becomes part of the delivered parcel.
    #[must_use]
    pub fn trim_end(&self, n: u32) -> Self {
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset,
            len: self.len.saturating_sub(n),
        }
    }
}

struct ParcelInner {
    chunks: Vec<Chunk>,
}

/// An immutable, ref-counted, ordered sequence of [`Chunk`]s.
///
/// Cloning a `Parcel` is a refcount bump: the same content can be handed to
/// a writer, a [`crate::sender::Sender`], several
/// [`crate::dispatcher::Dispatcher`]s, and the application simultaneously.
#[derive(Debug, Clone)]
pub struct Parcel(Arc<ParcelInner>);

impl Parcel {
    /// Wraps an already-built list of chunks as a parcel.
    #[must_use]
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self(Arc::new(ParcelInner { chunks }))
    }

    /// Builds a parcel by adopting a receiver's fragment buffer views in
    /// order, skipping a trailing empty fragment (left behind when an
    /// embedded checksum exactly filled the final fragment).
    #[must_use]
    pub fn from_fragment_chunks(mut chunks: Vec<Chunk>) -> Self {
        if matches!(chunks.last(), Some(last) if last.is_empty()) {
            chunks.pop();
        }
        Self::from_chunks(chunks)
    }

    /// This parcel's chunks, in order.
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.0.chunks
    }

    /// Total content length across all chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.chunks.iter().map(Chunk::len).sum()
    }

    /// `true` if this parcel carries no content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.chunks.iter().all(Chunk::is_empty)
    }

    /// Borrows each chunk's bytes, for feeding into a checksum or gather
    /// send.
    #[must_use]
    pub fn chunk_slices(&self) -> Vec<&[u8]> {
        self.0.chunks.iter().map(Chunk::as_slice).collect()
    }

    /// Opens a [`ParcelReader`] over this parcel's content.
    #[must_use]
    pub fn reader(&self) -> ParcelReader<'_> {
        ParcelReader::new(self)
    }
}

/// Incrementally builds a [`Parcel`] from application bytes, splitting
/// content into fixed-capacity chunks as it goes.
///
/// Mirrors the per-parcel capacity rule in the component design: each chunk
/// holds at most `fragment_content_capacity` bytes (MTU minus the largest
/// possible fragment header), and the parcel may not grow past
/// `max_fragments` chunks.
pub struct ParcelWriter {
    chunks: Vec<Chunk>,
    current: Vec<u8>,
    fragment_content_capacity: usize,
    max_fragments: u32,
    written_bytes: usize,
}

impl ParcelWriter {
    /// Creates a writer that will split content into chunks of at most
    /// `fragment_content_capacity` bytes, rejecting writes past
    /// `max_fragments` total chunks.
    #[must_use]
    pub fn new(fragment_content_capacity: usize, max_fragments: u32) -> Self {
        Self {
            chunks: Vec::new(),
            current: Vec::with_capacity(fragment_content_capacity),
            fragment_content_capacity,
            max_fragments,
            written_bytes: 0,
        }
    }

    /// Appends `buf` to the parcel being built, creating new chunks as the
    /// current one fills up.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::TooManyFragments`] if writing `buf` would
    /// require more than `max_fragments` chunks. On error, any bytes from
    /// `buf` already appended to the in-progress chunk before the limit was
    /// hit remain written - callers should treat the writer as failed and
    /// discard it.
    pub fn write(&mut self, mut buf: &[u8]) -> Result<(), ResourceError> {
        while !buf.is_empty() {
            let remaining_in_chunk = self.fragment_content_capacity - self.current.len();
            if remaining_in_chunk == 0 {
                self.flush_current()?;
                continue;
            }
            let take = remaining_in_chunk.min(buf.len());
            self.current.extend_from_slice(&buf[..take]);
            self.written_bytes += take;
            buf = &buf[take..];
        }
        Ok(())
    }

    fn flush_current(&mut self) -> Result<(), ResourceError> {
        if self.chunks.len() as u32 >= self.max_fragments {
            return Err(ResourceError::TooManyFragments {
                max_fragments: self.max_fragments,
            });
        }
        let bytes: Arc<[u8]> = std::mem::replace(
            &mut self.current,
            Vec::with_capacity(self.fragment_content_capacity),
        )
        .into();
        self.chunks.push(Chunk::whole(bytes));
        Ok(())
    }

    /// Total bytes written so far.
    #[must_use]
    pub const fn written_bytes(&self) -> usize {
        self.written_bytes
    }

    /// Flushes any buffered bytes into a final chunk and builds the
    /// [`Parcel`].
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::TooManyFragments`] if flushing the final
    /// partial chunk would exceed `max_fragments`.
    pub fn finish(mut self) -> Result<Parcel, ResourceError> {
        if !self.current.is_empty() || self.chunks.is_empty() {
            self.flush_current()?;
        }
        Ok(Parcel::from_chunks(self.chunks))
    }
}

/// Streams bytes out of a [`Parcel`]'s chunks in order.
pub struct ParcelReader<'p> {
    parcel: &'p Parcel,
    chunk_index: usize,
    pos_in_chunk: usize,
    remain_bytes: usize,
}

impl<'p> ParcelReader<'p> {
    fn new(parcel: &'p Parcel) -> Self {
        let remain_bytes = parcel.len();
        Self {
            parcel,
            chunk_index: 0,
            pos_in_chunk: 0,
            remain_bytes,
        }
    }

    /// Bytes not yet consumed by [`ParcelReader::read`].
    #[must_use]
    pub const fn remain_bytes(&self) -> usize {
        self.remain_bytes
    }

    /// Copies as many bytes as available into `buf`, returning the number
    /// actually copied (less than `buf.len()` only once the parcel is
    /// exhausted).
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(chunk) = self.parcel.chunks().get(self.chunk_index) else {
                break;
            };
            let chunk_bytes = chunk.as_slice();
            if self.pos_in_chunk >= chunk_bytes.len() {
                self.chunk_index += 1;
                self.pos_in_chunk = 0;
                continue;
            }
            let available = chunk_bytes.len() - self.pos_in_chunk;
            let want = buf.len() - copied;
            let take = available.min(want);
            buf[copied..copied + take]
                .copy_from_slice(&chunk_bytes[self.pos_in_chunk..self.pos_in_chunk + take]);
            copied += take;
            self.pos_in_chunk += take;
            self.remain_bytes -= take;
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_splits_content_across_chunk_capacity() {
        let mut writer = ParcelWriter::new(4, 256);
        writer.write(b"hello world").unwrap();
        let parcel = writer.finish().unwrap();
        assert_eq!(parcel.chunks().len(), 3);
        assert_eq!(parcel.len(), 11);
    }

    #[test]
    fn writer_rejects_past_max_fragments() {
        let mut writer = ParcelWriter::new(1, 2);
        let err = writer.write(b"abc").unwrap_err();
        assert_eq!(err, ResourceError::TooManyFragments { max_fragments: 2 });
    }

    #[test]
    fn reader_round_trips_across_fragmentation_boundary() {
        let mut writer = ParcelWriter::new(3, 256);
        let payload = b"the quick brown fox jumps";
        writer.write(payload).unwrap();
        let parcel = writer.finish().unwrap();

        let mut reader = parcel.reader();
        assert_eq!(reader.remain_bytes(), payload.len());
        let mut out = vec![0u8; payload.len()];
        let n = reader.read(&mut out);
        assert_eq!(n, payload.len());
        assert_eq!(&out, payload);
        assert_eq!(reader.remain_bytes(), 0);
    }

    #[test]
    fn from_fragment_chunks_drops_trailing_empty_fragment() {
        let a = Chunk::whole(Arc::from(&b"data"[..]));
        let b = Chunk::whole(Arc::from(&b""[..]));
        let parcel = Parcel::from_fragment_chunks(vec![a, b]);
        assert_eq!(parcel.chunks().len(), 1);
    }
}
