//! Growable cursor buffer for connection I/O.
//!
//! A `ByteBuffer` is a single contiguous store with three cursors:
//!
//! ```text
//! +-----------+------------------+------------------+
//! |  prepend  |  readable bytes  |  writable bytes  |
//! +-----------+------------------+------------------+
//! 0        prepend    <=    reader    <=    writer    <=    len
//! ```
//!
//! Writers either `append` bytes or fill `write_buf()` directly (e.g. from a
//! socket read) and then call `write_flip`. Readers look at `read_buf()` and
//! release consumed bytes with `read_flip`.
//!
//! ## Growth
//!
//! When a write does not fit the writable suffix, `write_reserve` first checks
//! whether the space already consumed by the reader would make room. If so the
//! live bytes are moved to the front in place; otherwise a new store sized to
//! exactly `prepend + readable + requested` is allocated and the live bytes are
//! copied to its front. Either way the reader ends at the prepend boundary.
//!
//! A buffer is owned by one component at a time. Sharing across tasks needs
//! external locking.

use bytes::Buf;

/// Default reserved space in front of the readable region.
pub const DEFAULT_PREPEND_SIZE: usize = 0;

/// Default size of the writable region of a fresh buffer.
pub const DEFAULT_INITIAL_SIZE: usize = 100;

/// Contiguous byte buffer with prepend, read and write cursors.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    /// Backing store. `len()` is the logical size of the buffer.
    buf: Vec<u8>,
    /// Bytes reserved before the first readable byte.
    prepend: usize,
    /// Index of the first unread byte.
    reader: usize,
    /// Index one past the last written byte.
    writer: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    /// Create an empty buffer with the default initial size.
    pub fn new() -> Self {
        Self::with_prepend(DEFAULT_PREPEND_SIZE, DEFAULT_INITIAL_SIZE)
    }

    /// Create an empty buffer with `initial` writable bytes.
    pub fn with_capacity(initial: usize) -> Self {
        Self::with_prepend(DEFAULT_PREPEND_SIZE, initial)
    }

    /// Create an empty buffer that keeps `prepend` bytes free in front of
    /// the readable region, e.g. to write a header after the body.
    pub fn with_prepend(prepend: usize, initial: usize) -> Self {
        Self {
            buf: vec![0u8; prepend + initial],
            prepend,
            reader: prepend,
            writer: prepend,
        }
    }

    /// Append `data` at the write cursor, growing the buffer if needed.
    pub fn append(&mut self, data: &[u8]) {
        let size = data.len();
        if size == 0 {
            return;
        }
        self.write_grow(size);
        self.buf[self.writer..self.writer + size].copy_from_slice(data);
        self.write_flip(size);
    }

    /// Writable suffix of the store, for zero-copy fills.
    ///
    /// Empty when the buffer is full; call `write_grow` first.
    pub fn write_buf(&mut self) -> &mut [u8] {
        &mut self.buf[self.writer..]
    }

    /// Number of bytes that can be written without growing.
    pub fn write_size(&self) -> usize {
        self.buf.len() - self.writer
    }

    /// Advance the write cursor after an external fill of `write_buf()`.
    pub fn write_flip(&mut self, size: usize) {
        debug_assert!(size <= self.write_size(), "write_flip past end of buffer");
        self.writer = (self.writer + size).min(self.buf.len());
    }

    /// Make sure at least `size` bytes are writable.
    pub fn write_grow(&mut self, size: usize) {
        if size > self.write_size() {
            self.write_reserve(size);
        }
    }

    /// Unread bytes, `[reader, writer)`.
    pub fn read_buf(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// First `size` unread bytes, or `None` if fewer are buffered.
    pub fn read_buf_n(&self, size: usize) -> Option<&[u8]> {
        if self.reader + size > self.writer {
            return None;
        }
        Some(&self.buf[self.reader..self.reader + size])
    }

    /// Whether any unread bytes are buffered.
    pub fn read_ready(&self) -> bool {
        self.writer > self.reader
    }

    /// Number of unread bytes.
    pub fn read_size(&self) -> usize {
        self.writer - self.reader
    }

    /// Consume `size` bytes. Consuming everything resets the cursors.
    pub fn read_flip(&mut self, size: usize) {
        if size < self.read_size() {
            self.reader += size;
        } else {
            self.reset();
        }
    }

    /// Logically empty the buffer, keeping its allocation.
    pub fn reset(&mut self) {
        self.reader = self.prepend;
        self.writer = self.prepend;
    }

    /// Logical size of the store (prepend + readable + writable).
    pub fn max_size(&self) -> usize {
        self.buf.len()
    }

    /// Allocated capacity of the backing store.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Write `data` directly in front of the unread bytes.
    ///
    /// Returns `false` if there is not enough room before the read cursor.
    pub fn prepend(&mut self, data: &[u8]) -> bool {
        let size = data.len();
        if self.reader < size {
            return false;
        }
        self.reader -= size;
        self.buf[self.reader..self.reader + size].copy_from_slice(data);
        true
    }

    fn write_reserve(&mut self, size: usize) {
        let readable = self.read_size();

        if self.write_size() + self.reader < size + self.prepend {
            let mut store = vec![0u8; self.prepend + readable + size];
            store[..self.prepend].copy_from_slice(&self.buf[..self.prepend]);
            store[self.prepend..self.prepend + readable]
                .copy_from_slice(&self.buf[self.reader..self.writer]);
            self.buf = store;
        } else {
            self.buf.copy_within(self.reader..self.writer, self.prepend);
        }

        self.reader = self.prepend;
        self.writer = self.prepend + readable;
    }
}

impl Buf for ByteBuffer {
    fn remaining(&self) -> usize {
        self.read_size()
    }

    fn chunk(&self) -> &[u8] {
        self.read_buf()
    }

    fn advance(&mut self, cnt: usize) {
        self.read_flip(cnt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_cursors(buf: &ByteBuffer) {
        assert!(buf.prepend <= buf.reader, "prepend > reader");
        assert!(buf.reader <= buf.writer, "reader > writer");
        assert!(buf.writer <= buf.buf.len(), "writer past end");
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = ByteBuffer::new();
        assert_eq!(buf.read_size(), 0);
        assert!(!buf.read_ready());
        assert!(buf.read_buf().is_empty());
        assert_eq!(buf.write_size(), DEFAULT_INITIAL_SIZE);
    }

    #[test]
    fn test_append_and_read() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello ");
        buf.append(b"world");

        assert_eq!(buf.read_size(), 11);
        assert_eq!(buf.read_buf(), b"hello world");
        assert_eq!(buf.read_buf_n(5), Some(&b"hello"[..]));
        assert!(buf.read_buf_n(12).is_none());

        buf.read_flip(6);
        assert_eq!(buf.read_buf(), b"world");
        assert_cursors(&buf);
    }

    #[test]
    fn test_growth_keeps_unread_bytes() {
        let mut buf = ByteBuffer::with_capacity(8);
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        for chunk in data.chunks(37) {
            buf.append(chunk);
            assert_cursors(&buf);
        }

        assert_eq!(buf.read_size(), data.len());
        assert_eq!(buf.read_buf(), &data[..]);
    }

    #[test]
    fn test_growth_after_partial_read() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.read_flip(4);

        // 6 live bytes + 20 requested forces a reallocation.
        buf.append(&[b'x'; 20]);
        assert_eq!(buf.read_buf(), b"456789xxxxxxxxxxxxxxxxxxxx");
        assert_eq!(buf.reader, 0);
        assert_eq!(buf.max_size(), 26);
        assert_cursors(&buf);
    }

    #[test]
    fn test_compaction_in_place() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(b"abcdefghijkl");
        buf.read_flip(10);

        // Only 4 bytes writable, but 10 were consumed: compact, no realloc.
        buf.append(b"123456");
        assert_eq!(buf.max_size(), 16);
        assert_eq!(buf.read_buf(), b"kl123456");
        assert_eq!(buf.reader, 0);
        assert_cursors(&buf);
    }

    #[test]
    fn test_read_flip_all_resets() {
        let mut buf = ByteBuffer::new();
        buf.append(b"frame");
        buf.read_flip(5);
        assert_eq!(buf.reader, 0);
        assert_eq!(buf.writer, 0);

        buf.append(b"abc");
        buf.read_flip(100);
        assert!(!buf.read_ready());
    }

    #[test]
    fn test_reset_keeps_allocation() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.append(&[1u8; 64]);
        let size = buf.max_size();
        buf.reset();
        assert_eq!(buf.read_size(), 0);
        assert_eq!(buf.max_size(), size);
    }

    #[test]
    fn test_external_fill() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.write_grow(10);
        assert!(buf.write_size() >= 10);

        buf.write_buf()[..3].copy_from_slice(b"abc");
        buf.write_flip(3);
        assert_eq!(buf.read_buf(), b"abc");
    }

    #[test]
    fn test_interleaved_ops_keep_invariant() {
        let mut buf = ByteBuffer::with_capacity(7);
        let mut expected: Vec<u8> = Vec::new();
        let mut seed: u32 = 0x2545_f491;

        for round in 0..500u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let n = (seed >> 16) as usize % 50;
            if round % 3 == 2 {
                let take = n.min(expected.len());
                buf.read_flip(take);
                expected.drain(..take);
            } else {
                let chunk: Vec<u8> = (0..n).map(|i| (round as usize + i) as u8).collect();
                buf.append(&chunk);
                expected.extend_from_slice(&chunk);
            }
            assert_cursors(&buf);
            assert_eq!(buf.read_buf(), &expected[..]);
        }
    }

    #[test]
    fn test_prepend_header() {
        let mut buf = ByteBuffer::with_prepend(4, 32);
        buf.append(b"body");
        assert!(buf.prepend(&[0, 0, 8, 0]));
        assert_eq!(buf.read_buf(), &[0, 0, 8, 0, b'b', b'o', b'd', b'y']);

        // No room left in front of the reader.
        assert!(!buf.prepend(b"x"));
    }

    #[test]
    fn test_prepend_survives_growth() {
        let mut buf = ByteBuffer::with_prepend(2, 2);
        buf.append(b"abcdef");
        assert_eq!(buf.reader, 2);
        assert!(buf.prepend(b"HI"));
        assert_eq!(buf.read_buf(), b"HIabcdef");
    }

    #[test]
    fn test_buf_trait() {
        let mut buf = ByteBuffer::new();
        buf.append(&[0x00, 0x00, 0x08, 0x01]);
        buf.append(b"ping");

        assert_eq!(buf.remaining(), 8);
        assert_eq!(buf.get_uint(3), 8);
        assert_eq!(buf.get_u8(), 1);
        assert_eq!(&buf.copy_to_bytes(4)[..], b"ping");
        assert!(!buf.has_remaining());
    }
}
