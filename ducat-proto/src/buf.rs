//! Byte buffer with head/tail cursors and reserved header room.

use std::fmt;

/// An owned contiguous byte region with `head` and `tail` cursors,
/// `0 <= head <= tail <= capacity`.
///
/// Reserving head room at allocation time lets the codec prepend a packet
/// header to a filled payload without copying it. The region between
/// `tail` and `capacity` is writable space for incremental socket reads.
pub struct Buf {
    data: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Buf {
    /// Creates an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            head: 0,
            tail: 0,
        }
    }

    /// Creates a buffer holding a copy of `bytes`, with no spare room.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut bp = Self::new(bytes.len());
        bp.append(bytes);
        bp
    }

    /// Total capacity of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Moves `head` (and `tail`) forward by `n` so a header can later be
    /// written in front of the payload with [`push_head`](Self::push_head).
    ///
    /// Only valid on an empty buffer.
    pub fn reserve_head(&mut self, n: usize) {
        assert!(self.head == self.tail, "reserve_head on non-empty buffer");
        assert!(self.tail + n <= self.data.len());
        self.head += n;
        self.tail = self.head;
    }

    /// Number of unread bytes between `head` and `tail`.
    pub fn count(&self) -> usize {
        self.tail - self.head
    }

    /// True if no unread bytes remain.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The unread bytes.
    pub fn head_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Marks `n` bytes at the head as consumed.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.count());
        self.head += n;
    }

    /// Appends `bytes` at the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.tail_room(), "buffer overflow");
        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
    }

    /// Writes `bytes` immediately before `head`, rewinding it.
    ///
    /// Requires room previously set aside with
    /// [`reserve_head`](Self::reserve_head).
    pub fn push_head(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.head, "no head room reserved");
        let start = self.head - bytes.len();
        self.data[start..self.head].copy_from_slice(bytes);
        self.head = start;
    }

    /// Writable space remaining at the tail.
    pub fn tail_room(&self) -> usize {
        self.data.len() - self.tail
    }

    /// The writable region at the tail, for incremental reads.
    pub fn tail_slice_mut(&mut self) -> &mut [u8] {
        let tail = self.tail;
        &mut self.data[tail..]
    }

    /// Marks `n` bytes written at the tail as filled.
    pub fn advance_tail(&mut self, n: usize) {
        assert!(n <= self.tail_room());
        self.tail += n;
    }

    /// Moves the unread bytes to the front of the storage, reclaiming
    /// consumed head room as tail space.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// Resets both cursors, discarding any content.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("capacity", &self.data.len())
            .finish()
    }
}
