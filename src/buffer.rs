//! Fixed-capacity byte buffer with independent read/write cursors.
//!
//! Backed by `bytes::BytesMut`, pre-allocated to capacity `B` and never
//! resized. Two cursors, `0 <= read <= write <= capacity`, delimit the
//! readable region `[read, write)` and the writable region `[write,
//! capacity)`. When a full drain empties the buffer (`read == write`)
//! both cursors reset to zero — otherwise a long-lived COPY session
//! would walk off the end of the region after enough small reads.

use bytes::BytesMut;

pub struct ByteBuffer {
    data: BytesMut,
    read: usize,
    write: usize,
}

impl ByteBuffer {
    pub fn new(capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, 0);
        Self {
            data,
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn writable(&mut self) -> &mut [u8] {
        let w = self.write;
        &mut self.data[w..]
    }

    pub fn advance_write(&mut self, n: usize) {
        assert!(n <= self.capacity() - self.write, "write overrun");
        self.write += n;
    }

    pub fn readable(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    pub fn advance_read(&mut self, n: usize) {
        assert!(n <= self.write - self.read, "read overrun");
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    pub fn can_read(&self) -> bool {
        self.read < self.write
    }

    pub fn can_write(&self) -> bool {
        self.write < self.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }
}
