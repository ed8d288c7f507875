use crate::block_header::HEADER_SIZE;

/// A fixed-capacity block image plus the live metadata that goes into its
/// header when it is written.
///
/// The first `HEADER_SIZE` bytes of `data` are reserved for the control
/// block header; payload starts right after it. `fill` counts the header
/// bytes, so an empty block has `fill == HEADER_SIZE`.
///
/// A buffer is owned by exactly one place at a time (a pool, a writer's
/// current slot, a work queue or a reader's window) and moves between them.
#[derive(Debug)]
pub struct MessageBuffer {
    data: Box<[u8]>,
    /// Bytes in use, header included.
    pub fill: usize,
    /// Offset of the first item starting in this block, 0 if none.
    pub object_offset: usize,
    /// Offset where the current recording stretch starts in this block, 0 if
    /// the stretch does not start here.
    pub stretch_offset: usize,
    pub stream_id: u16,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        MessageBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            fill: 0,
            object_offset: 0,
            stretch_offset: 0,
            stream_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Reset metadata for reuse; the byte area is left as is.
    pub fn reset(&mut self) {
        self.fill = 0;
        self.object_offset = 0;
        self.stretch_offset = 0;
        self.stream_id = 0;
    }

    /// Prepare as a fresh, empty block for `stream_id`.
    pub fn start_block(&mut self, stream_id: u16) {
        self.reset();
        self.fill = HEADER_SIZE;
        self.stream_id = stream_id;
    }

    pub fn is_full(&self) -> bool {
        self.fill >= self.data.len()
    }

    pub fn has_payload(&self) -> bool {
        self.fill > HEADER_SIZE
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.fill)
    }

    /// Append as much of `bytes` as fits; returns the number of bytes taken.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data[self.fill..self.fill + n].copy_from_slice(&bytes[..n]);
        self.fill += n;
        n
    }

    /// Zero everything past `fill`, so the checksum over the full capacity
    /// does not pick up stale bytes from an earlier use.
    pub fn zero_tail(&mut self) {
        let fill = self.fill.min(self.data.len());
        self.data[fill..].fill(0);
    }

    /// Copy content and metadata of `other` into this buffer.
    pub fn copy_from(&mut self, other: &MessageBuffer) {
        let n = other.fill.min(self.data.len());
        self.data[..n].copy_from_slice(&other.data[..n]);
        self.fill = n;
        self.object_offset = other.object_offset;
        self.stretch_offset = other.stretch_offset;
        self.stream_id = other.stream_id;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Filled byte range `[from, fill)`.
    pub fn filled(&self, from: usize) -> &[u8] {
        let end = self.fill.min(self.data.len());
        &self.data[from.min(end)..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_splits_at_capacity() {
        let mut buf = MessageBuffer::new(HEADER_SIZE + 4);
        buf.start_block(3);
        assert_eq!(buf.append(b"abcdef"), 4);
        assert!(buf.is_full());
        assert_eq!(buf.append(b"x"), 0);
        assert_eq!(buf.filled(HEADER_SIZE), b"abcd");
    }

    #[test]
    fn test_zero_tail_and_copy() {
        let mut buf = MessageBuffer::new(HEADER_SIZE + 8);
        buf.bytes_mut().fill(0xEE);
        buf.start_block(2);
        buf.append(b"hi");
        buf.object_offset = HEADER_SIZE;
        buf.zero_tail();
        assert!(buf.bytes()[HEADER_SIZE + 2..].iter().all(|&b| b == 0));

        let mut copy = MessageBuffer::new(HEADER_SIZE + 8);
        copy.copy_from(&buf);
        assert_eq!(copy.fill, HEADER_SIZE + 2);
        assert_eq!(copy.object_offset, HEADER_SIZE);
        assert_eq!(copy.stream_id, 2);
        assert_eq!(copy.filled(HEADER_SIZE), b"hi");
    }
}
