use std::collections::VecDeque;

use crate::message_buffer::MessageBuffer;

/// Default number of spare buffers a pool keeps around.
pub const DEFAULT_SPARE_BUFFERS: usize = 8;

/// Recycling allocator for the message buffers of one stream.
///
/// The buffer size is fixed at first use. Released buffers go onto a spare
/// list and are handed out again before any fresh allocation, so a stream in
/// steady state does not allocate per block.
#[derive(Debug)]
pub struct BufferPool {
    bufsize: Option<usize>,
    spare: Vec<MessageBuffer>,
    max_spare: usize,
    allocated: usize,
    recycled: usize,
}

impl BufferPool {
    pub fn new(max_spare: usize) -> Self {
        BufferPool {
            bufsize: None,
            spare: Vec::new(),
            max_spare,
            allocated: 0,
            recycled: 0,
        }
    }

    pub fn bufsize(&self) -> Option<usize> {
        self.bufsize
    }

    /// Fix the buffer size. Returns false if a different size was already set.
    pub fn set_bufsize(&mut self, size: usize) -> bool {
        match self.bufsize {
            Some(existing) => existing == size,
            None => {
                self.bufsize = Some(size);
                true
            }
        }
    }

    /// Detach a spare buffer, allocating a fresh one if none is free.
    /// Returns `None` while the buffer size is still unknown.
    pub fn get_spare(&mut self) -> Option<MessageBuffer> {
        let size = self.bufsize?;
        match self.spare.pop() {
            Some(mut buf) => {
                buf.reset();
                self.recycled += 1;
                Some(buf)
            }
            None => {
                self.allocated += 1;
                Some(MessageBuffer::new(size))
            }
        }
    }

    /// Return a buffer once its owner is done with it.
    pub fn release(&mut self, buf: MessageBuffer) {
        if Some(buf.capacity()) == self.bufsize && self.spare.len() < self.max_spare {
            self.spare.push(buf);
        }
    }

    pub fn spare_count(&self) -> usize {
        self.spare.len()
    }

    /// Number of fresh allocations made so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Number of times a spare buffer was reused.
    pub fn recycled(&self) -> usize {
        self.recycled
    }
}

/// Buffers in use, in rotation order. The oldest buffer is released first.
#[derive(Debug, Default)]
pub struct BufferList<T> {
    items: VecDeque<T>,
}

impl<T> BufferList<T> {
    pub fn new() -> Self {
        BufferList {
            items: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_fixed_at_first_use() {
        let mut pool = BufferPool::new(4);
        assert!(pool.get_spare().is_none());
        assert!(pool.set_bufsize(128));
        assert!(pool.set_bufsize(128));
        assert!(!pool.set_bufsize(256));
        assert_eq!(pool.get_spare().unwrap().capacity(), 128);
    }

    #[test]
    fn test_recycles_released_buffers() {
        let mut pool = BufferPool::new(4);
        pool.set_bufsize(64);
        let mut a = pool.get_spare().unwrap();
        a.start_block(9);
        a.append(b"data");
        pool.release(a);
        assert_eq!(pool.spare_count(), 1);

        let b = pool.get_spare().unwrap();
        assert_eq!(b.fill, 0);
        assert_eq!(b.stream_id, 0);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.recycled(), 1);

        // foreign sizes are dropped rather than recycled
        pool.release(MessageBuffer::new(32));
        assert_eq!(pool.spare_count(), 0);
    }

    #[test]
    fn test_spare_list_bounded() {
        let mut pool = BufferPool::new(2);
        pool.set_bufsize(64);
        let bufs: Vec<_> = (0..4).map(|_| pool.get_spare().unwrap()).collect();
        for b in bufs {
            pool.release(b);
        }
        assert_eq!(pool.spare_count(), 2);
    }

    #[test]
    fn test_buffer_list_order() {
        let mut list = BufferList::new();
        list.push_back(1);
        list.push_back(2);
        list.push_back(3);
        assert_eq!(list.front(), Some(&1));
        assert_eq!(list.pop_front(), Some(1));
        assert_eq!(list.len(), 2);
        let rest: Vec<_> = list.drain().collect();
        assert_eq!(rest, vec![2, 3]);
        assert!(list.is_empty());
    }
}
