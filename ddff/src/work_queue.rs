use std::collections::VecDeque;

use log::warn;

use crate::message_buffer::MessageBuffer;

/// Default queue length above which a warning is logged.
pub const DEFAULT_QUEUE_SOFT_LIMIT: usize = 256;

/// A filled buffer handed over for writing to disk.
#[derive(Debug)]
pub struct WriteJob {
    pub stream_id: u16,
    pub buffer: MessageBuffer,
}

/// A request to load the block at `offset` into `buffer`.
/// `cycle` is the reader's read generation when the request was issued.
#[derive(Debug)]
pub struct LoadJob {
    pub stream_id: u16,
    pub offset: u64,
    pub cycle: u32,
    pub buffer: MessageBuffer,
}

/// FIFO hand-off point between buffer producers and the pass that performs
/// the file I/O.
///
/// The queue does not refuse work: exceeding the soft limit only logs a
/// warning, once per excursion.
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    items: VecDeque<T>,
    soft_limit: usize,
    over_limit: bool,
    high_water: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(name: &'static str, soft_limit: usize) -> Self {
        WorkQueue {
            name,
            items: VecDeque::new(),
            soft_limit,
            over_limit: false,
            high_water: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        let len = self.items.len();
        self.high_water = self.high_water.max(len);
        if len > self.soft_limit && !self.over_limit {
            self.over_limit = true;
            warn!("{} queue holds {} items (soft limit {})", self.name, len, self.soft_limit);
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front();
        if self.items.len() <= self.soft_limit {
            self.over_limit = false;
        }
        item
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Largest length seen since creation.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Remove and return every queued item matching `pred`, keeping the order
    /// of the rest.
    pub fn extract_if(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if pred(&item) {
                taken.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_high_water() {
        let mut q = WorkQueue::new("test", 2);
        for i in 0..4 {
            q.push(i);
        }
        assert_eq!(q.high_water(), 4);
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_extract_if_keeps_order() {
        let mut q = WorkQueue::new("test", 16);
        for i in 0..6 {
            q.push(i);
        }
        let odd = q.extract_if(|i| i % 2 == 1);
        assert_eq!(odd, vec![1, 3, 5]);
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(4));
        assert!(q.is_empty());
    }
}
