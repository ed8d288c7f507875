use log::debug;

use crate::block_header::{self, BlockHeader, HEADER_SIZE};
use crate::buffer_pool::BufferPool;
use crate::error::{DdffError, Result};
use crate::message_buffer::MessageBuffer;
use crate::work_queue::{WorkQueue, WriteJob};

/// Append cursor for one stream.
///
/// Bytes accumulate in the current buffer. A buffer that overflows is handed
/// to the write queue and replaced by a fresh one, so one logical write may
/// span several blocks. The file handler later drains the queue, asking the
/// writer to stamp each buffer's header (`get_buffer_to_write`) and telling it
/// where the block landed (`block_written`).
///
/// A writer starts uninitialized and becomes active once its block size is
/// known (`initialize`).
#[derive(Debug)]
pub struct FileStreamWrite {
    stream_id: u16,
    pool: BufferPool,
    current: Option<MessageBuffer>,
    initialized: bool,
    /// Content changed since the last close-off.
    dirty: bool,
    /// Block number stamped on the next buffer written.
    block_num: u32,
    /// Location of a partially filled block that must be rewritten in place.
    rewrite_offset: Option<u64>,
    /// Location of the most recently written block, back-linked once its
    /// successor's location is known.
    last_offset: Option<u64>,
}

impl FileStreamWrite {
    pub(crate) fn new(stream_id: u16, max_spare: usize) -> Self {
        FileStreamWrite {
            stream_id,
            pool: BufferPool::new(max_spare),
            current: None,
            initialized: false,
            dirty: false,
            block_num: 0,
            rewrite_offset: None,
            last_offset: None,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn block_size(&self) -> Option<usize> {
        self.pool.bufsize()
    }

    /// True while writes are accepted.
    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    pub fn rewrite_offset(&self) -> Option<u64> {
        self.rewrite_offset
    }

    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    /// Bytes used in the current block, header included.
    pub fn current_fill(&self) -> Option<usize> {
        self.current.as_ref().map(|b| b.fill)
    }

    /// Fix the block size and prepare the first buffer, which starts a fresh
    /// object right after the header.
    pub(crate) fn initialize(&mut self, block_size: usize) -> Result<()> {
        if self.initialized {
            return Err(DdffError::AlreadyInitialized(self.stream_id));
        }
        if block_size <= HEADER_SIZE || block_size > u32::MAX as usize {
            return Err(DdffError::InvalidBlockSize(block_size as u32));
        }
        self.pool.set_bufsize(block_size);
        let mut buf = self.spare()?;
        buf.object_offset = HEADER_SIZE;
        self.current = Some(buf);
        self.initialized = true;
        Ok(())
    }

    fn spare(&mut self) -> Result<MessageBuffer> {
        let mut buf = self
            .pool
            .get_spare()
            .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?;
        buf.start_block(self.stream_id);
        Ok(buf)
    }

    /// Hand the current buffer to the write queue and continue in a fresh one.
    fn rotate(&mut self, queue: &mut WorkQueue<WriteJob>) -> Result<()> {
        let fresh = self.spare()?;
        let full = self
            .current
            .replace(fresh)
            .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?;
        queue.push(WriteJob {
            stream_id: self.stream_id,
            buffer: full,
        });
        Ok(())
    }

    pub(crate) fn write(&mut self, mut bytes: &[u8], queue: &mut WorkQueue<WriteJob>) -> Result<()> {
        loop {
            let current = self
                .current
                .as_mut()
                .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?;
            let n = current.append(bytes);
            if n > 0 {
                self.dirty = true;
            }
            bytes = &bytes[n..];
            if bytes.is_empty() {
                return Ok(());
            }
            self.rotate(queue)?;
        }
    }

    /// Rotate first if the current block has no room left, so a mark never
    /// points at the end of a block.
    fn make_room(&mut self, queue: &mut WorkQueue<WriteJob>) -> Result<&mut MessageBuffer> {
        let full = self
            .current
            .as_ref()
            .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?
            .is_full();
        if full {
            self.rotate(queue)?;
        }
        self.current
            .as_mut()
            .ok_or(DdffError::NoCurrentBuffer(self.stream_id))
    }

    /// Remember the current position as the start of an item, if no item
    /// start was recorded in this block yet. Returns whether it was recorded.
    pub(crate) fn mark_item_start(&mut self, queue: &mut WorkQueue<WriteJob>) -> Result<bool> {
        let current = self.make_room(queue)?;
        if current.object_offset != 0 {
            return Ok(false);
        }
        current.object_offset = current.fill;
        Ok(true)
    }

    /// Mark the current position as the start of a recording stretch; also
    /// an item start.
    pub(crate) fn mark_stretch_start(&mut self, queue: &mut WorkQueue<WriteJob>) -> Result<()> {
        let current = self.make_room(queue)?;
        current.stretch_offset = current.fill;
        if current.object_offset == 0 {
            current.object_offset = current.fill;
        }
        Ok(())
    }

    pub(crate) fn clear_stretch_mark(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.stretch_offset = 0;
        }
    }

    /// Queue the current block for writing.
    ///
    /// With `intermediate` a zero-tailed copy is queued and writing continues
    /// in the same buffer; a full buffer is queued as is and replaced by a
    /// fresh one. Otherwise the buffer itself is queued and the writer accepts
    /// no more data. Returns whether a buffer was queued.
    pub(crate) fn close_off(&mut self, intermediate: bool, queue: &mut WorkQueue<WriteJob>) -> Result<bool> {
        if self.current.is_none() {
            return Ok(false);
        }
        if !self.dirty {
            if !intermediate && let Some(buf) = self.current.take() {
                self.pool.release(buf);
            }
            return Ok(false);
        }
        self.dirty = false;

        let full = self.current.as_ref().is_some_and(|b| b.is_full());
        if intermediate && full {
            self.rotate(queue)?;
        } else if intermediate {
            let mut copy = self.spare()?;
            let current = self
                .current
                .as_ref()
                .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?;
            copy.copy_from(current);
            copy.zero_tail();
            queue.push(WriteJob {
                stream_id: self.stream_id,
                buffer: copy,
            });
        } else {
            let mut buffer = self
                .current
                .take()
                .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?;
            buffer.zero_tail();
            queue.push(WriteJob {
                stream_id: self.stream_id,
                buffer,
            });
        }
        Ok(true)
    }

    /// Stamp the header of a buffer about to be written. The block number only
    /// advances past full blocks; a partial block keeps its number so it can be
    /// rewritten later.
    pub(crate) fn get_buffer_to_write(&mut self, buffer: &mut MessageBuffer) -> BlockHeader {
        let header = block_header::encode(buffer, self.stream_id, self.block_num);
        if buffer.is_full() {
            self.block_num += 1;
        }
        header
    }

    /// Record where a block landed on disk.
    pub(crate) fn block_written(&mut self, location: u64, partial: bool) {
        self.last_offset = Some(location);
        self.rewrite_offset = partial.then_some(location);
    }

    /// Give a written buffer back to the pool.
    pub(crate) fn release(&mut self, buffer: MessageBuffer) {
        self.pool.release(buffer);
    }

    /// Continue an existing on-disk stream whose last block is at `offset`.
    ///
    /// A full last block means the next buffer becomes a new block linked
    /// after it. A partial last block is loaded into the current buffer and
    /// rewritten in place once it is flushed again.
    pub(crate) fn access_buffer(&mut self, offset: u64, header: &BlockHeader, block: &[u8]) -> Result<()> {
        let size = self
            .block_size()
            .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?;
        if header.block_size as usize != size {
            return Err(DdffError::BlockSizeMismatch {
                stream_id: self.stream_id,
                expected: size as u32,
                found: header.block_size,
            });
        }
        let current = self
            .current
            .as_mut()
            .ok_or(DdffError::NoCurrentBuffer(self.stream_id))?;

        if header.is_full() {
            current.object_offset = 0;
            self.block_num = header.block_num + 1;
            self.last_offset = Some(offset);
            debug!(
                "stream {}: continues after full block {} at {}",
                self.stream_id, header.block_num, offset
            );
        } else {
            if self.rewrite_offset.is_some() {
                return Err(DdffError::RewriteOffsetSet(self.stream_id));
            }
            current.bytes_mut()[..size].copy_from_slice(&block[..size]);
            current.fill = header.block_fill as usize;
            current.object_offset = header.object_offset as usize;
            current.stretch_offset = 0;
            self.block_num = header.block_num;
            self.rewrite_offset = Some(offset);
            self.last_offset = Some(offset);
            debug!(
                "stream {}: reopened partial block {} at {} (fill {})",
                self.stream_id, header.block_num, offset, header.block_fill
            );
        }
        self.dirty = false;
        Ok(())
    }
}
