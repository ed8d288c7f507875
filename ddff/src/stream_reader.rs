use log::debug;

use crate::block_header::{BlockHeader, HEADER_SIZE};
use crate::buffer_pool::{BufferList, BufferPool};
use crate::error::{DdffError, Result};
use crate::message_buffer::MessageBuffer;
use crate::work_queue::{LoadJob, WorkQueue};

/// End offset of a read range that runs to the end of the stream.
pub const OPEN_END: u64 = u64::MAX;

/// Cache sizing for a reader's window of preloaded blocks.
#[derive(Debug, Clone, Copy)]
pub struct PreloadLimits {
    pub target: usize,
    pub floor: usize,
    pub max: usize,
}

/// A loaded block in the reader's window, with the read position in it.
#[derive(Debug)]
struct LoadedBlock {
    buffer: MessageBuffer,
    pos: usize,
}

/// Read cursor for one stream.
///
/// Blocks are requested one at a time along the `next_offset` chain and
/// collected in a small window; `take` copies bytes out of the window,
/// retiring exhausted blocks and asking for more. Every range reset bumps the
/// read cycle, and loads completing for an older cycle are dropped.
#[derive(Debug)]
pub struct FileStreamRead {
    stream_id: u16,
    pool: BufferPool,
    window: BufferList<LoadedBlock>,
    /// Only positioned through explicit read ranges, never from the stream start.
    slice_indexed: bool,
    start_offset: Option<u64>,
    end_offset: u64,
    /// Next block in the chain, not yet requested.
    next_request: Option<u64>,
    /// The next block delivered is the first of the current range.
    first_pending: bool,
    cycle: u32,
    /// Loads in flight for the current cycle.
    requested: usize,
    limits: PreloadLimits,
    target: usize,
    hint: usize,
}

impl FileStreamRead {
    pub(crate) fn new(stream_id: u16, slice_indexed: bool, limits: PreloadLimits, max_spare: usize) -> Self {
        FileStreamRead {
            stream_id,
            pool: BufferPool::new(max_spare),
            window: BufferList::new(),
            slice_indexed,
            start_offset: None,
            end_offset: OPEN_END,
            next_request: None,
            first_pending: false,
            cycle: 0,
            requested: 0,
            limits,
            target: limits.target.max(1),
            hint: 0,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn is_slice_indexed(&self) -> bool {
        self.slice_indexed
    }

    pub fn start_offset(&self) -> Option<u64> {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Current cache target (blocks buffered or requested).
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    /// Bytes left in the window.
    pub fn available(&self) -> usize {
        self.window
            .iter()
            .map(|block| block.buffer.fill.saturating_sub(block.pos))
            .sum()
    }

    /// True once no data is buffered, requested or known to follow.
    pub fn is_exhausted(&self) -> bool {
        self.window.is_empty() && self.requested == 0 && self.next_request.is_none()
    }

    /// Fix the buffer size; repeated calls with the same size are no-ops.
    pub(crate) fn init_buffer(&mut self, size: usize) -> Result<()> {
        if self.pool.set_bufsize(size) {
            Ok(())
        } else {
            Err(DdffError::BlockSizeMismatch {
                stream_id: self.stream_id,
                expected: self.pool.bufsize().unwrap_or(0) as u32,
                found: size as u32,
            })
        }
    }

    /// Start reading at the first block of the stream, located at `offset`.
    pub(crate) fn inform_offset(&mut self, offset: u64, queue: &mut WorkQueue<LoadJob>) -> Result<()> {
        self.start_offset = Some(offset);
        self.first_pending = true;
        if !self.slice_indexed {
            self.next_request = Some(offset);
            self.push_requests(queue)?;
        }
        Ok(())
    }

    /// Drop buffered data and invalidate loads still in flight.
    pub(crate) fn reset(&mut self) {
        self.cycle = self.cycle.wrapping_add(1);
        for block in self.window.drain().collect::<Vec<_>>() {
            self.pool.release(block.buffer);
        }
        self.requested = 0;
        self.next_request = None;
        self.first_pending = false;
        self.start_offset = None;
        self.end_offset = OPEN_END;
    }

    /// Read `[start, end)` in file offsets; `block_start` is the location of
    /// the block containing `start`.
    pub(crate) fn set_read_range(
        &mut self,
        block_start: u64,
        start: u64,
        end: u64,
        queue: &mut WorkQueue<LoadJob>,
    ) -> Result<()> {
        self.reset();
        self.start_offset = Some(start);
        self.end_offset = end;
        self.first_pending = true;
        if start < end {
            self.next_request = Some(block_start);
        }
        self.push_requests(queue)
    }

    /// Ask for `n` more blocks to be kept buffered.
    pub fn request_more(&mut self, n: usize) {
        self.hint += n;
    }

    /// Apply any pending preload hint and issue load requests up to the target.
    pub(crate) fn preload(&mut self, queue: &mut WorkQueue<LoadJob>) -> Result<()> {
        if self.hint > 0 {
            self.target = (self.target + self.hint).min(self.limits.max.max(1));
            self.hint = 0;
        }
        self.push_requests(queue)
    }

    /// The chain is followed one block at a time: the next location is only
    /// known once the previous block has been loaded.
    fn push_requests(&mut self, queue: &mut WorkQueue<LoadJob>) -> Result<()> {
        if self.requested > 0 || self.window.len() >= self.target {
            return Ok(());
        }
        let Some(offset) = self.next_request.take() else {
            return Ok(());
        };
        let Some(buffer) = self.pool.get_spare() else {
            self.next_request = Some(offset);
            return Err(DdffError::NoCurrentBuffer(self.stream_id));
        };
        queue.push(LoadJob {
            stream_id: self.stream_id,
            offset,
            cycle: self.cycle,
            buffer,
        });
        self.requested += 1;
        Ok(())
    }

    /// A load failed; forget the request.
    pub(crate) fn load_failed(&mut self, cycle: u32, buffer: MessageBuffer) {
        self.pool.release(buffer);
        if cycle == self.cycle {
            self.requested = self.requested.saturating_sub(1);
        }
    }

    /// Take delivery of the block at `offset`, loaded for read cycle `cycle`.
    pub(crate) fn append_buffer(
        &mut self,
        mut buffer: MessageBuffer,
        offset: u64,
        header: &BlockHeader,
        cycle: u32,
        queue: &mut WorkQueue<LoadJob>,
    ) -> Result<()> {
        if cycle != self.cycle {
            debug!(
                "stream {}: dropping block {} loaded for stale cycle {}",
                self.stream_id, header.block_num, cycle
            );
            self.pool.release(buffer);
            return Ok(());
        }
        self.requested = self.requested.saturating_sub(1);
        let end = self.end_offset;
        self.next_request = header.next().filter(|&next| next < end);

        if offset >= end {
            self.pool.release(buffer);
            return self.push_requests(queue);
        }

        let mut start = HEADER_SIZE;
        if self.first_pending {
            let range_start = self.start_offset.unwrap_or(offset);
            if range_start > offset {
                start = ((range_start - offset) as usize).max(HEADER_SIZE);
            } else if buffer.object_offset == 0 {
                // continuation of an item begun in an earlier block
                debug!(
                    "stream {}: no item starts in block {}, skipping",
                    self.stream_id, header.block_num
                );
                self.pool.release(buffer);
                return self.push_requests(queue);
            } else {
                start = buffer.object_offset;
            }
            self.first_pending = false;
            buffer.object_offset = start;
        }

        if end != OPEN_END {
            let limit = usize::try_from(end - offset).unwrap_or(usize::MAX);
            if limit < buffer.fill {
                buffer.fill = limit.max(start);
            }
        }

        if start >= buffer.fill {
            self.pool.release(buffer);
        } else {
            self.window.push_back(LoadedBlock { buffer, pos: start });
        }
        self.push_requests(queue)
    }

    /// Copy buffered bytes into `out`, crossing block boundaries.
    /// Returns the number of bytes copied; less than requested means the
    /// window ran dry.
    pub(crate) fn take(&mut self, out: &mut [u8], queue: &mut WorkQueue<LoadJob>) -> Result<usize> {
        let mut n = 0;
        while n < out.len() {
            let Some(front) = self.window.front_mut() else {
                break;
            };
            let avail = front.buffer.filled(front.pos);
            let k = avail.len().min(out.len() - n);
            out[n..n + k].copy_from_slice(&avail[..k]);
            front.pos += k;
            n += k;
            if front.pos >= front.buffer.fill {
                self.retire_front(queue)?;
            }
        }
        Ok(n)
    }

    /// A block retired while the window was still at its target means loads
    /// keep ahead of the consumer; the target shrinks towards the floor.
    fn retire_front(&mut self, queue: &mut WorkQueue<LoadJob>) -> Result<()> {
        let saturated = self.window.len() + self.requested >= self.target;
        if saturated && self.target > self.limits.floor.max(1) {
            self.target -= 1;
            debug!("stream {}: preload target down to {}", self.stream_id, self.target);
        }
        if let Some(done) = self.window.pop_front() {
            self.pool.release(done.buffer);
        }
        self.preload(queue)
    }

    /// Return all buffered blocks to the pool, e.g. when the reader is released.
    pub(crate) fn release_buffers(&mut self, jobs: Vec<LoadJob>) {
        for job in jobs {
            self.pool.release(job.buffer);
        }
        self.reset();
    }
}
