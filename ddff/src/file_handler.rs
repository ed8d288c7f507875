use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use fs2::FileExt;
use log::{debug, info, warn};

use crate::block_header::{self, BlockHeader, HEADER_SIZE};
use crate::buffer_pool::DEFAULT_SPARE_BUFFERS;
use crate::error::{DdffError, Result};
use crate::message_buffer::MessageBuffer;
use crate::record::{ReadCursor, WriteCursor};
use crate::stream_reader::{FileStreamRead, PreloadLimits};
use crate::stream_writer::FileStreamWrite;
use crate::work_queue::{DEFAULT_QUEUE_SOFT_LIMIT, LoadJob, WorkQueue, WriteJob};

/// Default block size for streams created without an explicit size.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// How a DDFF file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a new file; fails if it exists.
    New,
    /// Create the file, discarding any previous content.
    Truncate,
    /// Open an existing file and extend it.
    Append,
    /// Open the file if it exists, create it otherwise.
    Any,
    /// Open an existing file read-only.
    Read,
}

impl OpenMode {
    pub fn is_writable(&self) -> bool {
        *self != OpenMode::Read
    }
}

/// Tuning knobs for a file handler.
#[derive(Debug, Clone)]
pub struct FileOptions {
    /// Block size for streams created without an explicit size.
    pub block_size: u32,
    /// Initial number of blocks a reader keeps loaded or requested.
    pub preload_target: usize,
    /// Lower bound for the adaptive reader cache target.
    pub preload_floor: usize,
    /// Upper bound for the adaptive reader cache target.
    pub preload_max: usize,
    /// Queue length above which a warning is logged.
    pub queue_soft_limit: usize,
    /// Spare buffers kept per stream.
    pub spare_buffers: usize,
    /// Whether a read on an empty cache may run the blocking load pass itself.
    pub allow_forced_loads: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        FileOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            preload_target: 3,
            preload_floor: 2,
            preload_max: 16,
            queue_soft_limit: DEFAULT_QUEUE_SOFT_LIMIT,
            spare_buffers: DEFAULT_SPARE_BUFFERS,
            allow_forced_loads: true,
        }
    }
}

/// Handle to a stream opened for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteHandle(pub(crate) u16);

impl WriteHandle {
    pub fn stream_id(&self) -> u16 {
        self.0
    }
}

/// Handle to a stream opened for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadHandle(pub(crate) u16);

impl ReadHandle {
    pub fn stream_id(&self) -> u16 {
        self.0
    }
}

/// What the file handler knows about one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub block_size: Option<u32>,
    /// Location of block 0.
    pub first: Option<u64>,
    /// Location of the most recent block.
    pub last: Option<u64>,
    /// Locations of all known blocks, ascending.
    pub blocks: Vec<u64>,
}

/// Notified of every block written, with its file location.
pub trait WriteObserver {
    fn block_written(&mut self, offset: u64, buffer: &MessageBuffer);
}

/// Told when I/O work is queued, so an embedding loop can arrange for
/// `process_writes` / `run_loads` to be called.
pub trait IoScheduler {
    fn writes_queued(&mut self, _pending: usize) {}
    fn loads_queued(&mut self, _pending: usize) {}
}

/// Scheduler used when none is installed; the caller drives I/O.
struct ManualIo;

impl IoScheduler for ManualIo {}

/// Owner of one open DDFF file: the stream table, the attached writers and
/// readers, and the write and load queues between them and the disk.
pub struct FileHandler {
    file: File,
    path: PathBuf,
    mode: OpenMode,
    options: FileOptions,
    streams: Vec<StreamInfo>,
    writers: BTreeMap<u16, FileStreamWrite>,
    readers: BTreeMap<u16, FileStreamRead>,
    write_queue: WorkQueue<WriteJob>,
    load_queue: WorkQueue<LoadJob>,
    /// Where the next appended block goes.
    end_offset: u64,
    observer: Option<Rc<RefCell<dyn WriteObserver>>>,
    scheduler: Box<dyn IoScheduler>,
    closed: bool,
}

impl fmt::Debug for FileHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandler")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("streams", &self.streams.len())
            .field("end_offset", &self.end_offset)
            .finish_non_exhaustive()
    }
}

impl FileHandler {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, block_size: u32) -> Result<Self> {
        let options = FileOptions {
            block_size,
            ..FileOptions::default()
        };
        Self::open_with(path, mode, options)
    }

    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, options: FileOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.block_size as usize <= HEADER_SIZE {
            return Err(DdffError::InvalidBlockSize(options.block_size));
        }
        let exists = path.exists();
        match mode {
            OpenMode::New if exists => return Err(DdffError::FileExists(path)),
            OpenMode::Append | OpenMode::Read if !exists => return Err(DdffError::FileMissing(path)),
            _ => {}
        }

        let file = match mode {
            OpenMode::Read => fs::OpenOptions::new().read(true).open(&path)?,
            OpenMode::New => fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?,
            OpenMode::Truncate => fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
            OpenMode::Append | OpenMode::Any => fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?,
        };

        // shared lock for readers, exclusive for anything that may write
        let locked = if mode.is_writable() {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        locked.map_err(|e| DdffError::Locked(format!("{}: {}", path.display(), e)))?;

        let mut handler = FileHandler {
            file,
            path,
            mode,
            write_queue: WorkQueue::new("write", options.queue_soft_limit),
            load_queue: WorkQueue::new("load", options.queue_soft_limit),
            options,
            streams: Vec::new(),
            writers: BTreeMap::new(),
            readers: BTreeMap::new(),
            end_offset: 0,
            observer: None,
            scheduler: Box::new(ManualIo),
            closed: false,
        };
        if !matches!(mode, OpenMode::New | OpenMode::Truncate) {
            handler.check_indices(0)?;
        }
        info!(
            "opened {} ({:?}): {} streams, {} bytes",
            handler.path.display(),
            mode,
            handler.stream_ids().len(),
            handler.end_offset
        );
        Ok(handler)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn options(&self) -> &FileOptions {
        &self.options
    }

    /// File offset where the next appended block goes.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn pending_writes(&self) -> usize {
        self.write_queue.len()
    }

    pub fn pending_loads(&self) -> usize {
        self.load_queue.len()
    }

    /// Size of the stream table; every id below this has been seen or allocated.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_info(&self, stream_id: u16) -> Option<&StreamInfo> {
        self.streams
            .get(stream_id as usize)
            .filter(|s| s.block_size.is_some())
    }

    /// Ids of all streams with a known block size.
    pub fn stream_ids(&self) -> Vec<u16> {
        self.streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.block_size.is_some())
            .map(|(id, _)| id as u16)
            .collect()
    }

    pub fn writer(&self, handle: WriteHandle) -> Option<&FileStreamWrite> {
        self.writers.get(&handle.0)
    }

    pub fn reader(&self, handle: ReadHandle) -> Option<&FileStreamRead> {
        self.readers.get(&handle.0)
    }

    pub fn has_writer(&self, stream_id: u16) -> bool {
        self.writers.contains_key(&stream_id)
    }

    pub fn set_observer(&mut self, observer: Option<Rc<RefCell<dyn WriteObserver>>>) {
        self.observer = observer;
    }

    pub fn set_scheduler(&mut self, scheduler: Box<dyn IoScheduler>) {
        self.scheduler = scheduler;
    }

    fn notify_io(&mut self) {
        if !self.write_queue.is_empty() {
            self.scheduler.writes_queued(self.write_queue.len());
        }
        if !self.load_queue.is_empty() {
            self.scheduler.loads_queued(self.load_queue.len());
        }
    }

    /// Scan the file block by block from `start`, rebuilding the stream
    /// table. Every block's checksum is verified; corruption aborts the scan.
    /// A truncated block at the end of the file ends the scan with a warning.
    pub fn check_indices(&mut self, start: u64) -> Result<()> {
        if start == 0 {
            self.streams.clear();
        }
        let mut offset = start;
        let mut header_bytes = [0u8; HEADER_SIZE];
        let mut block = Vec::new();
        let mut scanned = 0usize;
        loop {
            self.file.seek(SeekFrom::Start(offset))?;
            let n = read_full(&mut self.file, &mut header_bytes)?;
            if n == 0 {
                break;
            }
            if n < HEADER_SIZE {
                warn!("{}: truncated block header at {}", self.path.display(), offset);
                break;
            }
            let header = BlockHeader::decode(&header_bytes)?;
            let size = header.block_size as usize;
            if size <= HEADER_SIZE {
                return Err(DdffError::InvalidBlockSize(header.block_size));
            }
            block.resize(size, 0);
            block[..HEADER_SIZE].copy_from_slice(&header_bytes);
            let n = read_full(&mut self.file, &mut block[HEADER_SIZE..])?;
            if n < size - HEADER_SIZE {
                warn!("{}: truncated block at {} ({} of {} bytes)", self.path.display(), offset, HEADER_SIZE + n, size);
                break;
            }
            header.verify(&block, offset)?;
            self.register_block(offset, &header)?;
            offset += size as u64;
            scanned += 1;
        }
        self.end_offset = offset;
        self.file.seek(SeekFrom::Start(0))?;
        debug!(
            "{}: scanned {} blocks, end of data at {}",
            self.path.display(),
            scanned,
            offset
        );

        let writer_ids: Vec<u16> = self
            .writers
            .iter()
            .filter(|(_, w)| !w.is_initialized())
            .map(|(id, _)| *id)
            .collect();
        for id in writer_ids {
            self.resume_writer(id)?;
        }
        for (id, reader) in self.readers.iter_mut() {
            let Some(info) = self.streams.get(*id as usize) else {
                continue;
            };
            if let Some(size) = info.block_size {
                reader.init_buffer(size as usize)?;
            }
            if reader.start_offset().is_none()
                && let Some(first) = info.first
            {
                reader.inform_offset(first, &mut self.load_queue)?;
            }
        }
        self.notify_io();
        Ok(())
    }

    fn register_block(&mut self, offset: u64, header: &BlockHeader) -> Result<()> {
        let info = stream_entry(&mut self.streams, header.stream_id);
        match info.block_size {
            Some(size) if size != header.block_size => {
                return Err(DdffError::BlockSizeMismatch {
                    stream_id: header.stream_id,
                    expected: size,
                    found: header.block_size,
                });
            }
            _ => info.block_size = Some(header.block_size),
        }
        if info.first.is_none() {
            if header.block_num != 0 {
                return Err(DdffError::FirstBlock {
                    stream_id: header.stream_id,
                    offset,
                    block_num: header.block_num,
                });
            }
            info.first = Some(offset);
        }
        if header.is_last() {
            info.last = Some(offset);
        }
        if let Err(at) = info.blocks.binary_search(&offset) {
            info.blocks.insert(at, offset);
        }
        Ok(())
    }

    /// Attach a writer to stream `stream_id`.
    ///
    /// A stream already present in the file keeps its block size and
    /// continues after its last block. A new stream uses `block_size`, or the
    /// file default.
    pub fn create_write(&mut self, stream_id: u16, block_size: Option<u32>) -> Result<WriteHandle> {
        if !self.mode.is_writable() {
            return Err(DdffError::ReadOnly);
        }
        if self.writers.contains_key(&stream_id) {
            return Err(DdffError::WriterExists(stream_id));
        }
        self.writers
            .insert(stream_id, FileStreamWrite::new(stream_id, self.options.spare_buffers));
        let known = self
            .streams
            .get(stream_id as usize)
            .and_then(|s| s.block_size);
        let result = match known {
            Some(_) => self.resume_writer(stream_id),
            None => {
                let size = block_size.unwrap_or(self.options.block_size);
                self.initialize_writer(stream_id, size)
            }
        };
        if let Err(e) = result {
            self.writers.remove(&stream_id);
            return Err(e);
        }
        Ok(WriteHandle(stream_id))
    }

    fn initialize_writer(&mut self, stream_id: u16, size: u32) -> Result<()> {
        let writer = self
            .writers
            .get_mut(&stream_id)
            .ok_or(DdffError::UnknownStream(stream_id))?;
        writer.initialize(size as usize)?;
        stream_entry(&mut self.streams, stream_id).block_size = Some(size);
        debug!("stream {}: new writer, block size {}", stream_id, size);
        Ok(())
    }

    /// Initialize a writer for a stream that already has blocks on disk and
    /// position it after the stream's last block.
    fn resume_writer(&mut self, stream_id: u16) -> Result<()> {
        let Some(info) = self.streams.get(stream_id as usize) else {
            return Ok(());
        };
        let Some(size) = info.block_size else {
            return Ok(());
        };
        let last = info.last.or_else(|| info.blocks.last().copied());
        let writer = self
            .writers
            .get_mut(&stream_id)
            .ok_or(DdffError::UnknownStream(stream_id))?;
        writer.initialize(size as usize)?;
        let Some(last) = last else {
            return Ok(());
        };

        let mut block = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(last))?;
        self.file.read_exact(&mut block)?;
        let header = BlockHeader::decode(&block)?;
        header.verify(&block, last)?;
        if header.stream_id != stream_id {
            return Err(DdffError::StreamIdMismatch {
                offset: last,
                expected: stream_id,
                found: header.stream_id,
            });
        }
        writer.access_buffer(last, &header, &block)
    }

    /// Attach a reader to stream `stream_id`. A `slice_indexed` reader only
    /// loads once a read range is set.
    pub fn create_read(&mut self, stream_id: u16, slice_indexed: bool) -> Result<ReadHandle> {
        if self.readers.contains_key(&stream_id) {
            return Err(DdffError::ReaderExists(stream_id));
        }
        let limits = PreloadLimits {
            target: self.options.preload_target,
            floor: self.options.preload_floor,
            max: self.options.preload_max,
        };
        let mut reader = FileStreamRead::new(stream_id, slice_indexed, limits, self.options.spare_buffers);
        if let Some(info) = self.streams.get(stream_id as usize)
            && let Some(size) = info.block_size
        {
            reader.init_buffer(size as usize)?;
            if let Some(first) = info.first {
                reader.inform_offset(first, &mut self.load_queue)?;
            }
        }
        self.readers.insert(stream_id, reader);
        self.notify_io();
        Ok(ReadHandle(stream_id))
    }

    pub fn write(&mut self, handle: WriteHandle, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writers
            .get_mut(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        writer.write(bytes, &mut self.write_queue)?;
        self.notify_io();
        Ok(())
    }

    /// Record the current write position as an item start, if none was
    /// recorded in the current block yet.
    pub fn mark_item_start(&mut self, handle: WriteHandle) -> Result<bool> {
        let writer = self
            .writers
            .get_mut(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        let marked = writer.mark_item_start(&mut self.write_queue)?;
        self.notify_io();
        Ok(marked)
    }

    /// Record the current write position as the start of a recording stretch.
    pub fn mark_stretch_start(&mut self, handle: WriteHandle) -> Result<()> {
        let writer = self
            .writers
            .get_mut(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        writer.mark_stretch_start(&mut self.write_queue)?;
        self.notify_io();
        Ok(())
    }

    /// Clear stretch marks left in the writers' current buffers.
    pub fn reset_stretch_marks(&mut self) {
        for writer in self.writers.values_mut() {
            writer.clear_stretch_mark();
        }
    }

    pub fn close_off(&mut self, handle: WriteHandle, intermediate: bool) -> Result<bool> {
        let writer = self
            .writers
            .get_mut(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        let queued = writer.close_off(intermediate, &mut self.write_queue)?;
        self.notify_io();
        Ok(queued)
    }

    /// Write every queued buffer to disk. Returns the number of blocks written.
    pub fn process_writes(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(job) = self.write_queue.pop() {
            self.write_block(job)?;
            count += 1;
        }
        Ok(count)
    }

    fn write_block(&mut self, job: WriteJob) -> Result<()> {
        let WriteJob { stream_id, mut buffer } = job;
        let writer = self
            .writers
            .get_mut(&stream_id)
            .ok_or(DdffError::UnknownStream(stream_id))?;

        let header = writer.get_buffer_to_write(&mut buffer);
        let partial = !header.is_full();
        let rewrite = writer.rewrite_offset();
        let previous = writer.last_offset();
        let location = rewrite.unwrap_or(self.end_offset);

        write_at(&mut self.file, location, buffer.bytes())?;
        if let Some(observer) = &self.observer {
            observer.borrow_mut().block_written(location, &buffer);
        }

        let info = stream_entry(&mut self.streams, stream_id);
        info.block_size = Some(header.block_size);
        info.last = Some(location);
        if let Some(at) = rewrite {
            debug!(
                "stream {}: rewrote block {} at {} (fill {})",
                stream_id, header.block_num, at, header.block_fill
            );
        } else {
            self.end_offset += buffer.capacity() as u64;
            info.blocks.push(location);
            if info.first.is_none() {
                info.first = Some(location);
                if let Some(reader) = self.readers.get_mut(&stream_id) {
                    reader.init_buffer(buffer.capacity())?;
                    if reader.start_offset().is_none() {
                        reader.inform_offset(location, &mut self.load_queue)?;
                    }
                }
            }
            if let Some(prev) = previous {
                write_at(&mut self.file, prev, &block_header::next_offset_bytes(location))?;
                debug!("stream {}: linked block at {} to {}", stream_id, prev, location);
            }
        }

        writer.block_written(location, partial);
        writer.release(buffer);
        Ok(())
    }

    /// Load every requested block and hand it to its reader. Returns the
    /// number of blocks loaded. A failed load is not retried.
    pub fn run_loads(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(job) = self.load_queue.pop() {
            self.load_block(job)?;
            count += 1;
        }
        Ok(count)
    }

    fn load_block(&mut self, job: LoadJob) -> Result<()> {
        let LoadJob {
            stream_id,
            offset,
            cycle,
            mut buffer,
        } = job;
        let Some(reader) = self.readers.get_mut(&stream_id) else {
            debug!("stream {}: dropping load for released reader", stream_id);
            return Ok(());
        };
        match load_into(&mut self.file, offset, &mut buffer, stream_id) {
            Ok(header) => reader.append_buffer(buffer, offset, &header, cycle, &mut self.load_queue),
            Err(e) => {
                reader.load_failed(cycle, buffer);
                Err(e)
            }
        }
    }

    /// Run the load pass from the calling context. This is the blocking
    /// fallback for a reader whose cache ran dry.
    pub fn force_load(&mut self) -> Result<usize> {
        debug!("{}: forced load of {} blocks", self.path.display(), self.load_queue.len());
        self.run_loads()
    }

    /// Close off every writer's current buffer and write all queued blocks.
    /// With `intermediate` writing can continue afterwards.
    pub fn sync_to_file(&mut self, intermediate: bool) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.close_off(intermediate, &mut self.write_queue)?;
        }
        self.process_writes()?;
        Ok(())
    }

    /// Copy up to `out.len()` bytes from the stream. Returns fewer bytes only
    /// at the end of the stream or read range.
    pub fn read(&mut self, handle: ReadHandle, out: &mut [u8]) -> Result<usize> {
        let force = self.options.allow_forced_loads;
        self.read_with(handle, out, force)
    }

    pub(crate) fn read_with(&mut self, handle: ReadHandle, out: &mut [u8], force: bool) -> Result<usize> {
        let mut n = 0;
        loop {
            let reader = self
                .readers
                .get_mut(&handle.0)
                .ok_or(DdffError::UnknownStream(handle.0))?;
            n += reader.take(&mut out[n..], &mut self.load_queue)?;
            if n == out.len() || reader.is_exhausted() {
                break;
            }
            if !force {
                if n == 0 {
                    return Err(DdffError::LoadsPending(handle.0));
                }
                break;
            }
            if self.force_load()? == 0 {
                break;
            }
        }
        self.notify_io();
        Ok(n)
    }

    pub fn read_exact(&mut self, handle: ReadHandle, out: &mut [u8]) -> Result<()> {
        let n = self.read(handle, out)?;
        if n < out.len() {
            return Err(DdffError::UnexpectedEnd(handle.0));
        }
        Ok(())
    }

    /// True once the reader has consumed everything in its range.
    pub fn at_end(&self, handle: ReadHandle) -> Result<bool> {
        let reader = self
            .readers
            .get(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        Ok(reader.is_exhausted())
    }

    /// Sequential byte source over a reader.
    pub fn cursor(&mut self, handle: ReadHandle) -> ReadCursor<'_> {
        let force = self.options.allow_forced_loads;
        ReadCursor::new(self, handle, force)
    }

    /// Byte sink over a writer.
    pub fn write_cursor(&mut self, handle: WriteHandle) -> WriteCursor<'_> {
        WriteCursor::new(self, handle)
    }

    /// Byte source that may always load blocks itself; used when scanning
    /// the reserved streams during open.
    pub(crate) fn scan_cursor(&mut self, handle: ReadHandle) -> ReadCursor<'_> {
        ReadCursor::new(self, handle, true)
    }

    /// Restrict the reader to the file offsets `[start, end)`; `end` may be
    /// `OPEN_END`. The block containing `start` is looked up in the stream table.
    pub fn set_read_range(&mut self, handle: ReadHandle, start: u64, end: u64) -> Result<()> {
        let reader = self
            .readers
            .get_mut(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        let info = self.streams.get(handle.0 as usize);
        if let Some(size) = info.and_then(|s| s.block_size) {
            reader.init_buffer(size as usize)?;
        }
        match info.and_then(|s| containing_block(&s.blocks, start)) {
            Some(block) => reader.set_read_range(block, start, end, &mut self.load_queue)?,
            None => reader.set_read_range(0, start, start, &mut self.load_queue)?,
        }
        self.notify_io();
        Ok(())
    }

    /// Restart reading from the first block of the stream.
    pub fn reset_read(&mut self, handle: ReadHandle) -> Result<()> {
        let reader = self
            .readers
            .get_mut(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        reader.reset();
        if let Some(first) = self.streams.get(handle.0 as usize).and_then(|s| s.first) {
            reader.inform_offset(first, &mut self.load_queue)?;
        }
        self.notify_io();
        Ok(())
    }

    /// Ask the reader to keep `more` additional blocks loaded ahead.
    pub fn preload(&mut self, handle: ReadHandle, more: usize) -> Result<()> {
        let reader = self
            .readers
            .get_mut(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        reader.request_more(more);
        reader.preload(&mut self.load_queue)?;
        self.notify_io();
        Ok(())
    }

    pub fn release_read(&mut self, handle: ReadHandle) -> Result<()> {
        let mut reader = self
            .readers
            .remove(&handle.0)
            .ok_or(DdffError::UnknownStream(handle.0))?;
        let pending = self.load_queue.extract_if(|job| job.stream_id == handle.0);
        reader.release_buffers(pending);
        Ok(())
    }

    /// Flush the writer's last block and detach it.
    pub fn release_write(&mut self, handle: WriteHandle) -> Result<()> {
        self.close_off(handle, false)?;
        self.process_writes()?;
        self.writers.remove(&handle.0);
        Ok(())
    }

    /// Walk every stream's block chain from its first block and report
    /// problems: bad checksums, foreign blocks, gaps in the block numbering,
    /// changing block sizes, and chains that do not end in a last block.
    /// Reads the file as it is on disk; sync first to include pending data.
    pub fn verify(&mut self) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        let mut block = Vec::new();
        for (id, info) in self.streams.iter().enumerate() {
            let (Some(first), Some(size)) = (info.first, info.block_size) else {
                continue;
            };
            block.resize(size as usize, 0);
            let mut offset = Some(first);
            let mut expected_num = 0u32;
            let mut terminated = false;
            let mut broken = false;
            while let Some(at) = offset {
                if expected_num as usize > info.blocks.len() {
                    issues.push(format!("stream {}: block chain loops at {}", id, at));
                    broken = true;
                    break;
                }
                self.file.seek(SeekFrom::Start(at))?;
                if let Err(e) = self.file.read_exact(&mut block) {
                    issues.push(format!("stream {}: cannot read block at {}: {}", id, at, e));
                    broken = true;
                    break;
                }
                let header = match BlockHeader::decode(&block).and_then(|h| h.verify(&block, at).map(|_| h)) {
                    Ok(h) => h,
                    Err(e) => {
                        issues.push(format!("stream {}: {}", id, e));
                        broken = true;
                        break;
                    }
                };
                if header.stream_id as usize != id {
                    issues.push(format!(
                        "stream {}: block at {} belongs to stream {}",
                        id, at, header.stream_id
                    ));
                    broken = true;
                    break;
                }
                if header.block_num != expected_num {
                    issues.push(format!(
                        "stream {}: block at {} is number {}, expected {}",
                        id, at, header.block_num, expected_num
                    ));
                }
                if header.block_size != size {
                    issues.push(format!(
                        "stream {}: block at {} has size {}, expected {}",
                        id, at, header.block_size, size
                    ));
                }
                expected_num += 1;
                terminated = header.is_last();
                offset = header.next();
            }
            if !terminated && !broken {
                issues.push(format!("stream {}: chain does not end in a last block", id));
            }
            if terminated && expected_num as usize != info.blocks.len() {
                issues.push(format!(
                    "stream {}: chain reaches {} of {} blocks",
                    id,
                    expected_num,
                    info.blocks.len()
                ));
            }
        }
        self.file.seek(SeekFrom::Start(0))?;
        Ok(issues)
    }

    /// Flush all writers and the file itself.
    pub fn close(mut self) -> Result<()> {
        self.sync_to_file(false)?;
        if self.mode.is_writable() {
            self.file.sync_all()?;
        }
        self.closed = true;
        info!("closed {}", self.path.display());
        Ok(())
    }
}

impl Drop for FileHandler {
    fn drop(&mut self) {
        if self.closed || !self.mode.is_writable() {
            return;
        }
        if let Err(e) = self.sync_to_file(false) {
            warn!("{}: final sync failed: {}", self.path.display(), e);
        }
    }
}

fn stream_entry(streams: &mut Vec<StreamInfo>, stream_id: u16) -> &mut StreamInfo {
    let idx = stream_id as usize;
    if streams.len() <= idx {
        streams.resize_with(idx + 1, StreamInfo::default);
    }
    &mut streams[idx]
}

/// Location of the last block starting at or before `offset`, or the first
/// block if `offset` precedes the stream.
fn containing_block(blocks: &[u64], offset: u64) -> Option<u64> {
    let idx = blocks.partition_point(|&b| b <= offset);
    if idx == 0 {
        blocks.first().copied()
    } else {
        Some(blocks[idx - 1])
    }
}

/// Read until `buf` is full or the file ends. Returns the bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match file.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

fn load_into(file: &mut File, offset: u64, buffer: &mut MessageBuffer, stream_id: u16) -> Result<BlockHeader> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buffer.bytes_mut())?;
    let header = block_header::decode_buffer(buffer, offset)?;
    if header.stream_id != stream_id {
        return Err(DdffError::StreamIdMismatch {
            offset,
            expected: stream_id,
            found: header.stream_id,
        });
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_reader::OPEN_END;
    use tempfile::TempDir;

    fn temp_path(name: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    fn read_all(fh: &mut FileHandler, h: ReadHandle) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 50];
        loop {
            let n = fh.read(h, &mut chunk).unwrap();
            out.extend_from_slice(&chunk[..n]);
            if n < chunk.len() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_open_mode_checks() {
        let (_dir, path) = temp_path("modes.ddff");
        assert!(matches!(
            FileHandler::open(&path, OpenMode::Read, 64),
            Err(DdffError::FileMissing(_))
        ));
        assert!(matches!(
            FileHandler::open(&path, OpenMode::Append, 64),
            Err(DdffError::FileMissing(_))
        ));
        FileHandler::open(&path, OpenMode::New, 64).unwrap().close().unwrap();
        assert!(matches!(
            FileHandler::open(&path, OpenMode::New, 64),
            Err(DdffError::FileExists(_))
        ));
        let mut ro = FileHandler::open(&path, OpenMode::Read, 64).unwrap();
        assert!(matches!(ro.create_write(2, None), Err(DdffError::ReadOnly)));
    }

    #[test]
    fn test_invalid_block_size() {
        let (_dir, path) = temp_path("bs.ddff");
        assert!(matches!(
            FileHandler::open(&path, OpenMode::New, 16),
            Err(DdffError::InvalidBlockSize(16))
        ));
    }

    #[test]
    fn test_exclusive_lock() {
        let (_dir, path) = temp_path("lock.ddff");
        let _fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        assert!(matches!(
            FileHandler::open(&path, OpenMode::Any, 64),
            Err(DdffError::Locked(_))
        ));
    }

    #[test]
    fn test_write_and_read_back_in_session() {
        let (_dir, path) = temp_path("rw.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let w = fh.create_write(2, None).unwrap();
        let data: Vec<u8> = (0..200u8).collect();
        fh.write(w, &data).unwrap();
        fh.sync_to_file(true).unwrap();
        assert_eq!(fh.stream_info(2).unwrap().blocks.len(), 6);

        let r = fh.create_read(2, false).unwrap();
        assert_eq!(read_all(&mut fh, r), data);
        assert!(fh.at_end(r).unwrap());
    }

    #[test]
    fn test_duplicate_handles_rejected() {
        let (_dir, path) = temp_path("dup.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        fh.create_write(2, None).unwrap();
        assert!(matches!(fh.create_write(2, None), Err(DdffError::WriterExists(2))));
        fh.create_read(2, false).unwrap();
        assert!(matches!(fh.create_read(2, false), Err(DdffError::ReaderExists(2))));
    }

    #[test]
    fn test_reopen_scans_streams() {
        let (_dir, path) = temp_path("scan.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let a = fh.create_write(2, None).unwrap();
        let b = fh.create_write(3, Some(128)).unwrap();
        fh.write(a, &[1u8; 80]).unwrap();
        fh.write(b, &[2u8; 70]).unwrap();
        fh.close().unwrap();

        let fh = FileHandler::open(&path, OpenMode::Read, 64).unwrap();
        assert_eq!(fh.stream_ids(), vec![2, 3]);
        let a = fh.stream_info(2).unwrap();
        assert_eq!(a.block_size, Some(64));
        assert_eq!(a.blocks.len(), 3);
        assert_eq!(a.first, Some(a.blocks[0]));
        assert_eq!(a.last, Some(a.blocks[2]));
        assert_eq!(fh.stream_info(3).unwrap().block_size, Some(128));
    }

    #[test]
    fn test_read_range_within_stream() {
        let (_dir, path) = temp_path("range.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let w = fh.create_write(2, None).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        fh.write(w, &data).unwrap();
        fh.sync_to_file(true).unwrap();

        // second block holds bytes 36..72 of the stream
        let second = fh.stream_info(2).unwrap().blocks[1];
        let r = fh.create_read(2, true).unwrap();
        let start = second + HEADER_SIZE as u64 + 4;
        fh.set_read_range(r, start, OPEN_END).unwrap();
        assert_eq!(read_all(&mut fh, r), data[40..].to_vec());

        fh.set_read_range(r, start, start + 10).unwrap();
        assert_eq!(read_all(&mut fh, r), data[40..50].to_vec());
    }

    #[test]
    fn test_forced_loads_disabled() {
        let (_dir, path) = temp_path("noforce.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let w = fh.create_write(2, None).unwrap();
        fh.write(w, b"payload").unwrap();
        fh.close().unwrap();

        let options = FileOptions {
            block_size: 64,
            allow_forced_loads: false,
            ..FileOptions::default()
        };
        let mut fh = FileHandler::open_with(&path, OpenMode::Read, options).unwrap();
        let r = fh.create_read(2, false).unwrap();
        let mut out = [0u8; 7];
        assert!(matches!(fh.read(r, &mut out), Err(DdffError::LoadsPending(2))));
        assert_eq!(fh.run_loads().unwrap(), 1);
        fh.read_exact(r, &mut out).unwrap();
        assert_eq!(&out, b"payload");
    }

    #[test]
    fn test_observer_sees_every_block() {
        struct Collect(Vec<(u64, u16)>);
        impl WriteObserver for Collect {
            fn block_written(&mut self, offset: u64, buffer: &MessageBuffer) {
                self.0.push((offset, buffer.stream_id));
            }
        }

        let (_dir, path) = temp_path("obs.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let seen = Rc::new(RefCell::new(Collect(Vec::new())));
        let observer: Rc<RefCell<dyn WriteObserver>> = seen.clone();
        fh.set_observer(Some(observer));
        let w = fh.create_write(2, None).unwrap();
        fh.write(w, &[0u8; 40]).unwrap();
        fh.sync_to_file(false).unwrap();
        assert_eq!(seen.borrow().0, vec![(0, 2), (64, 2)]);
    }

    #[test]
    fn test_scheduler_told_about_queued_writes() {
        struct Count(Rc<RefCell<usize>>);
        impl IoScheduler for Count {
            fn writes_queued(&mut self, _pending: usize) {
                *self.0.borrow_mut() += 1;
            }
        }

        let (_dir, path) = temp_path("sched.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let calls = Rc::new(RefCell::new(0));
        fh.set_scheduler(Box::new(Count(calls.clone())));
        let w = fh.create_write(2, None).unwrap();
        fh.write(w, &[0u8; 10]).unwrap();
        assert_eq!(*calls.borrow(), 0);
        fh.write(w, &[0u8; 40]).unwrap();
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(fh.pending_writes(), 1);
    }

    #[test]
    fn test_verify_clean_file() {
        let (_dir, path) = temp_path("verify.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let a = fh.create_write(2, None).unwrap();
        let b = fh.create_write(3, None).unwrap();
        for _ in 0..5 {
            fh.write(a, &[7u8; 30]).unwrap();
            fh.write(b, &[9u8; 20]).unwrap();
        }
        fh.sync_to_file(false).unwrap();
        assert!(fh.verify().unwrap().is_empty());
    }

    /// Raw image of one block as a writer would have stamped it.
    fn stamped_block(stream_id: u16, size: usize, block_num: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = MessageBuffer::new(size);
        buf.start_block(stream_id);
        buf.append(payload);
        buf.object_offset = HEADER_SIZE;
        buf.zero_tail();
        block_header::encode(&mut buf, stream_id, block_num);
        buf.bytes().to_vec()
    }

    #[test]
    fn test_scan_rejects_stream_not_starting_at_block_zero() {
        let (_dir, path) = temp_path("first.ddff");
        let mut image = stamped_block(2, 64, 0, b"ok");
        image.extend(stamped_block(3, 64, 1, b"orphan"));
        fs::write(&path, &image).unwrap();
        assert!(matches!(
            FileHandler::open(&path, OpenMode::Read, 64),
            Err(DdffError::FirstBlock {
                stream_id: 3,
                offset: 64,
                block_num: 1
            })
        ));
    }

    #[test]
    fn test_scan_rejects_mixed_block_sizes() {
        let (_dir, path) = temp_path("mixed.ddff");
        let mut image = stamped_block(2, 64, 0, b"small");
        image.extend(stamped_block(2, 128, 1, b"large"));
        fs::write(&path, &image).unwrap();
        assert!(matches!(
            FileHandler::open(&path, OpenMode::Append, 64),
            Err(DdffError::BlockSizeMismatch {
                stream_id: 2,
                expected: 64,
                found: 128
            })
        ));
    }

    #[test]
    fn test_reset_read_restarts_from_first_block() {
        let (_dir, path) = temp_path("reset.ddff");
        let mut fh = FileHandler::open(&path, OpenMode::New, 64).unwrap();
        let w = fh.create_write(2, None).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        fh.write(w, &data).unwrap();
        fh.sync_to_file(true).unwrap();

        let r = fh.create_read(2, false).unwrap();
        let mut head = [0u8; 50];
        fh.read_exact(r, &mut head).unwrap();
        assert_eq!(&head[..], &data[..50]);

        fh.reset_read(r).unwrap();
        assert_eq!(read_all(&mut fh, r), data);
    }

    #[test]
    fn test_containing_block() {
        let blocks = [0, 64, 256];
        assert_eq!(containing_block(&blocks, 0), Some(0));
        assert_eq!(containing_block(&blocks, 100), Some(64));
        assert_eq!(containing_block(&blocks, 300), Some(256));
        assert_eq!(containing_block(&[128], 10), Some(128));
        assert_eq!(containing_block(&[], 10), None);
    }
}
