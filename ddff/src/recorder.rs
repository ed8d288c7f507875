use crate::error::{DdffError, Result};
use crate::file_handler::{FileHandler, ReadHandle, WriteHandle};
use crate::inventory::FileWithInventory;
use crate::record::{ByteSink, ByteSource, Record};
use crate::segments::TimeTick;

/// A data stream whose writes are bracketed into stretches by the segment
/// layer.
pub trait StretchRecorder {
    fn stream_id(&self) -> u16;

    /// A stretch starts; the next item written opens it.
    fn start_stretch(&mut self, tick: TimeTick);

    /// True once everything up to `tick` has been handed to the writer.
    fn complete_to(&self, tick: TimeTick) -> bool;

    /// Push buffered data towards the disk; writing continues afterwards.
    fn sync(&mut self, handler: &mut FileHandler) -> Result<()>;

    /// True if nothing was written since the stretch started.
    fn is_clean(&self) -> bool;

    /// Position the replay reader on the file range `[start, end)`.
    fn spool(&mut self, handler: &mut FileHandler, start: u64, end: u64) -> Result<()>;
}

/// One recorded item: a time tick and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedItem {
    pub tick: TimeTick,
    pub payload: Vec<u8>,
}

impl Record for TimedItem {
    fn pack<S: ByteSink>(&self, sink: &mut S) -> Result<()> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| DdffError::MalformedRecord(format!("payload of {} bytes", self.payload.len())))?;
        sink.put_u32(self.tick)?;
        sink.put_u32(len)?;
        sink.put_bytes(&self.payload)
    }

    fn unpack<S: ByteSource>(source: &mut S) -> Result<Self> {
        let tick = source.take_u32()?;
        let len = source.take_u32()? as usize;
        Ok(TimedItem {
            tick,
            payload: source.take_vec(len)?,
        })
    }
}

/// Records timed items into a named stream and replays them.
#[derive(Debug)]
pub struct StreamRecorder {
    stream_id: u16,
    write: Option<WriteHandle>,
    read: ReadHandle,
    /// The next item opens a stretch.
    armed: bool,
    clean: bool,
    done_through: Option<TimeTick>,
}

impl StreamRecorder {
    /// Open (or register) the stream `key` for recording and replay.
    pub fn create(files: &mut FileWithInventory, key: &str, label: &str, block_size: Option<u32>) -> Result<Self> {
        let write = files.create_named_write(key, label, block_size)?;
        let read = files.find_named_read(key, true)?;
        Ok(StreamRecorder {
            stream_id: write.stream_id(),
            write: Some(write),
            read,
            armed: false,
            clean: true,
            done_through: None,
        })
    }

    /// Attach to an existing stream for replay only.
    pub fn replay_only(files: &mut FileWithInventory, key: &str) -> Result<Self> {
        let read = files.find_named_read(key, true)?;
        Ok(StreamRecorder {
            stream_id: read.stream_id(),
            write: None,
            read,
            armed: false,
            clean: true,
            done_through: None,
        })
    }

    pub fn read_handle(&self) -> ReadHandle {
        self.read
    }

    pub fn record(&mut self, handler: &mut FileHandler, tick: TimeTick, payload: &[u8]) -> Result<()> {
        let write = self.write.ok_or(DdffError::ReadOnly)?;
        if self.armed {
            handler.mark_stretch_start(write)?;
            self.armed = false;
        } else {
            handler.mark_item_start(write)?;
        }
        let item = TimedItem {
            tick,
            payload: payload.to_vec(),
        };
        item.pack(&mut handler.write_cursor(write))?;
        self.clean = false;
        self.mark_until(tick);
        Ok(())
    }

    /// Declare that no items up to `tick` are outstanding.
    pub fn mark_until(&mut self, tick: TimeTick) {
        self.done_through = Some(self.done_through.map_or(tick, |d| d.max(tick)));
    }

    /// Next item in the replay range, or `None` at its end.
    pub fn replay_next(&mut self, handler: &mut FileHandler) -> Result<Option<TimedItem>> {
        handler.cursor(self.read).next_record()
    }
}

impl StretchRecorder for StreamRecorder {
    fn stream_id(&self) -> u16 {
        self.stream_id
    }

    fn start_stretch(&mut self, _tick: TimeTick) {
        self.armed = self.write.is_some();
        self.clean = true;
    }

    fn complete_to(&self, tick: TimeTick) -> bool {
        self.done_through.is_some_and(|d| d >= tick)
    }

    fn sync(&mut self, handler: &mut FileHandler) -> Result<()> {
        if let Some(write) = self.write {
            handler.close_off(write, true)?;
        }
        Ok(())
    }

    fn is_clean(&self) -> bool {
        self.clean
    }

    fn spool(&mut self, handler: &mut FileHandler, start: u64, end: u64) -> Result<()> {
        handler.set_read_range(self.read, start, end)
    }
}
