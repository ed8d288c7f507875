use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::{DdffError, Result};
use crate::file_handler::{FileHandler, FileOptions, OpenMode, WriteHandle, WriteObserver};
use crate::inventory::{FIRST_DATA_STREAM, FileWithInventory, TAG_STREAM, read_records};
use crate::message_buffer::MessageBuffer;
use crate::record::{ByteSink, ByteSource, Record};
use crate::recorder::StretchRecorder;
use crate::stream_reader::OPEN_END;

/// Logical time used for stretch bounds.
pub type TimeTick = u32;

/// A recorded stretch: where each recorder's data for it begins.
///
/// `offset[i]` is the location of the block holding recorder `i`'s first
/// item of the stretch and `inblock_offset[i]` that item's position in the
/// block; an `inblock_offset` of 0 means the recorder wrote nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag {
    pub offset: Vec<i64>,
    pub inblock_offset: Vec<u32>,
    pub cycle: u32,
    pub index0: TimeTick,
    pub index1: TimeTick,
    /// Wall clock at stretch start, seconds since the Unix epoch.
    pub time: u64,
    pub label: String,
    pub aux: String,
}

impl Tag {
    /// File offset of recorder `i`'s first item in this stretch.
    pub fn start_of(&self, i: usize) -> Option<u64> {
        let inblock = *self.inblock_offset.get(i)?;
        let offset = *self.offset.get(i)?;
        (inblock != 0).then(|| offset as u64 + inblock as u64)
    }
}

impl Record for Tag {
    fn pack<S: ByteSink>(&self, sink: &mut S) -> Result<()> {
        if self.offset.len() != self.inblock_offset.len() {
            return Err(DdffError::MalformedRecord(format!(
                "tag {} has {} offsets and {} in-block offsets",
                self.cycle,
                self.offset.len(),
                self.inblock_offset.len()
            )));
        }
        sink.put_u32(self.offset.len() as u32)?;
        for o in &self.offset {
            sink.put_i64(*o)?;
        }
        for o in &self.inblock_offset {
            sink.put_u32(*o)?;
        }
        sink.put_u32(self.cycle)?;
        sink.put_u32(self.index0)?;
        sink.put_u32(self.index1)?;
        sink.put_u64(self.time)?;
        sink.put_str(&self.label)?;
        sink.put_str(&self.aux)
    }

    fn unpack<S: ByteSource>(source: &mut S) -> Result<Self> {
        let count = source.take_u32()? as usize;
        let offset = (0..count).map(|_| source.take_i64()).collect::<Result<Vec<_>>>()?;
        let inblock_offset = (0..count).map(|_| source.take_u32()).collect::<Result<Vec<_>>>()?;
        Ok(Tag {
            offset,
            inblock_offset,
            cycle: source.take_u32()?,
            index0: source.take_u32()?,
            index1: source.take_u32()?,
            time: source.take_u64()?,
            label: source.take_str()?,
            aux: source.take_str()?,
        })
    }
}

/// Write hook capturing, per data stream, the first block written during a
/// stretch that carries a stretch mark.
#[derive(Debug, Default)]
pub struct StretchTracker {
    active: bool,
    entries: BTreeMap<u16, (u64, u32)>,
}

impl StretchTracker {
    fn start(&mut self) {
        self.entries.clear();
        self.active = true;
    }

    fn stop(&mut self) {
        self.active = false;
    }

    /// Block location and in-block offset recorded for `stream_id`.
    pub fn entry(&self, stream_id: u16) -> Option<(u64, u32)> {
        self.entries.get(&stream_id).copied()
    }
}

impl WriteObserver for StretchTracker {
    fn block_written(&mut self, offset: u64, buffer: &MessageBuffer) {
        if !self.active || buffer.stream_id < FIRST_DATA_STREAM || buffer.stretch_offset == 0 {
            return;
        }
        self.entries
            .entry(buffer.stream_id)
            .or_insert((offset, buffer.stretch_offset as u32));
    }
}

/// A file with named streams and a directory of recorded stretches
/// (segments) in stream 1.
pub struct FileWithSegments {
    files: FileWithInventory,
    tags: Vec<Tag>,
    tag_lookup: HashMap<String, u32>,
    tag_writer: Option<WriteHandle>,
    tracker: Rc<RefCell<StretchTracker>>,
    recorders: Vec<Rc<RefCell<dyn StretchRecorder>>>,
    /// Label and aux text for the next stretch.
    next_label: Option<(String, String)>,
    /// Tag of the stretch being recorded.
    current: Option<Tag>,
    window: (TimeTick, TimeTick),
}

impl fmt::Debug for FileWithSegments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWithSegments")
            .field("files", &self.files)
            .field("tags", &self.tags.len())
            .field("recorders", &self.recorders.len())
            .field("current", &self.current)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl FileWithSegments {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, block_size: u32) -> Result<Self> {
        let options = FileOptions {
            block_size,
            ..FileOptions::default()
        };
        Self::open_with(path, mode, options)
    }

    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, options: FileOptions) -> Result<Self> {
        let mut files = FileWithInventory::open_with(path, mode, options)?;
        let handler = files.handler_mut();
        let tags: Vec<Tag> = if handler.stream_info(TAG_STREAM).is_some() {
            read_records(handler, TAG_STREAM)?
        } else {
            Vec::new()
        };
        let tag_writer = if mode.is_writable() {
            Some(handler.create_write(TAG_STREAM, None)?)
        } else {
            None
        };
        let tracker = Rc::new(RefCell::new(StretchTracker::default()));
        let observer: Rc<RefCell<dyn WriteObserver>> = tracker.clone();
        handler.set_observer(Some(observer));
        let tag_lookup = tags.iter().map(|t| (t.label.clone(), t.cycle)).collect();
        debug!("{}: {} segments", handler.path().display(), tags.len());
        Ok(FileWithSegments {
            files,
            tags,
            tag_lookup,
            tag_writer,
            tracker,
            recorders: Vec::new(),
            next_label: None,
            current: None,
            window: (TimeTick::MAX, TimeTick::MAX),
        })
    }

    pub fn inventory(&self) -> &FileWithInventory {
        &self.files
    }

    pub fn inventory_mut(&mut self) -> &mut FileWithInventory {
        &mut self.files
    }

    pub fn handler_mut(&mut self) -> &mut FileHandler {
        self.files.handler_mut()
    }

    pub fn segments(&self) -> &[Tag] {
        &self.tags
    }

    pub fn find_segment(&self, label: &str) -> Option<u32> {
        self.tag_lookup.get(label).copied()
    }

    /// Add a recorder; its position in registration order is its index in
    /// every tag written from now on.
    pub fn register_recorder(&mut self, recorder: Rc<RefCell<dyn StretchRecorder>>) -> usize {
        self.recorders.push(recorder);
        self.recorders.len() - 1
    }

    pub fn recorder_count(&self) -> usize {
        self.recorders.len()
    }

    /// True while a named stretch awaits completion.
    pub fn is_stretch_pending(&self) -> bool {
        self.current.is_some()
    }

    /// True if `tick` lies in the active recording window.
    pub fn is_recording(&self, tick: TimeTick) -> bool {
        self.window.0 <= tick && tick < self.window.1
    }

    /// Name the next stretch. A label already in use gets a numeric suffix;
    /// the label actually used is returned.
    pub fn name_recording(&mut self, label: &str, aux: &str) -> String {
        let mut name = label.to_string();
        let mut n = 1;
        while self.tag_lookup.contains_key(&name) || self.current.as_ref().is_some_and(|t| t.label == name) {
            n += 1;
            name = format!("{}_{}", label, n);
        }
        self.next_label = Some((name.clone(), aux.to_string()));
        name
    }

    /// Open the recording window at `tick`. If a label is waiting and no
    /// stretch is pending, a new stretch starts: queued blocks are flushed,
    /// stale stretch marks cleared, and every recorder is told to mark its
    /// next item.
    pub fn start_stretch(&mut self, tick: TimeTick, wall_time: SystemTime) -> Result<()> {
        if self.current.is_none() && self.next_label.is_some() {
            if self.tag_writer.is_none() {
                return Err(DdffError::ReadOnly);
            }
            let Some((label, aux)) = self.next_label.take() else {
                return Ok(());
            };
            let handler = self.files.handler_mut();
            handler.process_writes()?;
            handler.reset_stretch_marks();
            self.tracker.borrow_mut().start();
            for recorder in &self.recorders {
                recorder.borrow_mut().start_stretch(tick);
            }
            self.files.sync_inventory()?;
            debug!("stretch {} ({}) starts at tick {}", self.tags.len(), label, tick);
            self.current = Some(Tag {
                cycle: self.tags.len() as u32,
                index0: tick,
                index1: TimeTick::MAX,
                time: wall_time
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                label,
                aux,
                ..Tag::default()
            });
        }
        self.window = (tick, TimeTick::MAX);
        Ok(())
    }

    /// Close the recording window at `tick`.
    pub fn stop_stretch(&mut self, tick: TimeTick) {
        self.window.1 = tick;
        if let Some(current) = self.current.as_mut() {
            current.index1 = tick;
        }
    }

    /// Finish the pending stretch once every recorder has written up to
    /// `tick`. Returns false if some recorder is behind; call again later.
    /// Returns true at once when no stretch is pending.
    pub fn complete_stretch(&mut self, tick: TimeTick) -> Result<bool> {
        if self.current.is_none() {
            return Ok(true);
        }
        if self.recorders.iter().any(|r| !r.borrow().complete_to(tick)) {
            return Ok(false);
        }
        let handler = self.files.handler_mut();
        for recorder in &self.recorders {
            recorder.borrow_mut().sync(handler)?;
        }
        handler.sync_to_file(true)?;

        let Some(mut tag) = self.current.take() else {
            return Ok(true);
        };
        {
            let tracker = self.tracker.borrow();
            for recorder in &self.recorders {
                let recorder = recorder.borrow();
                let stream_id = recorder.stream_id();
                match tracker.entry(stream_id) {
                    Some((offset, inblock)) => {
                        tag.offset.push(offset as i64);
                        tag.inblock_offset.push(inblock);
                    }
                    None if recorder.is_clean() => {
                        tag.offset.push(0);
                        tag.inblock_offset.push(0);
                    }
                    None => return Err(DdffError::IndexInconsistent(stream_id)),
                }
            }
        }
        self.tracker.borrow_mut().stop();
        if tag.index1 == TimeTick::MAX {
            tag.index1 = tick;
        }

        let writer = self.tag_writer.ok_or(DdffError::ReadOnly)?;
        let bytes = tag.to_bytes()?;
        handler.mark_item_start(writer)?;
        handler.write(writer, &bytes)?;
        handler.close_off(writer, true)?;
        handler.process_writes()?;
        debug!("stretch {} ({}) complete at tick {}", tag.cycle, tag.label, tick);
        self.tag_lookup.insert(tag.label.clone(), tag.cycle);
        self.tags.push(tag);
        Ok(true)
    }

    /// Position every recorder's reader on its data of stretch `cycle`.
    pub fn spool_for_replay(&mut self, cycle: u32) -> Result<()> {
        let tag = self
            .tags
            .get(cycle as usize)
            .ok_or(DdffError::SegmentNotFound(cycle))?;
        if tag.offset.len() != self.recorders.len() {
            return Err(DdffError::TagRecorderMismatch {
                cycle,
                offsets: tag.offset.len(),
                recorders: self.recorders.len(),
            });
        }
        let handler = self.files.handler_mut();
        for (i, recorder) in self.recorders.iter().enumerate() {
            let (start, end) = stretch_range(&self.tags, cycle as usize, i);
            debug!("replay stretch {}, stream {}: [{}, {})", cycle, recorder.borrow().stream_id(), start, end);
            recorder.borrow_mut().spool(handler, start, end)?;
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.files.close()
    }
}

/// File range of recorder `i`'s data in stretch `idx`: from its first item to
/// the start of its data in the next stretch that has any, or open-ended.
/// A recorder that wrote nothing gets an empty range.
fn stretch_range(tags: &[Tag], idx: usize, i: usize) -> (u64, u64) {
    let Some(start) = tags[idx].start_of(i) else {
        return (0, 0);
    };
    let end = tags[idx + 1..]
        .iter()
        .find_map(|t| t.start_of(i))
        .unwrap_or(OPEN_END);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(offsets: &[(i64, u32)]) -> Tag {
        Tag {
            offset: offsets.iter().map(|o| o.0).collect(),
            inblock_offset: offsets.iter().map(|o| o.1).collect(),
            ..Tag::default()
        }
    }

    #[test]
    fn test_tag_record_layout() {
        let t = Tag {
            offset: vec![64],
            inblock_offset: vec![28],
            cycle: 2,
            index0: 10,
            index1: 20,
            time: 1_700_000_000,
            label: "run".into(),
            aux: String::new(),
        };
        let bytes = t.to_bytes().unwrap();
        assert_eq!(bytes.len(), 4 + 8 + 4 + 4 * 3 + 8 + 2 + 3 + 2);
        let mut src: &[u8] = &bytes;
        assert_eq!(Tag::unpack(&mut src).unwrap(), t);
    }

    #[test]
    fn test_stretch_range_bounds() {
        let tags = vec![tag(&[(0, 28), (64, 40)]), tag(&[(0, 0), (128, 30)]), tag(&[(192, 28), (0, 0)])];
        // next stretch without data for the stream is skipped
        assert_eq!(stretch_range(&tags, 0, 0), (28, 220));
        assert_eq!(stretch_range(&tags, 0, 1), (104, 158));
        assert_eq!(stretch_range(&tags, 1, 0), (0, 0));
        assert_eq!(stretch_range(&tags, 2, 0), (220, OPEN_END));
    }

    #[test]
    fn test_tracker_records_once_per_stretch() {
        let mut tracker = StretchTracker::default();
        let mut buf = MessageBuffer::new(64);
        buf.start_block(2);
        buf.stretch_offset = 40;
        tracker.block_written(0, &buf);
        assert_eq!(tracker.entry(2), None, "inactive tracker records nothing");

        tracker.start();
        tracker.block_written(64, &buf);
        tracker.block_written(128, &buf);
        assert_eq!(tracker.entry(2), Some((64, 40)));

        buf.stream_id = 0;
        tracker.block_written(192, &buf);
        assert_eq!(tracker.entry(0), None);
    }
}
