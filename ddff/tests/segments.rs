use std::cell::RefCell;
use std::rc::Rc;
use std::time::SystemTime;

use ddff::{
    DdffError, FileHandler, FileWithSegments, OpenMode, Result, StreamRecorder, StretchRecorder, TimeTick, WriteHandle,
};
use log::info;
use tempfile::TempDir;

#[static_init::constructor(0)]
extern "C" fn _log_init() {
    log_init::init();
}

fn replay_ticks(rec: &Rc<RefCell<StreamRecorder>>, fh: &mut FileHandler) -> Vec<TimeTick> {
    let mut ticks = Vec::new();
    while let Some(item) = rec.borrow_mut().replay_next(fh).unwrap() {
        assert_eq!(item.payload, vec![item.tick as u8; 6]);
        ticks.push(item.tick);
    }
    ticks
}

fn record(seg: &mut FileWithSegments, rec: &Rc<RefCell<StreamRecorder>>, ticks: std::ops::Range<TimeTick>) {
    for t in ticks {
        rec.borrow_mut().record(seg.handler_mut(), t, &[t as u8; 6]).unwrap();
    }
}

#[test]
fn test_spool_repositions_every_recorder() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("seg.ddff");

    let mut seg = FileWithSegments::open(&path, OpenMode::New, 64).unwrap();
    let names = ["a", "b", "c"];
    let recs: Vec<_> = names
        .iter()
        .map(|n| Rc::new(RefCell::new(StreamRecorder::create(seg.inventory_mut(), n, "", None).unwrap())))
        .collect();
    for r in &recs {
        seg.register_recorder(r.clone());
    }

    // stretch 0: a and b record, c stays idle
    assert_eq!(seg.name_recording("run", ""), "run");
    seg.start_stretch(0, SystemTime::now()).unwrap();
    assert!(seg.is_recording(3));
    record(&mut seg, &recs[0], 0..5);
    record(&mut seg, &recs[1], 0..5);
    assert!(!seg.complete_stretch(4).unwrap(), "c has not caught up yet");
    recs[2].borrow_mut().mark_until(4);
    assert!(seg.complete_stretch(4).unwrap());
    assert!(seg.complete_stretch(4).unwrap(), "nothing pending");

    // stretch 1: a and c record, b stays idle
    assert_eq!(seg.name_recording("run", "second"), "run_2");
    seg.start_stretch(10, SystemTime::now()).unwrap();
    record(&mut seg, &recs[0], 10..14);
    record(&mut seg, &recs[2], 10..14);
    recs[1].borrow_mut().mark_until(13);
    assert!(seg.complete_stretch(13).unwrap());

    assert_eq!(seg.segments().len(), 2);
    seg.spool_for_replay(0).unwrap();
    let fh = seg.handler_mut();
    assert_eq!(replay_ticks(&recs[0], fh), vec![0, 1, 2, 3, 4]);
    assert_eq!(replay_ticks(&recs[1], fh), vec![0, 1, 2, 3, 4]);
    assert!(replay_ticks(&recs[2], fh).is_empty());

    seg.spool_for_replay(1).unwrap();
    let fh = seg.handler_mut();
    assert_eq!(replay_ticks(&recs[0], fh), vec![10, 11, 12, 13]);
    assert!(replay_ticks(&recs[1], fh).is_empty());
    assert_eq!(replay_ticks(&recs[2], fh), vec![10, 11, 12, 13]);

    assert!(matches!(seg.spool_for_replay(2), Err(DdffError::SegmentNotFound(2))));
    drop(recs);
    seg.close().unwrap();

    // replay from disk
    let mut seg = FileWithSegments::open(&path, OpenMode::Read, 64).unwrap();
    assert_eq!(seg.find_segment("run_2"), Some(1));
    assert_eq!(seg.segments()[1].aux, "second");
    assert_eq!(seg.segments()[0].index0, 0);
    assert_eq!(seg.segments()[1].index1, 13);

    let recs: Vec<_> = names
        .iter()
        .map(|n| Rc::new(RefCell::new(StreamRecorder::replay_only(seg.inventory_mut(), n).unwrap())))
        .collect();
    // tags of this file carry three offsets
    seg.register_recorder(recs[0].clone());
    assert!(matches!(
        seg.spool_for_replay(1),
        Err(DdffError::TagRecorderMismatch { offsets: 3, recorders: 1, .. })
    ));
    seg.register_recorder(recs[1].clone());
    seg.register_recorder(recs[2].clone());

    seg.spool_for_replay(1).unwrap();
    let fh = seg.handler_mut();
    assert_eq!(replay_ticks(&recs[0], fh), vec![10, 11, 12, 13]);
    assert_eq!(replay_ticks(&recs[2], fh), vec![10, 11, 12, 13]);
    seg.spool_for_replay(0).unwrap();
    let fh = seg.handler_mut();
    assert_eq!(replay_ticks(&recs[1], fh), vec![0, 1, 2, 3, 4]);
    info!("replayed {} segments", seg.segments().len());
}

#[test]
fn test_stretch_starting_mid_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mid.ddff");

    let mut seg = FileWithSegments::open(&path, OpenMode::New, 256).unwrap();
    let rec = Rc::new(RefCell::new(StreamRecorder::create(seg.inventory_mut(), "x", "", None).unwrap()));
    seg.register_recorder(rec.clone());

    // unnamed stretch: items are written but no tag results
    seg.start_stretch(0, SystemTime::now()).unwrap();
    record(&mut seg, &rec, 0..3);
    assert!(seg.complete_stretch(2).unwrap());
    assert!(seg.segments().is_empty());

    seg.name_recording("late", "");
    seg.start_stretch(3, SystemTime::now()).unwrap();
    record(&mut seg, &rec, 3..6);
    assert!(seg.complete_stretch(5).unwrap());
    seg.stop_stretch(6);
    assert!(!seg.is_recording(6));

    // all six items share the first block; replay begins at the stretch mark
    let tag = seg.segments()[0].clone();
    assert_eq!(tag.offset.len(), 1);
    assert!(tag.inblock_offset[0] as usize > ddff::HEADER_SIZE);
    seg.spool_for_replay(0).unwrap();
    assert_eq!(replay_ticks(&rec, seg.handler_mut()), vec![3, 4, 5]);
}

#[test]
fn test_read_only_file_cannot_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ro.ddff");
    FileWithSegments::open(&path, OpenMode::New, 64).unwrap().close().unwrap();

    let mut seg = FileWithSegments::open(&path, OpenMode::Read, 64).unwrap();
    seg.name_recording("x", "");
    assert!(matches!(
        seg.start_stretch(0, SystemTime::now()),
        Err(DdffError::ReadOnly)
    ));
}

/// Writes plain items and never marks where a stretch starts.
struct UnmarkedRecorder {
    write: WriteHandle,
}

impl StretchRecorder for UnmarkedRecorder {
    fn stream_id(&self) -> u16 {
        self.write.stream_id()
    }

    fn start_stretch(&mut self, _tick: TimeTick) {}

    fn complete_to(&self, _tick: TimeTick) -> bool {
        true
    }

    fn sync(&mut self, handler: &mut FileHandler) -> Result<()> {
        handler.close_off(self.write, true).map(|_| ())
    }

    fn is_clean(&self) -> bool {
        false
    }

    fn spool(&mut self, _handler: &mut FileHandler, _start: u64, _end: u64) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_dirty_recorder_without_entry_point() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("unmarked.ddff");

    let mut seg = FileWithSegments::open(&path, OpenMode::New, 64).unwrap();
    let write = seg.inventory_mut().create_named_write("raw", "", None).unwrap();
    assert_eq!(write.stream_id(), 2);
    seg.register_recorder(Rc::new(RefCell::new(UnmarkedRecorder { write })));

    seg.name_recording("run", "");
    seg.start_stretch(0, SystemTime::now()).unwrap();
    let fh = seg.handler_mut();
    fh.mark_item_start(write).unwrap();
    fh.write(write, b"no stretch mark").unwrap();
    assert!(matches!(seg.complete_stretch(1), Err(DdffError::IndexInconsistent(2))));
    assert!(seg.segments().is_empty());
}
