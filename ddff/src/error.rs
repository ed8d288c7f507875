use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DdffError>;

/// Errors raised by the DDFF storage layers.
///
/// Format errors (checksums, stream ids, block numbering) are fatal for the
/// operation that detected them. Usage errors indicate a programming mistake
/// by the caller. Configuration errors (open mode, lookups) can be handled by
/// the caller.
#[derive(Debug, Error)]
pub enum DdffError {
    // -- format ------------------------------------------------------------
    #[error("buffer of {capacity} bytes too small for block of {block_size} bytes")]
    BufferTooSmall { capacity: usize, block_size: u32 },

    #[error("block checksum mismatch at offset {offset} (fill {fill}): stored {stored:04x}, computed {computed:04x}")]
    BlockCrc {
        offset: u64,
        fill: u32,
        stored: u16,
        computed: u16,
    },

    #[error("block at offset {offset} belongs to stream {found}, expected stream {expected}")]
    StreamIdMismatch { offset: u64, expected: u16, found: u16 },

    #[error("first block of stream {stream_id} at offset {offset} has block number {block_num}")]
    FirstBlock {
        stream_id: u16,
        offset: u64,
        block_num: u32,
    },

    #[error("stream {stream_id} uses block size {expected}, found {found}")]
    BlockSizeMismatch {
        stream_id: u16,
        expected: u32,
        found: u32,
    },

    #[error("tag {cycle} records {offsets} streams but {recorders} recorders are registered")]
    TagRecorderMismatch {
        cycle: u32,
        offsets: usize,
        recorders: usize,
    },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("stream {0} ended inside a record")]
    UnexpectedEnd(u16),

    // -- usage -------------------------------------------------------------
    #[error("stream {0} has no current buffer to write into")]
    NoCurrentBuffer(u16),

    #[error("stream {0} is already initialized")]
    AlreadyInitialized(u16),

    #[error("stream {0} already has a reader")]
    ReaderExists(u16),

    #[error("stream {0} already has a writer")]
    WriterExists(u16),

    #[error("stream {0} already has a partial block waiting to be rewritten")]
    RewriteOffsetSet(u16),

    #[error("no such stream handle: {0}")]
    UnknownStream(u16),

    #[error("invalid block size {0}")]
    InvalidBlockSize(u32),

    #[error("stream {0} has no buffered data and forced loads are disabled")]
    LoadsPending(u16),

    // -- configuration -----------------------------------------------------
    #[error("file already exists: {0}")]
    FileExists(PathBuf),

    #[error("file not found: {0}")]
    FileMissing(PathBuf),

    #[error("file is opened read-only")]
    ReadOnly,

    #[error("file is locked: {0}")]
    Locked(String),

    #[error("inventory entry already in use: {0}")]
    EntryExists(String),

    #[error("inventory entry not found: {0}")]
    EntryNotFound(String),

    #[error("segment {0} not found")]
    SegmentNotFound(u32),

    // -- integrity ---------------------------------------------------------
    #[error("stream {0} recorded data in this stretch but no start offset was captured")]
    IndexInconsistent(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
