mod block_header;
mod buffer_pool;
mod error;
mod file_handler;
mod inventory;
mod message_buffer;
mod record;
mod recorder;
mod registry;
mod segments;
mod stream_reader;
mod stream_writer;
mod work_queue;

pub use block_header::{BlockHeader, CHECKSUM_START, HEADER_SIZE, NEXT_LAST, checksum};
pub use buffer_pool::{BufferList, BufferPool, DEFAULT_SPARE_BUFFERS};
pub use error::{DdffError, Result};
pub use file_handler::{
    DEFAULT_BLOCK_SIZE, FileHandler, FileOptions, IoScheduler, OpenMode, ReadHandle, StreamInfo, WriteHandle,
    WriteObserver,
};
pub use inventory::{FIRST_DATA_STREAM, FileWithInventory, INVENTORY_STREAM, InventoryEntry, TAG_STREAM};
pub use message_buffer::MessageBuffer;
pub use record::{ByteSink, ByteSource, ReadCursor, Record, WriteCursor};
pub use recorder::{StreamRecorder, StretchRecorder, TimedItem};
pub use registry::{FilerRegistry, SharedFiler};
pub use segments::{FileWithSegments, StretchTracker, Tag, TimeTick};
pub use stream_reader::{FileStreamRead, OPEN_END, PreloadLimits};
pub use stream_writer::FileStreamWrite;
pub use work_queue::{DEFAULT_QUEUE_SOFT_LIMIT, LoadJob, WorkQueue, WriteJob};
