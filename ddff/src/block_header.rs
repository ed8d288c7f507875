use crc::{CRC_16_IBM_3740, Crc};

use crate::error::{DdffError, Result};
use crate::message_buffer::MessageBuffer;

// Control block header layout (big-endian):
// | next_offset: i64 | checksum: u16 | stream_id: u16 | block_size: u32 |
// | block_fill: u32 | object_offset: u32 | block_num: u32 |
const NEXT_OFFSET_AT: usize = 0;
const CHECKSUM_AT: usize = 8;
const STREAM_ID_AT: usize = 10;
const BLOCK_SIZE_AT: usize = 12;
const BLOCK_FILL_AT: usize = 16;
const OBJECT_OFFSET_AT: usize = 20;
const BLOCK_NUM_AT: usize = 24;

/// Size of the control block header at the start of every block.
pub const HEADER_SIZE: usize = 28;

/// First byte covered by the checksum; `next_offset` and the checksum itself
/// are excluded so a block can be back-linked without rewriting it.
pub const CHECKSUM_START: usize = STREAM_ID_AT;

/// `next_offset` value of a block that has no successor (yet).
pub const NEXT_LAST: i64 = i64::MAX;

/// CRC-16/CCITT (polynomial 0x1021, initial value 0xFFFF, no reflection).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub next_offset: i64,
    pub checksum: u16,
    pub stream_id: u16,
    pub block_size: u32,
    pub block_fill: u32,
    pub object_offset: u32,
    pub block_num: u32,
}

impl BlockHeader {
    /// True if no successor block has been linked to this one.
    pub fn is_last(&self) -> bool {
        self.next_offset == NEXT_LAST
    }

    pub fn is_full(&self) -> bool {
        self.block_fill >= self.block_size
    }

    /// Location of the successor block, if linked.
    pub fn next(&self) -> Option<u64> {
        if self.next_offset == NEXT_LAST || self.next_offset <= 0 {
            None
        } else {
            Some(self.next_offset as u64)
        }
    }

    /// Parse a header from raw bytes. No checksum validation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DdffError::BufferTooSmall {
                capacity: bytes.len(),
                block_size: HEADER_SIZE as u32,
            });
        }
        Ok(BlockHeader {
            next_offset: i64::from_be_bytes(field(bytes, NEXT_OFFSET_AT)),
            checksum: u16::from_be_bytes(field(bytes, CHECKSUM_AT)),
            stream_id: u16::from_be_bytes(field(bytes, STREAM_ID_AT)),
            block_size: u32::from_be_bytes(field(bytes, BLOCK_SIZE_AT)),
            block_fill: u32::from_be_bytes(field(bytes, BLOCK_FILL_AT)),
            object_offset: u32::from_be_bytes(field(bytes, OBJECT_OFFSET_AT)),
            block_num: u32::from_be_bytes(field(bytes, BLOCK_NUM_AT)),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[NEXT_OFFSET_AT..CHECKSUM_AT].copy_from_slice(&self.next_offset.to_be_bytes());
        buf[CHECKSUM_AT..STREAM_ID_AT].copy_from_slice(&self.checksum.to_be_bytes());
        buf[STREAM_ID_AT..BLOCK_SIZE_AT].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[BLOCK_SIZE_AT..BLOCK_FILL_AT].copy_from_slice(&self.block_size.to_be_bytes());
        buf[BLOCK_FILL_AT..OBJECT_OFFSET_AT].copy_from_slice(&self.block_fill.to_be_bytes());
        buf[OBJECT_OFFSET_AT..BLOCK_NUM_AT].copy_from_slice(&self.object_offset.to_be_bytes());
        buf[BLOCK_NUM_AT..HEADER_SIZE].copy_from_slice(&self.block_num.to_be_bytes());
        buf
    }

    /// Check the stored checksum against a complete raw block image.
    /// `offset` is the block's file location, for diagnostics.
    pub fn verify(&self, block: &[u8], offset: u64) -> Result<()> {
        let size = self.block_size as usize;
        if block.len() < size || size < HEADER_SIZE {
            return Err(DdffError::BufferTooSmall {
                capacity: block.len(),
                block_size: self.block_size,
            });
        }
        let computed = checksum(&block[..size]);
        if computed != self.checksum {
            return Err(DdffError::BlockCrc {
                offset,
                fill: self.block_fill,
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }
}

fn field<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// CRC-16/CCITT over `[CHECKSUM_START, block.len())`.
pub fn checksum(block: &[u8]) -> u16 {
    CRC16.checksum(&block[CHECKSUM_START..])
}

/// Big-endian bytes of a `next_offset` field, for back-linking a block in place.
pub fn next_offset_bytes(next: u64) -> [u8; 8] {
    (next as i64).to_be_bytes()
}

/// Stamp the control block header into `buffer`.
///
/// `next_offset` is written as the "last" sentinel; the checksum covers the
/// whole capacity, so the unused tail must have been zeroed beforehand.
pub fn encode(buffer: &mut MessageBuffer, stream_id: u16, block_num: u32) -> BlockHeader {
    buffer.stream_id = stream_id;
    let mut header = BlockHeader {
        next_offset: NEXT_LAST,
        checksum: 0,
        stream_id,
        block_size: buffer.capacity() as u32,
        block_fill: buffer.fill as u32,
        object_offset: buffer.object_offset as u32,
        block_num,
    };
    buffer.bytes_mut()[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    header.checksum = checksum(buffer.bytes());
    buffer.bytes_mut()[CHECKSUM_AT..STREAM_ID_AT].copy_from_slice(&header.checksum.to_be_bytes());
    header
}

/// Decode the header of a block loaded into `buffer` from file location
/// `offset`, validate its checksum and copy fill, object offset and stream id
/// into the buffer's live metadata.
pub fn decode_buffer(buffer: &mut MessageBuffer, offset: u64) -> Result<BlockHeader> {
    let header = BlockHeader::decode(buffer.bytes())?;
    if buffer.capacity() < header.block_size as usize {
        return Err(DdffError::BufferTooSmall {
            capacity: buffer.capacity(),
            block_size: header.block_size,
        });
    }
    header.verify(buffer.bytes(), offset)?;
    buffer.fill = header.block_fill as usize;
    buffer.object_offset = header.object_offset as usize;
    buffer.stretch_offset = 0;
    buffer.stream_id = header.stream_id;
    Ok(header)
}
