//! Byte sinks and sources over streams, and the fixed-width big-endian
//! packing used by the inventory and tag records.

use crate::error::{DdffError, Result};
use crate::file_handler::{FileHandler, ReadHandle, WriteHandle};

/// Destination for packed bytes.
pub trait ByteSink {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    fn put_i64(&mut self, v: i64) -> Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    /// `u16` length followed by the UTF-8 bytes.
    fn put_str(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| DdffError::MalformedRecord(format!("string of {} bytes too long", s.len())))?;
        self.put_u16(len)?;
        self.put_bytes(s.as_bytes())
    }
}

/// Sequential source of packed bytes.
pub trait ByteSource {
    /// Fill `out` completely or fail.
    fn take_bytes(&mut self, out: &mut [u8]) -> Result<()>;

    fn take_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.take_bytes(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.take_bytes(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn take_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.take_bytes(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn take_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.take_bytes(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    fn take_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; len];
        self.take_bytes(&mut v)?;
        Ok(v)
    }

    fn take_str(&mut self) -> Result<String> {
        let len = self.take_u16()? as usize;
        let bytes = self.take_vec(len)?;
        String::from_utf8(bytes).map_err(|e| DdffError::MalformedRecord(e.to_string()))
    }
}

/// A value with a fixed on-disk layout.
pub trait Record: Sized {
    fn pack<S: ByteSink>(&self, sink: &mut S) -> Result<()>;
    fn unpack<S: ByteSource>(source: &mut S) -> Result<Self>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.pack(&mut out)?;
        Ok(out)
    }
}

impl ByteSink for Vec<u8> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl ByteSource for &[u8] {
    fn take_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        if self.len() < out.len() {
            return Err(DdffError::MalformedRecord(format!(
                "needed {} bytes, {} left",
                out.len(),
                self.len()
            )));
        }
        let (head, tail) = self.split_at(out.len());
        out.copy_from_slice(head);
        *self = tail;
        Ok(())
    }
}

/// Writes into a stream through its file handler.
pub struct WriteCursor<'a> {
    handler: &'a mut FileHandler,
    handle: WriteHandle,
}

impl<'a> WriteCursor<'a> {
    pub fn new(handler: &'a mut FileHandler, handle: WriteHandle) -> Self {
        WriteCursor { handler, handle }
    }

    pub fn mark_item_start(&mut self) -> Result<bool> {
        self.handler.mark_item_start(self.handle)
    }
}

impl ByteSink for WriteCursor<'_> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.handler.write(self.handle, bytes)
    }
}

/// Reads a stream sequentially through its file handler.
pub struct ReadCursor<'a> {
    handler: &'a mut FileHandler,
    handle: ReadHandle,
    force: bool,
}

impl<'a> ReadCursor<'a> {
    pub(crate) fn new(handler: &'a mut FileHandler, handle: ReadHandle, force: bool) -> Self {
        ReadCursor { handler, handle, force }
    }

    pub fn at_end(&self) -> Result<bool> {
        self.handler.at_end(self.handle)
    }

    /// Read the next record, or `None` at the end of the stream.
    pub fn next_record<R: Record>(&mut self) -> Result<Option<R>> {
        if self.at_end()? {
            return Ok(None);
        }
        R::unpack(self).map(Some)
    }
}

impl ByteSource for ReadCursor<'_> {
    fn take_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let n = self.handler.read_with(self.handle, out, self.force)?;
        if n < out.len() {
            return Err(DdffError::UnexpectedEnd(self.handle.stream_id()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        name: String,
        value: i64,
    }

    impl Record for Pair {
        fn pack<S: ByteSink>(&self, sink: &mut S) -> Result<()> {
            sink.put_str(&self.name)?;
            sink.put_i64(self.value)
        }

        fn unpack<S: ByteSource>(source: &mut S) -> Result<Self> {
            Ok(Pair {
                name: source.take_str()?,
                value: source.take_i64()?,
            })
        }
    }

    #[test]
    fn test_big_endian_layout() {
        let mut out = Vec::new();
        out.put_u16(0x0102).unwrap();
        out.put_u32(7).unwrap();
        out.put_str("ab").unwrap();
        assert_eq!(out, vec![1, 2, 0, 0, 0, 7, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_record_from_slice() {
        let bytes = Pair {
            name: "speed".into(),
            value: -3,
        }
        .to_bytes()
        .unwrap();
        let mut src: &[u8] = &bytes;
        let back = Pair::unpack(&mut src).unwrap();
        assert_eq!(back.name, "speed");
        assert_eq!(back.value, -3);
        assert!(src.is_empty());
    }

    #[test]
    fn test_short_input_is_malformed() {
        let mut src: &[u8] = &[0, 5, b'a'];
        assert!(matches!(src.take_str(), Err(DdffError::MalformedRecord(_))));
    }
}
