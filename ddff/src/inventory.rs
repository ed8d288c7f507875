use std::path::Path;

use log::debug;

use crate::error::{DdffError, Result};
use crate::file_handler::{FileHandler, FileOptions, OpenMode, ReadHandle, WriteHandle};
use crate::record::{ByteSink, ByteSource, Record};

/// Stream holding the inventory records.
pub const INVENTORY_STREAM: u16 = 0;
/// Stream holding the tag records of the segment layer.
pub const TAG_STREAM: u16 = 1;
/// First id handed out to named data streams.
pub const FIRST_DATA_STREAM: u16 = 2;

/// One inventory record: a named data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub key: String,
    pub id: u16,
    pub label: String,
}

impl Record for InventoryEntry {
    fn pack<S: ByteSink>(&self, sink: &mut S) -> Result<()> {
        sink.put_str(&self.key)?;
        sink.put_u16(self.id)?;
        sink.put_str(&self.label)
    }

    fn unpack<S: ByteSource>(source: &mut S) -> Result<Self> {
        Ok(InventoryEntry {
            key: source.take_str()?,
            id: source.take_u16()?,
            label: source.take_str()?,
        })
    }
}

/// A file handler with a name directory for its data streams, kept in
/// stream 0.
#[derive(Debug)]
pub struct FileWithInventory {
    handler: FileHandler,
    entries: Vec<InventoryEntry>,
    /// Writer of stream 0; absent for read-only files.
    inventory: Option<WriteHandle>,
    dirty: bool,
}

impl FileWithInventory {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, block_size: u32) -> Result<Self> {
        let options = FileOptions {
            block_size,
            ..FileOptions::default()
        };
        Self::open_with(path, mode, options)
    }

    /// Open the file and load all inventory entries.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, options: FileOptions) -> Result<Self> {
        let mut handler = FileHandler::open_with(path, mode, options)?;
        let entries = if handler.stream_info(INVENTORY_STREAM).is_some() {
            read_records(&mut handler, INVENTORY_STREAM)?
        } else {
            Vec::new()
        };
        let inventory = if mode.is_writable() {
            Some(handler.create_write(INVENTORY_STREAM, None)?)
        } else {
            None
        };
        debug!("{}: {} inventory entries", handler.path().display(), entries.len());
        Ok(FileWithInventory {
            handler,
            entries,
            inventory,
            dirty: false,
        })
    }

    pub fn handler(&self) -> &FileHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut FileHandler {
        &mut self.handler
    }

    pub fn entries(&self) -> &[InventoryEntry] {
        &self.entries
    }

    pub fn find(&self, key: &str) -> Option<&InventoryEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Open the stream named `key` for writing, registering it if the key is new.
    pub fn create_named_write(&mut self, key: &str, label: &str, block_size: Option<u32>) -> Result<WriteHandle> {
        if let Some(entry) = self.find(key) {
            let id = entry.id;
            if self.handler.has_writer(id) {
                return Err(DdffError::EntryExists(key.to_string()));
            }
            return self.handler.create_write(id, block_size);
        }

        let inventory = self.inventory.ok_or(DdffError::ReadOnly)?;
        let id = self.next_stream_id()?;
        let entry = InventoryEntry {
            key: key.to_string(),
            id,
            label: label.to_string(),
        };
        let handle = self.handler.create_write(id, block_size)?;
        let bytes = entry.to_bytes()?;
        self.handler.mark_item_start(inventory)?;
        self.handler.write(inventory, &bytes)?;
        debug!("inventory: {} -> stream {}", key, id);
        self.entries.push(entry);
        self.dirty = true;
        Ok(handle)
    }

    fn next_stream_id(&self) -> Result<u16> {
        let after_entries = self.entries.iter().map(|e| e.id as usize + 1).max().unwrap_or(0);
        let id = self
            .handler
            .stream_count()
            .max(after_entries)
            .max(FIRST_DATA_STREAM as usize);
        u16::try_from(id).map_err(|_| DdffError::MalformedRecord("stream ids exhausted".to_string()))
    }

    /// Open the stream named `key` for reading.
    pub fn find_named_read(&mut self, key: &str, slice_indexed: bool) -> Result<ReadHandle> {
        let id = self
            .find(key)
            .map(|e| e.id)
            .ok_or_else(|| DdffError::EntryNotFound(key.to_string()))?;
        self.handler.create_read(id, slice_indexed)
    }

    /// Flush new inventory entries to disk. Returns whether anything was written.
    pub fn sync_inventory(&mut self) -> Result<bool> {
        let Some(inventory) = self.inventory else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        self.handler.close_off(inventory, true)?;
        self.handler.process_writes()?;
        self.dirty = false;
        Ok(true)
    }

    pub fn close(self) -> Result<()> {
        self.handler.close()
    }
}

/// Read every record of a reserved stream, then detach the reader.
pub(crate) fn read_records<R: Record>(handler: &mut FileHandler, stream_id: u16) -> Result<Vec<R>> {
    let reader = handler.create_read(stream_id, false)?;
    let mut records = Vec::new();
    let result = {
        let mut cursor = handler.scan_cursor(reader);
        loop {
            match cursor.next_record::<R>() {
                Ok(Some(r)) => records.push(r),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        }
    };
    handler.release_read(reader)?;
    result.map(|_| records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ids_start_after_reserved_streams() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inv.ddff");
        let mut inv = FileWithInventory::open(&path, OpenMode::New, 64).unwrap();
        let a = inv.create_named_write("a", "first", None).unwrap();
        let b = inv.create_named_write("b", "second", None).unwrap();
        assert_eq!(a.stream_id(), 2);
        assert_eq!(b.stream_id(), 3);
        assert!(inv.is_dirty());
        assert!(inv.sync_inventory().unwrap());
        assert!(!inv.sync_inventory().unwrap());
    }

    #[test]
    fn test_claimed_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("claim.ddff");
        let mut inv = FileWithInventory::open(&path, OpenMode::New, 64).unwrap();
        inv.create_named_write("a", "", None).unwrap();
        assert!(matches!(
            inv.create_named_write("a", "", None),
            Err(DdffError::EntryExists(_))
        ));
        assert!(matches!(
            inv.find_named_read("missing", false),
            Err(DdffError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.ddff");
        let mut inv = FileWithInventory::open(&path, OpenMode::New, 64).unwrap();
        // enough entries to span several inventory blocks
        for i in 0..10 {
            inv.create_named_write(&format!("stream-{}", i), "label", None).unwrap();
        }
        inv.close().unwrap();

        let inv = FileWithInventory::open(&path, OpenMode::Read, 64).unwrap();
        let keys: Vec<_> = inv.entries().iter().map(|e| e.key.clone()).collect();
        let expected: Vec<_> = (0..10).map(|i| format!("stream-{}", i)).collect();
        assert_eq!(keys, expected);
        assert_eq!(inv.find("stream-3").unwrap().id, 5);
    }
}
