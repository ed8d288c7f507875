use ddff::{DEFAULT_BLOCK_SIZE, FileHandler, FileWithInventory, FileWithSegments, OpenMode};

use crate::error::CliError;

/// Validate that `args` has exactly `expected` elements.
pub fn expect_args(args: &[String], expected: usize, usage: &'static str) -> Result<(), CliError> {
    if args.len() != expected {
        Err(CliError::Usage(usage))
    } else {
        Ok(())
    }
}

fn open_error(path: &str, e: ddff::DdffError) -> CliError {
    CliError::Open {
        path: path.to_string(),
        source: e,
    }
}

/// Open a file read-only at the stream level.
pub fn open_handler(path: &str) -> Result<FileHandler, CliError> {
    FileHandler::open(path, OpenMode::Read, DEFAULT_BLOCK_SIZE).map_err(|e| open_error(path, e))
}

/// Open a file read-only with its inventory loaded.
pub fn open_inventory(path: &str) -> Result<FileWithInventory, CliError> {
    FileWithInventory::open(path, OpenMode::Read, DEFAULT_BLOCK_SIZE).map_err(|e| open_error(path, e))
}

/// Open a file read-only with inventory and segment directory loaded.
pub fn open_segments(path: &str) -> Result<FileWithSegments, CliError> {
    FileWithSegments::open(path, OpenMode::Read, DEFAULT_BLOCK_SIZE).map_err(|e| open_error(path, e))
}

/// Human-readable name of a stream id.
pub fn stream_role(id: u16, inventory: Option<&FileWithInventory>) -> String {
    match id {
        ddff::INVENTORY_STREAM => "(inventory)".to_string(),
        ddff::TAG_STREAM => "(tags)".to_string(),
        _ => inventory
            .and_then(|inv| inv.entries().iter().find(|e| e.id == id))
            .map(|e| e.key.clone())
            .unwrap_or_else(|| "-".to_string()),
    }
}

/// Format an optional file offset.
pub fn fmt_offset(offset: Option<u64>) -> String {
    offset.map_or_else(|| "-".to_string(), |o| o.to_string())
}
