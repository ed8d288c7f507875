use std::io::{self, Write};
use std::time::{Duration, UNIX_EPOCH};

use ddff::DdffError;

use crate::error::{CliError, CliResult};
use crate::helpers::{expect_args, open_inventory, open_segments};

pub fn cmd_ls(args: &[String]) -> CliResult {
    expect_args(args, 1, "ddff ls <ddff-file>")?;

    let inv = open_inventory(&args[0])?;
    for entry in inv.entries() {
        let blocks = inv
            .handler()
            .stream_info(entry.id)
            .map_or(0, |info| info.blocks.len());
        println!(
            "{:>6}  {:<24}  {:>6} blocks  {}",
            entry.id, entry.key, blocks, entry.label
        );
    }
    Ok(())
}

pub fn cmd_tags(args: &[String]) -> CliResult {
    expect_args(args, 1, "ddff tags <ddff-file>")?;

    let seg = open_segments(&args[0])?;
    for tag in seg.segments() {
        let started = UNIX_EPOCH + Duration::from_secs(tag.time);
        let age = started.elapsed().map(|d| d.as_secs()).unwrap_or(0);
        let streams = tag.inblock_offset.iter().filter(|o| **o != 0).count();
        println!(
            "{:>4}  {:<20}  ticks {}..{}  {} of {} streams  {}s ago  {}",
            tag.cycle,
            tag.label,
            tag.index0,
            tag.index1,
            streams,
            tag.offset.len(),
            age,
            tag.aux
        );
    }
    Ok(())
}

pub fn cmd_cat(args: &[String]) -> CliResult {
    expect_args(args, 2, "ddff cat <ddff-file> <key>")?;

    let key = &args[1];
    let mut inv = open_inventory(&args[0])?;
    let handle = inv.find_named_read(key, false).map_err(|e| match e {
        DdffError::EntryNotFound(_) => CliError::UnknownKey(key.clone()),
        e => CliError::Ddff(e),
    })?;

    let fh = inv.handler_mut();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = fh.read(handle, &mut chunk)?;
        out.write_all(&chunk[..n])?;
        if n < chunk.len() {
            break;
        }
    }
    out.flush()?;
    Ok(())
}
