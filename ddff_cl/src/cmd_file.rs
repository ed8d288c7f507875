use ddff::HEADER_SIZE;

use crate::error::{CliError, CliResult};
use crate::helpers::{expect_args, fmt_offset, open_inventory, stream_role};

pub fn cmd_info(args: &[String]) -> CliResult {
    expect_args(args, 1, "ddff info <ddff-file>")?;

    let inv = open_inventory(&args[0])?;
    let fh = inv.handler();
    println!("File:        {}", fh.path().display());
    println!("Data end:    {} bytes", fh.end_offset());
    println!("Streams:     {}", fh.stream_ids().len());
    println!();
    println!(
        "{:>6}  {:<20}  {:>10}  {:>7}  {:>12}  {:>12}  {:>12}",
        "id", "name", "block size", "blocks", "capacity", "first", "last"
    );
    for id in fh.stream_ids() {
        let Some(info) = fh.stream_info(id) else {
            continue;
        };
        let block_size = info.block_size.unwrap_or(0) as u64;
        let capacity = info.blocks.len() as u64 * block_size.saturating_sub(HEADER_SIZE as u64);
        println!(
            "{:>6}  {:<20}  {:>10}  {:>7}  {:>12}  {:>12}  {:>12}",
            id,
            stream_role(id, Some(&inv)),
            block_size,
            info.blocks.len(),
            capacity,
            fmt_offset(info.first),
            fmt_offset(info.last)
        );
    }
    Ok(())
}

pub fn cmd_verify(args: &[String]) -> CliResult {
    expect_args(args, 1, "ddff verify <ddff-file>")?;

    let mut fh = crate::helpers::open_handler(&args[0])?;
    let issues = fh.verify()?;
    if issues.is_empty() {
        println!("OK: {} streams verified", fh.stream_ids().len());
        return Ok(());
    }
    for issue in &issues {
        println!("{}", issue);
    }
    Err(CliError::Corrupt {
        path: args[0].clone(),
        problems: issues.len(),
    })
}
