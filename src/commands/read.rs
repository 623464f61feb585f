//! Read command implementation

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::cli::{ChipArgs, RangeArgs};
use crate::commands::{configure, BarSink, Client};

/// Run the read command
pub fn run_read(
    client: &mut Client,
    output: &Path,
    chip: &ChipArgs,
    range: &RangeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    configure(client, chip)?;
    let span = range.span(&chip.geometry());

    log::info!(
        "Reading 0x{:X} bytes from 0x{:08X} (flags {:?})",
        span.len,
        span.addr,
        span.flags
    );

    let mut sink = BarSink::new(span.len as u64)?;
    let data = client.read(span, &mut sink)?;
    sink.finish("Read complete");

    let mut file = File::create(output)?;
    file.write_all(&data)?;

    println!("Wrote {} bytes to {:?}", data.len(), output);

    Ok(())
}
