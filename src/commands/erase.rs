//! Erase command implementation

use crate::cli::{ChipArgs, RangeArgs};
use crate::commands::{configure, BarSink, Client};

/// Run the erase command
pub fn run_erase(
    client: &mut Client,
    chip: &ChipArgs,
    range: &RangeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    configure(client, chip)?;
    let span = range.span(&chip.geometry());

    log::info!(
        "Erasing 0x{:X} bytes from 0x{:08X} (flags {:?})",
        span.len,
        span.addr,
        span.flags
    );

    let mut sink = BarSink::new(span.len as u64)?;
    client.erase(span, &mut sink)?;
    sink.finish("Erase complete");

    Ok(())
}
