//! Bad block listing command

use pageprog_host::NullSink;

use crate::cli::ChipArgs;
use crate::commands::{configure, Client};

/// Run the bad-blocks command
pub fn run_badblocks(
    client: &mut Client,
    chip: &ChipArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    configure(client, chip)?;

    let blocks = client.read_bad_blocks(&mut NullSink)?;
    if blocks.is_empty() {
        println!("No bad blocks");
        return Ok(());
    }

    println!("{} bad block(s):", blocks.len());
    for block in &blocks {
        println!("  0x{:08X} ({} bytes)", block.addr, block.size);
    }

    Ok(())
}
