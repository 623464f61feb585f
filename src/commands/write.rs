//! Write command implementation

use std::fs;
use std::path::Path;

use pageprog_proto::Span;

use crate::cli::{ChipArgs, RangeArgs};
use crate::commands::{configure, BarSink, Client};

/// Run the write command
pub fn run_write(
    client: &mut Client,
    input: &Path,
    erase_first: bool,
    chip: &ChipArgs,
    range: &RangeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    configure(client, chip)?;
    let geometry = chip.geometry();

    let mut data = fs::read(input)?;
    println!("Read {} bytes from {:?}", data.len(), input);

    // pad the image up to the page grain with the erased-flash value
    let page = geometry.effective_page_size(range.include_spare) as usize;
    let padded = data.len().div_ceil(page) * page;
    if padded != data.len() {
        log::info!("Padding image from {} to {} bytes", data.len(), padded);
        data.resize(padded, 0xFF);
    }

    let len = match range.length {
        Some(len) if len as usize != data.len() => {
            return Err(format!(
                "--length 0x{:X} does not match the {} byte input image",
                len,
                data.len()
            )
            .into());
        }
        _ => data.len() as u32,
    };
    let span = Span {
        addr: range.start,
        len,
        flags: range.flags(),
    };

    if erase_first {
        let block = geometry.effective_block_size(range.include_spare);
        let erase_span = Span {
            addr: span.addr,
            len: span.len.div_ceil(block) * block,
            flags: span.flags,
        };
        log::info!(
            "Erasing 0x{:X} bytes from 0x{:08X} before writing",
            erase_span.len,
            erase_span.addr
        );
        let mut sink = BarSink::new(erase_span.len as u64)?;
        client.erase(erase_span, &mut sink)?;
        sink.finish("Erase complete");
    }

    log::info!(
        "Writing 0x{:X} bytes to 0x{:08X} (flags {:?})",
        span.len,
        span.addr,
        span.flags
    );

    let mut sink = BarSink::new(span.len as u64)?;
    let written = client.write(span, &data, &mut sink)?;
    sink.finish("Write complete");

    println!("Wrote {} bytes", written);

    Ok(())
}
