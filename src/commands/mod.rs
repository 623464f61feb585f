//! Command implementations

pub mod badblocks;
pub mod erase;
pub mod firmware;
pub mod probe;
pub mod read;
pub mod write;

use indicatif::{ProgressBar, ProgressStyle};
use pageprog_host::device::EventSink;
use pageprog_host::Transport;
use pageprog_host::{Programmer, Result};
use pageprog_proto::{ChipGeometry, OpFlags, Span};

use crate::cli::{ChipArgs, RangeArgs};

/// The client type all commands operate on
pub type Client = Programmer<Box<dyn Transport>>;

impl ChipArgs {
    /// Chip geometry from the command line
    pub fn geometry(&self) -> ChipGeometry {
        ChipGeometry {
            page_size: self.page_size,
            block_size: self.block_size,
            total_size: self.total_size,
            spare_size: self.spare_size,
            bad_block_mark_offset: self.mark_offset,
        }
    }
}

/// Configure the chip from the CLI geometry options
pub fn configure(client: &mut Client, chip: &ChipArgs) -> Result<()> {
    client.configure(chip.geometry(), &chip.hal_config)
}

impl RangeArgs {
    /// Operation flags from the range options
    pub fn flags(&self) -> OpFlags {
        let mut flags = OpFlags::empty();
        if self.skip_bad {
            flags |= OpFlags::SKIP_BAD_BLOCK;
        }
        if self.include_spare {
            flags |= OpFlags::INCLUDE_SPARE;
        }
        flags
    }

    /// The addressed span, defaulting to the rest of the chip
    pub fn span(&self, geometry: &ChipGeometry) -> Span {
        let total = geometry.effective_total_size(self.include_spare);
        Span {
            addr: self.start,
            len: self
                .length
                .unwrap_or_else(|| total.saturating_sub(self.start)),
            flags: self.flags(),
        }
    }
}

/// Progress bar that renders device notifications
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    /// Create a bar for an operation expected to cover `total` bytes
    pub fn new(total: u64) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }

    /// Finish the bar with a closing message
    pub fn finish(&self, msg: &'static str) {
        self.bar.finish_with_message(msg);
    }
}

impl EventSink for BarSink {
    fn on_progress(&mut self, bytes_done: u64, bytes_total: u64) {
        // skipped blocks may shrink the total mid-operation
        self.bar.set_length(bytes_total);
        self.bar.set_position(bytes_done);
    }

    fn on_bad_block(&mut self, addr: u32, size: u32) {
        self.bar.println(format!(
            "bad block at 0x{:08X} ({} bytes), remapped",
            addr, size
        ));
    }

    fn on_bad_block_skipped(&mut self, addr: u32, size: u32) {
        self.bar
            .println(format!("skipping bad block at 0x{:08X} ({} bytes)", addr, size));
    }
}
