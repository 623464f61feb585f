//! Flash HAL contract
//!
//! The dispatcher is hardware-agnostic: it drives whatever chip family
//! (parallel NAND, SPI NAND, SPI NOR) sits behind this trait and
//! interprets only the normalized status enum. The HAL-specific part of
//! the configure payload is forwarded verbatim; only the dispatcher-level
//! geometry is interpreted here.

use pageprog_proto::{ChipGeometry, ErrorCode, CHIP_ID_LEN};

/// Chip identification bytes as returned by read-id
pub type ChipId = [u8; CHIP_ID_LEN];

/// Normalized flash operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    /// Operation finished successfully / chip is idle
    Ready,
    /// Program operation still in progress
    Busy,
    /// Chip reported a failure for this unit
    Error,
    /// Chip stopped responding
    Timeout,
    /// The HAL cannot perform this operation
    InvalidCmd,
}

/// Flash hardware abstraction consumed by the dispatcher
///
/// Pages are addressed by spare-exclusive page index. Spare-inclusive
/// operations pass `include_spare = true` and size their buffers to the
/// effective page size.
pub trait FlashHal {
    /// Initialize the bus for a chip. `hal_config` is the opaque
    /// HAL-specific tail of the configure command (timings, command
    /// bytes, address-cycle counts), forwarded verbatim from the host.
    fn init(&mut self, geometry: &ChipGeometry, hal_config: &[u8]) -> Result<(), ErrorCode>;

    /// Read the chip identification bytes
    fn read_id(&mut self) -> ChipId;

    /// Erase the block containing `page`. Returns the final status.
    fn erase_block(&mut self, page: u32) -> FlashStatus;

    /// Read one page into `buf` (sized to the effective page size)
    fn read_page(&mut self, page: u32, buf: &mut [u8], include_spare: bool) -> FlashStatus;

    /// Start programming one page and return without waiting.
    ///
    /// The data is clocked into the chip's page register before this
    /// returns; the program operation itself completes asynchronously
    /// and is observed through [`read_status`](Self::read_status).
    fn write_page_async(&mut self, page: u32, data: &[u8], include_spare: bool);

    /// Poll the status of the outstanding program operation
    fn read_status(&mut self) -> FlashStatus;

    /// Whether the chip exposes spare-area bad-block marks to scan
    fn supports_bad_block_scan(&self) -> bool;
}
