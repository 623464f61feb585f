//! Bad block table
//!
//! Bounded append-only set of bad blocks, rebuilt per chip session.
//! Entries are the first page index of each bad block. The capacity is
//! fixed: a chip producing more bad blocks than this is miswired or
//! unsupported, and the overflow is surfaced to the host rather than
//! dropped.

use heapless::Vec;
use pageprog_proto::ErrorCode;

/// Maximum number of bad blocks tracked per session
pub const BBT_CAPACITY: usize = 20;

/// Fixed-capacity bad block table
#[derive(Debug, Default)]
pub struct BadBlockTable {
    blocks: Vec<u32, BBT_CAPACITY>,
}

impl BadBlockTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all entries (chip reconfiguration)
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Record the block starting at `block_page` as bad.
    ///
    /// Idempotent for already-listed blocks. Fails with `BbtOverflow` at
    /// capacity without disturbing existing entries.
    pub fn add(&mut self, block_page: u32) -> Result<(), ErrorCode> {
        if self.contains(block_page) {
            return Ok(());
        }
        self.blocks
            .push(block_page)
            .map_err(|_| ErrorCode::BbtOverflow)
    }

    /// Whether the block starting at `block_page` is listed
    pub fn contains(&self, block_page: u32) -> bool {
        self.blocks.iter().any(|&b| b == block_page)
    }

    /// Number of listed blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Enumerate listed block start pages in insertion order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().copied()
    }
}
