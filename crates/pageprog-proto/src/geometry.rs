//! Chip geometry
//!
//! The host sends the full geometry in the configure command; the device
//! keeps one copy for the lifetime of the session. All addressed
//! operations are validated against the *effective* sizes, which include
//! the spare area when the operation requests it.

use crate::error::ErrorCode;

/// Flash chip geometry as carried by the configure command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipGeometry {
    /// Page size in bytes (smallest program/read unit), spare excluded
    pub page_size: u32,
    /// Block size in bytes (smallest erase unit), spare excluded
    pub block_size: u32,
    /// Total chip size in bytes, spare excluded
    pub total_size: u32,
    /// Out-of-band bytes per page
    pub spare_size: u32,
    /// Offset of the bad-block mark byte within the spare area
    pub bad_block_mark_offset: u8,
}

impl ChipGeometry {
    /// Validate internal consistency of the geometry
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.page_size == 0 || self.block_size == 0 || self.total_size == 0 {
            return Err(ErrorCode::LenInvalid);
        }
        if !self.block_size.is_multiple_of(self.page_size)
            || !self.total_size.is_multiple_of(self.block_size)
        {
            return Err(ErrorCode::LenInvalid);
        }
        if self.spare_size > 0 && u32::from(self.bad_block_mark_offset) >= self.spare_size {
            return Err(ErrorCode::LenInvalid);
        }
        Ok(())
    }

    /// Page size including the spare area when `include_spare` is set
    pub fn effective_page_size(&self, include_spare: bool) -> u32 {
        if include_spare {
            self.page_size + self.spare_size
        } else {
            self.page_size
        }
    }

    /// Block size including the spare area when `include_spare` is set
    pub fn effective_block_size(&self, include_spare: bool) -> u32 {
        self.effective_page_size(include_spare) * self.pages_per_block()
    }

    /// Total chip size including the spare area when `include_spare` is set
    pub fn effective_total_size(&self, include_spare: bool) -> u32 {
        self.effective_page_size(include_spare) * self.total_pages()
    }

    /// Number of pages in one erase block
    pub fn pages_per_block(&self) -> u32 {
        self.block_size / self.page_size
    }

    /// Number of pages on the whole chip
    pub fn total_pages(&self) -> u32 {
        self.total_size / self.page_size
    }

    /// Number of erase blocks on the whole chip
    pub fn total_blocks(&self) -> u32 {
        self.total_size / self.block_size
    }

    /// Page index for an effective-size byte address
    pub fn page_of_addr(&self, addr: u32, include_spare: bool) -> u32 {
        addr / self.effective_page_size(include_spare)
    }

    /// Effective-size byte address of a page
    pub fn addr_of_page(&self, page: u32, include_spare: bool) -> u32 {
        page * self.effective_page_size(include_spare)
    }

    /// First page index of the block containing `page`
    pub fn block_start_page(&self, page: u32) -> u32 {
        page - page % self.pages_per_block()
    }

    /// First page index of the block after the one containing `page`
    pub fn next_block_page(&self, page: u32) -> u32 {
        self.block_start_page(page) + self.pages_per_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> ChipGeometry {
        ChipGeometry {
            page_size: 2048,
            block_size: 131072,
            total_size: 268435456,
            spare_size: 64,
            bad_block_mark_offset: 0,
        }
    }

    #[test]
    fn effective_sizes() {
        let g = geom();
        assert_eq!(g.effective_page_size(false), 2048);
        assert_eq!(g.effective_page_size(true), 2112);
        assert_eq!(g.pages_per_block(), 64);
        assert_eq!(g.effective_block_size(true), 2112 * 64);
        assert_eq!(g.total_blocks(), 2048);
    }

    #[test]
    fn block_navigation() {
        let g = geom();
        assert_eq!(g.block_start_page(0), 0);
        assert_eq!(g.block_start_page(65), 64);
        assert_eq!(g.next_block_page(0), 64);
        assert_eq!(g.next_block_page(127), 128);
    }

    #[test]
    fn rejects_inconsistent_geometry() {
        let mut g = geom();
        g.block_size = 100; // not a multiple of page_size
        assert_eq!(g.validate(), Err(ErrorCode::LenInvalid));

        let mut g = geom();
        g.total_size = 0;
        assert_eq!(g.validate(), Err(ErrorCode::LenInvalid));

        let mut g = geom();
        g.bad_block_mark_offset = 64;
        assert_eq!(g.validate(), Err(ErrorCode::LenInvalid));
    }
}
