//! Boot selector and A/B image plumbing
//!
//! One persisted byte in a reserved flash page between the bootloader
//! and the two application images selects which image runs. The record
//! is owned exclusively by the selector and mutated only when a firmware
//! update completes, so a power loss at any earlier point leaves the
//! previously active image selected.
//!
//! At power-on the loader reads the record, takes the selected image's
//! base from [`BootLayout`], loads the initial stack pointer and reset
//! vector from that base and relocates the vector table there. The jump
//! itself is target-specific and lives in the firmware entry, not here.

use pageprog_proto::ErrorCode;

/// Wire/record value of image slot 1; anything else decodes as slot 0
const RECORD_IMAGE_1: u8 = 1;

/// One of the two redundant application image slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    /// First application slot (the default)
    Image0,
    /// Second application slot
    Image1,
}

impl ImageSlot {
    /// Decode a persisted record byte. A corrupted record (erased flash,
    /// partial write) decodes as image 0 - the loader never fails here.
    pub fn from_record(byte: u8) -> Self {
        if byte == RECORD_IMAGE_1 {
            Self::Image1
        } else {
            Self::Image0
        }
    }

    /// Record byte for persisting this slot
    pub fn to_record(self) -> u8 {
        match self {
            Self::Image0 => 0,
            Self::Image1 => RECORD_IMAGE_1,
        }
    }

    /// The other slot
    pub fn other(self) -> Self {
        match self {
            Self::Image0 => Self::Image1,
            Self::Image1 => Self::Image0,
        }
    }

    /// Slot index as reported by get-active-image
    pub fn index(self) -> u8 {
        self.to_record()
    }
}

/// Persistent storage for the one-byte boot record
pub trait BootStorage {
    /// Read the record byte (a corrupted page may return anything)
    fn read_record(&mut self) -> u8;

    /// Persist a new record byte
    fn write_record(&mut self, value: u8) -> Result<(), ErrorCode>;
}

/// Fixed flash layout of the two application images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootLayout {
    /// Base address of image slot 0
    pub image0_base: u32,
    /// Base address of image slot 1
    pub image1_base: u32,
    /// Size of each image slot in bytes
    pub image_size: u32,
}

impl BootLayout {
    /// Base address (vector table location) of a slot
    pub fn image_base(&self, slot: ImageSlot) -> u32 {
        match slot {
            ImageSlot::Image0 => self.image0_base,
            ImageSlot::Image1 => self.image1_base,
        }
    }
}

/// Owner of the persisted image-selector record
#[derive(Debug)]
pub struct BootSelector<S> {
    storage: S,
    layout: BootLayout,
}

impl<S: BootStorage> BootSelector<S> {
    /// Create a selector over the given record storage and image layout
    pub fn new(storage: S, layout: BootLayout) -> Self {
        Self { storage, layout }
    }

    /// Read and decode the currently selected image
    pub fn active_image(&mut self) -> ImageSlot {
        ImageSlot::from_record(self.storage.read_record())
    }

    /// Atomically select the other image, returning the new selection.
    ///
    /// This is the final step of a firmware update; until it succeeds the
    /// previous image remains selected.
    pub fn switch_image(&mut self) -> Result<ImageSlot, ErrorCode> {
        let next = self.active_image().other();
        self.storage.write_record(next.to_record())?;
        Ok(next)
    }

    /// Base address of a slot, for vector-table relocation at power-on
    pub fn image_base(&self, slot: ImageSlot) -> u32 {
        self.layout.image_base(slot)
    }

    /// The image layout
    pub fn layout(&self) -> &BootLayout {
        &self.layout
    }
}

/// Write access to the flat application-image address space, used by the
/// firmware-update session
pub trait ImageStorage {
    /// Size of one image slot in bytes
    fn image_size(&self) -> u32;

    /// Erase a whole image slot before programming
    fn erase_image(&mut self, slot: ImageSlot) -> Result<(), ErrorCode>;

    /// Program `data` at `offset` within a slot
    fn write(&mut self, slot: ImageSlot, offset: u32, data: &[u8]) -> Result<(), ErrorCode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemRecord(u8);

    impl BootStorage for MemRecord {
        fn read_record(&mut self) -> u8 {
            self.0
        }

        fn write_record(&mut self, value: u8) -> Result<(), ErrorCode> {
            self.0 = value;
            Ok(())
        }
    }

    fn layout() -> BootLayout {
        BootLayout {
            image0_base: 0x0800_8000,
            image1_base: 0x0804_8000,
            image_size: 0x0004_0000,
        }
    }

    #[test]
    fn corrupted_record_defaults_to_image_0() {
        // erased flash reads 0xFF
        assert_eq!(ImageSlot::from_record(0xFF), ImageSlot::Image0);
        assert_eq!(ImageSlot::from_record(0x5A), ImageSlot::Image0);
        assert_eq!(ImageSlot::from_record(0), ImageSlot::Image0);
        assert_eq!(ImageSlot::from_record(1), ImageSlot::Image1);
    }

    #[test]
    fn switch_flips_and_persists() {
        let mut selector = BootSelector::new(MemRecord(0xFF), layout());
        assert_eq!(selector.active_image(), ImageSlot::Image0);

        assert_eq!(selector.switch_image().unwrap(), ImageSlot::Image1);
        assert_eq!(selector.active_image(), ImageSlot::Image1);

        assert_eq!(selector.switch_image().unwrap(), ImageSlot::Image0);
        assert_eq!(selector.active_image(), ImageSlot::Image0);
    }

    #[test]
    fn image_base_follows_slot() {
        let selector = BootSelector::new(MemRecord(0), layout());
        assert_eq!(selector.image_base(ImageSlot::Image0), 0x0800_8000);
        assert_eq!(selector.image_base(ImageSlot::Image1), 0x0804_8000);
    }
}
