//! In-memory flash emulator
//!
//! A [`FlashHal`] backed by a plain byte vector, with injectable factory
//! bad-block marks, program/erase failures and busy cycles, so the
//! dispatcher's recovery paths can be exercised without hardware. Also
//! provides a loopback [`DeviceTransport`] and in-memory boot/image
//! stores for end-to-end host tests.

use std::collections::HashSet;

use pageprog_device::{
    BootStorage, ChipId, DeviceTransport, FlashHal, FlashStatus, ImageSlot, ImageStorage,
    SendError,
};
use pageprog_proto::{ChipGeometry, ErrorCode, CHIP_ID_LEN};

const ERASED: u8 = 0xFF;

/// A page program accepted by [`MemFlash::write_page_async`] but not yet
/// committed
#[derive(Debug)]
struct PendingWrite {
    page: u32,
    data: Vec<u8>,
    include_spare: bool,
    polls_left: u32,
}

/// In-memory flash chip
///
/// Pages are stored at their spare-inclusive size. Fault injection is
/// keyed by block start page (spare-exclusive indexing, like the HAL).
#[derive(Debug, Default)]
pub struct MemFlash {
    geometry: Option<ChipGeometry>,
    data: Vec<u8>,
    id: ChipId,
    /// Blocks marked bad at the factory, applied on init
    factory_bad: HashSet<u32>,
    /// Blocks whose page programs fail persistently
    program_fail: HashSet<u32>,
    /// Blocks whose erase fails persistently
    erase_fail: HashSet<u32>,
    /// Status polls a program stays busy before completing
    busy_cycles: u32,
    /// Whether the chip exposes spare-area bad-block marks
    scannable: bool,
    pending: Option<PendingWrite>,
    /// HAL configuration blob received on init
    pub hal_config: Vec<u8>,
    /// Total pages programmed (test instrumentation)
    pub pages_programmed: u32,
}

impl MemFlash {
    /// Create an emulator with the given identification bytes
    pub fn new(id: [u8; CHIP_ID_LEN]) -> Self {
        Self {
            id,
            scannable: true,
            ..Self::default()
        }
    }

    /// Mark the block containing `block_page` factory-bad (takes effect
    /// on the next init)
    pub fn mark_factory_bad(&mut self, block_page: u32) {
        self.factory_bad.insert(block_page);
    }

    /// Make page programs into the block at `block_page` fail
    pub fn fail_program_in_block(&mut self, block_page: u32) {
        self.program_fail.insert(block_page);
    }

    /// Make erase of the block at `block_page` fail
    pub fn fail_erase_of_block(&mut self, block_page: u32) {
        self.erase_fail.insert(block_page);
    }

    /// Keep programs busy for `cycles` status polls before completing
    pub fn set_busy_cycles(&mut self, cycles: u32) {
        self.busy_cycles = cycles;
    }

    /// Control whether the chip reports spare-area marks as scannable
    pub fn set_scannable(&mut self, scannable: bool) {
        self.scannable = scannable;
    }

    fn geom(&self) -> &ChipGeometry {
        // callers go through the dispatcher, which configures first
        self.geometry.as_ref().unwrap()
    }

    fn stored_page_size(&self) -> usize {
        let g = self.geom();
        (g.page_size + g.spare_size) as usize
    }

    fn page_range(&self, page: u32) -> std::ops::Range<usize> {
        let size = self.stored_page_size();
        let start = page as usize * size;
        start..start + size
    }

    fn block_of(&self, page: u32) -> u32 {
        self.geom().block_start_page(page)
    }

    /// Raw stored bytes of a page, data then spare (test inspection)
    pub fn page_bytes(&self, page: u32) -> &[u8] {
        let range = self.page_range(page);
        &self.data[range]
    }

    /// Commit the pending program into the backing store
    fn commit_pending(&mut self, pending: PendingWrite) {
        let g = *self.geom();
        let range = self.page_range(pending.page);
        let page = &mut self.data[range];
        if pending.include_spare {
            page[..pending.data.len()].copy_from_slice(&pending.data);
        } else {
            let len = pending.data.len().min(g.page_size as usize);
            page[..len].copy_from_slice(&pending.data[..len]);
        }
        self.pages_programmed += 1;
    }
}

impl FlashHal for MemFlash {
    fn init(&mut self, geometry: &ChipGeometry, hal_config: &[u8]) -> Result<(), ErrorCode> {
        self.geometry = Some(*geometry);
        self.hal_config = hal_config.to_vec();
        self.pending = None;

        let stored = (geometry.page_size + geometry.spare_size) as usize;
        self.data = vec![ERASED; geometry.total_pages() as usize * stored];

        // factory marks sit in the spare of the first page of the block
        let mark_at = geometry.page_size as usize + geometry.bad_block_mark_offset as usize;
        if geometry.spare_size > 0 {
            for &block_page in &self.factory_bad {
                let start = block_page as usize * stored;
                self.data[start + mark_at] = 0x00;
            }
        }
        Ok(())
    }

    fn read_id(&mut self) -> ChipId {
        self.id
    }

    fn erase_block(&mut self, page: u32) -> FlashStatus {
        if self.erase_fail.contains(&self.block_of(page)) {
            return FlashStatus::Error;
        }
        let g = *self.geom();
        let stored = self.stored_page_size();
        let start = g.block_start_page(page) as usize * stored;
        let len = g.pages_per_block() as usize * stored;
        self.data[start..start + len].fill(ERASED);
        FlashStatus::Ready
    }

    fn read_page(&mut self, page: u32, buf: &mut [u8], include_spare: bool) -> FlashStatus {
        let g = *self.geom();
        if page >= g.total_pages() {
            return FlashStatus::Error;
        }
        let range = self.page_range(page);
        let stored = &self.data[range];
        let len = g.effective_page_size(include_spare) as usize;
        buf[..len].copy_from_slice(&stored[..len]);
        FlashStatus::Ready
    }

    fn write_page_async(&mut self, page: u32, data: &[u8], include_spare: bool) {
        self.pending = Some(PendingWrite {
            page,
            data: data.to_vec(),
            include_spare,
            polls_left: self.busy_cycles,
        });
    }

    fn read_status(&mut self) -> FlashStatus {
        let Some(pending) = self.pending.as_mut() else {
            return FlashStatus::Ready;
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return FlashStatus::Busy;
        }
        // pending settles now, one way or the other
        let pending = self.pending.take().unwrap();
        if self.program_fail.contains(&self.block_of(pending.page)) {
            log::debug!("injected program failure at page {}", pending.page);
            return FlashStatus::Error;
        }
        self.commit_pending(pending);
        FlashStatus::Ready
    }

    fn supports_bad_block_scan(&self) -> bool {
        self.scannable
    }
}

/// In-memory boot record
#[derive(Debug)]
pub struct MemBootRecord {
    value: u8,
    /// Record writes performed (test instrumentation)
    pub writes: u32,
}

impl MemBootRecord {
    /// Create a record holding `value` (0xFF emulates erased flash)
    pub fn new(value: u8) -> Self {
        Self { value, writes: 0 }
    }
}

impl BootStorage for MemBootRecord {
    fn read_record(&mut self) -> u8 {
        self.value
    }

    fn write_record(&mut self, value: u8) -> Result<(), ErrorCode> {
        self.value = value;
        self.writes += 1;
        Ok(())
    }
}

/// In-memory pair of application image slots
#[derive(Debug)]
pub struct MemImageStore {
    size: u32,
    slots: [Vec<u8>; 2],
    /// Slots erased so far (test instrumentation)
    pub erases: Vec<ImageSlot>,
}

impl MemImageStore {
    /// Create two erased slots of `size` bytes each
    pub fn new(size: u32) -> Self {
        Self {
            size,
            slots: [vec![ERASED; size as usize], vec![ERASED; size as usize]],
            erases: Vec::new(),
        }
    }

    /// Stored bytes of a slot (test inspection)
    pub fn slot_bytes(&self, slot: ImageSlot) -> &[u8] {
        &self.slots[slot.index() as usize]
    }
}

impl ImageStorage for MemImageStore {
    fn image_size(&self) -> u32 {
        self.size
    }

    fn erase_image(&mut self, slot: ImageSlot) -> Result<(), ErrorCode> {
        self.slots[slot.index() as usize].fill(ERASED);
        self.erases.push(slot);
        Ok(())
    }

    fn write(&mut self, slot: ImageSlot, offset: u32, data: &[u8]) -> Result<(), ErrorCode> {
        let end = offset as usize + data.len();
        if end > self.size as usize {
            return Err(ErrorCode::AddrExceeded);
        }
        self.slots[slot.index() as usize][offset as usize..end].copy_from_slice(data);
        Ok(())
    }
}

/// Loopback byte-stream transport
///
/// The test pushes command bytes into the receive side, polls the
/// dispatcher, and drains emitted response bytes from the send side.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    rx: Vec<u8>,
    tx: Vec<u8>,
}

impl LoopbackTransport {
    /// Create an empty loopback
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the dispatcher to receive
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes);
    }

    /// Take everything the dispatcher has sent so far
    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Whether unconsumed receive bytes remain
    pub fn rx_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl DeviceTransport for LoopbackTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), SendError> {
        self.tx.extend_from_slice(frame);
        Ok(())
    }

    fn send_ready(&self) -> bool {
        true
    }

    fn peek(&self) -> &[u8] {
        &self.rx
    }

    fn consume(&mut self, n: usize) {
        self.rx.drain(..n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> ChipGeometry {
        ChipGeometry {
            page_size: 256,
            block_size: 1024,
            total_size: 8192,
            spare_size: 16,
            bad_block_mark_offset: 0,
        }
    }

    #[test]
    fn program_commits_on_status_poll() {
        let mut flash = MemFlash::new([1, 2, 3, 4, 5]);
        flash.set_busy_cycles(3);
        flash.init(&geom(), &[]).unwrap();

        flash.write_page_async(0, &[0xAB; 256], false);
        assert_eq!(flash.read_status(), FlashStatus::Busy);
        assert_eq!(flash.read_status(), FlashStatus::Busy);
        assert_eq!(flash.read_status(), FlashStatus::Busy);
        assert_eq!(flash.read_status(), FlashStatus::Ready);
        assert_eq!(&flash.page_bytes(0)[..256], &[0xAB; 256]);
        // spare untouched by a data-only program
        assert_eq!(&flash.page_bytes(0)[256..], &[0xFF; 16]);
    }

    #[test]
    fn injected_program_failure_reports_error() {
        let mut flash = MemFlash::new([0; 5]);
        flash.fail_program_in_block(4); // second block, pages 4..8
        flash.init(&geom(), &[]).unwrap();

        flash.write_page_async(5, &[0x11; 256], false);
        assert_eq!(flash.read_status(), FlashStatus::Error);
        // the store was not modified
        assert_eq!(&flash.page_bytes(5)[..256], &[0xFF; 256]);
    }

    #[test]
    fn factory_marks_visible_after_init() {
        let mut flash = MemFlash::new([0; 5]);
        flash.mark_factory_bad(4);
        flash.init(&geom(), &[]).unwrap();

        let mut buf = [0u8; 272];
        assert_eq!(flash.read_page(4, &mut buf, true), FlashStatus::Ready);
        assert_eq!(buf[256], 0x00);
        assert_eq!(flash.read_page(0, &mut buf, true), FlashStatus::Ready);
        assert_eq!(buf[256], 0xFF);
    }

    #[test]
    fn erase_restores_erased_state() {
        let mut flash = MemFlash::new([0; 5]);
        flash.init(&geom(), &[]).unwrap();

        flash.write_page_async(0, &[0x22; 256], false);
        assert_eq!(flash.read_status(), FlashStatus::Ready);
        assert_eq!(flash.erase_block(0), FlashStatus::Ready);
        assert_eq!(&flash.page_bytes(0)[..256], &[0xFF; 256]);
    }

    #[test]
    fn loopback_round_trip() {
        let mut t = LoopbackTransport::new();
        t.push_rx(&[1, 2, 3]);
        assert_eq!(t.peek(), &[1, 2, 3]);
        t.consume(2);
        assert_eq!(t.peek(), &[3]);
        t.send(&[9, 9]).unwrap();
        assert_eq!(t.take_tx(), vec![9, 9]);
        assert!(t.take_tx().is_empty());
    }
}
