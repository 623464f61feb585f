//! Device command dispatcher
//!
//! Decodes one framed command per transport-poll cycle, executes it
//! against the Flash HAL / bad block table / boot configuration, and
//! emits response frames. Long operations (erase, read, bad-block scan)
//! are never executed in one call: they are held as an explicit pending
//! state and advanced one block or page per poll, so the dispatcher
//! always runs to completion quickly.
//!
//! The single deferred piece of work is the one outstanding asynchronous
//! page program, drained at the top of every data-accepting call before
//! new bytes are taken (poll-before-proceed). This overlaps flash commit
//! time with transfer of the next packet - the latency-hiding core of
//! the protocol.

use pageprog_proto::command::MAX_DATA_LEN;
use pageprog_proto::response::{DataPayload, Response, MAX_RESPONSE_FRAME};
use pageprog_proto::{
    ChipGeometry, Command, CommandDecoder, Configure, ErrorCode, FirmwareVersion, OpFlags, Span,
    FW_UPDATE_PAGE_SIZE,
};

use crate::bbt::BadBlockTable;
use crate::boot::{BootSelector, BootStorage, ImageSlot, ImageStorage};
use crate::hal::{FlashHal, FlashStatus};
use crate::transport::DeviceTransport;

/// Largest effective page (data + spare) the device can buffer
pub const PAGE_BUF_CAPACITY: usize = 4352;

/// Status polls per drain call before the outstanding write is declared
/// timed out
pub const WRITE_POLL_CEILING: u32 = 10_000;

/// Erased-flash bad-block mark value; anything else flags the block bad
const GOOD_BLOCK_MARK: u8 = 0xFF;

type PageBuf = heapless::Vec<u8, PAGE_BUF_CAPACITY>;

/// Destination of an open write session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteTarget {
    /// The configured flash chip
    Chip,
    /// The inactive firmware image slot
    Firmware { slot: ImageSlot, offset: u32 },
}

/// Open write session state
#[derive(Debug)]
struct WriteSession {
    target: WriteTarget,
    /// Effective page size of the data stream
    page_size: u32,
    /// Spare-inclusive addressing (chip target only)
    include_spare: bool,
    /// Skip blocks listed in the bad block table
    skip_bad: bool,
    /// Next page index to program
    page: u32,
    /// Bytes still expected from the host (shrinks on absorbed skips)
    expected: u32,
    /// Bytes accepted so far
    received: u32,
    /// Bytes covered by the last WRITE_ACK
    acked: u32,
    /// Full-range operation: skipped blocks count toward completion
    absorb: bool,
    /// Page accumulation buffer
    buf: PageBuf,
}

/// The single outstanding asynchronous page program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AsyncWrite {
    /// No program in flight
    #[default]
    Idle,
    /// A page program was issued and has not been confirmed yet
    Writing {
        page: u32,
        include_spare: bool,
        data_len: usize,
    },
}

/// Poll-resumed long operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Pending {
    #[default]
    None,
    Erase(EraseOp),
    Read(ReadOp),
    Scan(ScanOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EraseOp {
    /// Current block start page
    page: u32,
    /// Bytes still to erase
    remaining: u32,
    /// Bytes reported as done
    done: u32,
    include_spare: bool,
    skip_bad: bool,
    absorb: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadOp {
    /// Next page index to read
    page: u32,
    /// Bytes still to deliver
    remaining: u32,
    include_spare: bool,
    skip_bad: bool,
    absorb: bool,
    /// Bytes of the scratch page already sent
    sent: usize,
    /// Valid bytes in the scratch page
    avail: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanOp {
    /// Current block start page
    page: u32,
}

/// Device command dispatcher
///
/// One instance per device, constructed once at startup and owned by the
/// main loop; its lifetime is the chip session's.
pub struct Dispatcher<H, S, I> {
    hal: H,
    boot: BootSelector<S>,
    images: I,
    version: FirmwareVersion,
    decoder: CommandDecoder,
    bbt: BadBlockTable,
    geometry: Option<ChipGeometry>,
    write: Option<WriteSession>,
    inflight: AsyncWrite,
    pending: Pending,
    /// Lazily read active image slot (None until first queried)
    active: Option<ImageSlot>,
    /// Data of the in-flight page, kept for re-issue after a failed
    /// program
    inflight_buf: [u8; PAGE_BUF_CAPACITY],
    /// Shared scratch page for reads and bad-block mark checks
    scratch: [u8; PAGE_BUF_CAPACITY],
}

fn emit<T: DeviceTransport>(transport: &mut T, response: &Response) {
    let mut frame = [0u8; MAX_RESPONSE_FRAME];
    let n = response.encode(&mut frame);
    if transport.send(&frame[..n]).is_err() {
        log::warn!("transport send failed, dropping frame");
    }
}

fn emit_data<T: DeviceTransport>(transport: &mut T, bytes: &[u8]) {
    let mut payload = DataPayload::new();
    // callers never pass more than MAX_DATA_LEN
    let _ = payload.extend_from_slice(bytes);
    emit(transport, &Response::Data(payload));
}

impl<H, S, I> Dispatcher<H, S, I>
where
    H: FlashHal,
    S: BootStorage,
    I: ImageStorage,
{
    /// Create a dispatcher over the device's hardware collaborators
    pub fn new(hal: H, boot: BootSelector<S>, images: I, version: FirmwareVersion) -> Self {
        Self {
            hal,
            boot,
            images,
            version,
            decoder: CommandDecoder::new(),
            bbt: BadBlockTable::new(),
            geometry: None,
            write: None,
            inflight: AsyncWrite::Idle,
            pending: Pending::None,
            active: None,
            inflight_buf: [0; PAGE_BUF_CAPACITY],
            scratch: [0; PAGE_BUF_CAPACITY],
        }
    }

    /// The bad block table of the current chip session
    pub fn bad_blocks(&self) -> &BadBlockTable {
        &self.bbt
    }

    /// Access the HAL (test instrumentation)
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Access the image storage (test instrumentation)
    pub fn images(&self) -> &I {
        &self.images
    }

    /// Whether a long operation or write session is in progress
    pub fn is_busy(&self) -> bool {
        self.pending != Pending::None
            || self.write.is_some()
            || self.inflight != AsyncWrite::Idle
    }

    /// One transport-poll cycle: consume available stream bytes, handle
    /// at most one complete command, otherwise advance the pending
    /// operation by one unit.
    pub fn poll<T: DeviceTransport>(&mut self, transport: &mut T) {
        let taken = {
            let data = transport.peek();
            if data.is_empty() {
                0
            } else {
                self.decoder.push(data)
            }
        };
        if taken > 0 {
            transport.consume(taken);
        }

        match self.decoder.next() {
            Err(code) => emit(transport, &Response::Error(code)),
            Ok(Some(command)) => {
                if let Err(code) = self.handle(transport, command) {
                    emit(transport, &Response::Error(code));
                }
            }
            Ok(None) => {
                if let Err(code) = self.advance(transport) {
                    self.pending = Pending::None;
                    emit(transport, &Response::Error(code));
                }
            }
        }
    }

    fn geom(&self) -> Result<ChipGeometry, ErrorCode> {
        self.geometry.ok_or(ErrorCode::ChipNotConf)
    }

    /// Execute exactly one decoded command. An `Err` return results in
    /// exactly one STATUS/ERROR emission by [`poll`](Self::poll).
    fn handle<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        command: Command,
    ) -> Result<(), ErrorCode> {
        log::trace!("command 0x{:02X}", command.code());

        if command.requires_configured() && self.geometry.is_none() {
            return Err(ErrorCode::ChipNotConf);
        }

        match command {
            Command::Configure(conf) => self.cmd_configure(transport, conf),
            Command::ReadId => self.cmd_read_id(transport),
            Command::GetVersion => {
                emit_data(transport, &self.version.to_wire());
                emit(transport, &Response::Ok);
                Ok(())
            }
            Command::GetActiveImage => {
                let slot = self.active_slot();
                emit_data(transport, &[slot.index()]);
                emit(transport, &Response::Ok);
                Ok(())
            }
            Command::Erase(span) => self.cmd_erase(span),
            Command::Read(span) => self.cmd_read(span),
            Command::ReadBadBlocks => self.cmd_read_bad_blocks(transport),
            Command::WriteStart(span) => self.cmd_write_start(transport, span),
            Command::WriteData(data) => self.cmd_write_data(transport, &data, WriteKind::Chip),
            Command::WriteEnd => self.cmd_write_end(transport),
            Command::FwUpdateStart { addr, len } => {
                self.cmd_fw_update_start(transport, addr, len)
            }
            Command::FwUpdateData(data) => {
                self.cmd_write_data(transport, &data, WriteKind::Firmware)
            }
            Command::FwUpdateEnd => self.cmd_fw_update_end(transport),
        }
    }

    fn active_slot(&mut self) -> ImageSlot {
        match self.active {
            Some(slot) => slot,
            None => {
                let slot = self.boot.active_image();
                self.active = Some(slot);
                slot
            }
        }
    }

    // =========================================================================
    // Configure / identity commands
    // =========================================================================

    fn cmd_configure<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        conf: Configure,
    ) -> Result<(), ErrorCode> {
        conf.geometry.validate()?;
        if conf.geometry.effective_page_size(true) as usize > PAGE_BUF_CAPACITY {
            return Err(ErrorCode::BufOverflow);
        }

        self.hal.init(&conf.geometry, &conf.hal_config)?;

        // new chip session: all derived state is invalid
        self.bbt.clear();
        self.write = None;
        self.pending = Pending::None;
        self.inflight = AsyncWrite::Idle;
        self.geometry = Some(conf.geometry);

        log::info!(
            "configured chip: page {} block {} total {} spare {}",
            conf.geometry.page_size,
            conf.geometry.block_size,
            conf.geometry.total_size,
            conf.geometry.spare_size
        );

        emit(transport, &Response::Ok);
        Ok(())
    }

    fn cmd_read_id<T: DeviceTransport>(&mut self, transport: &mut T) -> Result<(), ErrorCode> {
        let id = self.hal.read_id();
        emit_data(transport, &id);
        emit(transport, &Response::Ok);
        Ok(())
    }

    // =========================================================================
    // Span validation
    // =========================================================================

    /// Validate an addressed operation against the effective geometry.
    /// `unit` is the alignment granule (page for read/write, block for
    /// erase).
    fn check_span(
        geom: &ChipGeometry,
        span: &Span,
        unit: u32,
        allow_empty: bool,
    ) -> Result<(), ErrorCode> {
        let include_spare = span.flags.contains(OpFlags::INCLUDE_SPARE);
        let total = geom.effective_total_size(include_spare);

        if span.len == 0 && !allow_empty {
            return Err(ErrorCode::LenInvalid);
        }
        if !span.addr.is_multiple_of(unit) {
            return Err(ErrorCode::AddrNotAligned);
        }
        if !span.len.is_multiple_of(unit) {
            return Err(ErrorCode::LenNotAligned);
        }
        let end = span
            .addr
            .checked_add(span.len)
            .ok_or(ErrorCode::AddrExceeded)?;
        if end > total {
            return Err(ErrorCode::AddrExceeded);
        }
        Ok(())
    }

    fn require_idle(&self) -> Result<(), ErrorCode> {
        if self.pending != Pending::None {
            return Err(ErrorCode::CmdInvalid);
        }
        Ok(())
    }

    // =========================================================================
    // Bad block checks
    // =========================================================================

    /// Whether the block starting at `block_page` is bad: a table hit,
    /// or (when the chip exposes marks) a spare-area mark check. Newly
    /// discovered marks are appended to the table.
    fn is_bad_block(&mut self, block_page: u32) -> Result<bool, ErrorCode> {
        if self.bbt.contains(block_page) {
            return Ok(true);
        }
        let geom = self.geom()?;
        if !self.hal.supports_bad_block_scan() || geom.spare_size == 0 {
            return Ok(false);
        }
        if self.check_block_marks(&geom, block_page) {
            self.bbt.add(block_page)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Inspect page 0 then page 1 of a block; the first non-erased mark
    /// byte flags the block bad. A read failure counts as a bad mark.
    fn check_block_marks(&mut self, geom: &ChipGeometry, block_page: u32) -> bool {
        let eff = geom.effective_page_size(true) as usize;
        let mark_at = geom.page_size as usize + geom.bad_block_mark_offset as usize;
        for page in [block_page, block_page + 1] {
            match self.hal.read_page(page, &mut self.scratch[..eff], true) {
                FlashStatus::Ready => {
                    if self.scratch[mark_at] != GOOD_BLOCK_MARK {
                        return true;
                    }
                }
                _ => return true,
            }
        }
        false
    }

    /// Emit a BAD_BLOCK notification and record the block in the table
    fn report_bad_block<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        block_page: u32,
        include_spare: bool,
    ) -> Result<(), ErrorCode> {
        let geom = self.geom()?;
        emit(
            transport,
            &Response::BadBlock {
                addr: geom.addr_of_page(block_page, include_spare),
                size: geom.effective_block_size(include_spare),
            },
        );
        self.bbt.add(block_page)
    }

    // =========================================================================
    // Erase
    // =========================================================================

    fn cmd_erase(&mut self, span: Span) -> Result<(), ErrorCode> {
        self.require_idle()?;
        let geom = self.geom()?;
        let include_spare = span.flags.contains(OpFlags::INCLUDE_SPARE);
        Self::check_span(
            &geom,
            &span,
            geom.effective_block_size(include_spare),
            false,
        )?;

        self.pending = Pending::Erase(EraseOp {
            page: geom.page_of_addr(span.addr, include_spare),
            remaining: span.len,
            done: 0,
            include_spare,
            skip_bad: span.flags.contains(OpFlags::SKIP_BAD_BLOCK),
            absorb: span.len == geom.effective_total_size(include_spare),
        });
        Ok(())
    }

    fn advance_erase<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        mut op: EraseOp,
    ) -> Result<(), ErrorCode> {
        let geom = self.geom()?;
        let block_pages = geom.pages_per_block();
        let block_bytes = geom.effective_block_size(op.include_spare);

        // skip known-bad blocks without touching hardware
        while op.skip_bad && op.page < geom.total_pages() && self.is_bad_block(op.page)? {
            emit(
                transport,
                &Response::BadBlockSkipped {
                    addr: geom.addr_of_page(op.page, op.include_spare),
                    size: block_bytes,
                },
            );
            if op.absorb {
                op.remaining = op.remaining.saturating_sub(block_bytes);
                op.done += block_bytes;
                emit(transport, &Response::Progress { bytes_done: op.done });
            }
            op.page += block_pages;
            if op.remaining == 0 {
                emit(transport, &Response::Ok);
                return Ok(());
            }
        }

        if op.page >= geom.total_pages() {
            return Err(ErrorCode::AddrExceeded);
        }

        match self.hal.erase_block(op.page) {
            FlashStatus::Ready => {
                op.remaining -= block_bytes;
                op.done += block_bytes;
                emit(transport, &Response::Progress { bytes_done: op.done });
                op.page += block_pages;
            }
            FlashStatus::Busy => {
                // chip still busy, retry the same block next poll
            }
            FlashStatus::Error | FlashStatus::Timeout => {
                // report and continue: a later block takes this one's place
                self.report_bad_block(transport, op.page, op.include_spare)?;
                if op.absorb {
                    op.remaining = op.remaining.saturating_sub(block_bytes);
                    op.done += block_bytes;
                    emit(transport, &Response::Progress { bytes_done: op.done });
                }
                op.page += block_pages;
            }
            FlashStatus::InvalidCmd => return Err(ErrorCode::NandErase),
        }

        if op.remaining == 0 {
            emit(transport, &Response::Ok);
        } else {
            self.pending = Pending::Erase(op);
        }
        Ok(())
    }

    // =========================================================================
    // Read
    // =========================================================================

    fn cmd_read(&mut self, span: Span) -> Result<(), ErrorCode> {
        self.require_idle()?;
        let geom = self.geom()?;
        let include_spare = span.flags.contains(OpFlags::INCLUDE_SPARE);
        Self::check_span(&geom, &span, geom.effective_page_size(include_spare), false)?;

        self.pending = Pending::Read(ReadOp {
            page: geom.page_of_addr(span.addr, include_spare),
            remaining: span.len,
            include_spare,
            skip_bad: span.flags.contains(OpFlags::SKIP_BAD_BLOCK),
            absorb: span.len == geom.effective_total_size(include_spare),
            sent: 0,
            avail: 0,
        });
        Ok(())
    }

    fn advance_read<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        mut op: ReadOp,
    ) -> Result<(), ErrorCode> {
        let geom = self.geom()?;
        let block_pages = geom.pages_per_block();
        let block_bytes = geom.effective_block_size(op.include_spare);
        let eff_page = geom.effective_page_size(op.include_spare) as usize;

        // flush the buffered page before anything may clobber the scratch
        if op.sent < op.avail {
            while op.sent < op.avail && transport.send_ready() {
                let chunk = MAX_DATA_LEN.min(op.avail - op.sent);
                emit_data(transport, &self.scratch[op.sent..op.sent + chunk]);
                op.sent += chunk;
            }
            if op.sent < op.avail {
                // transport backpressure, resume next poll
                self.pending = Pending::Read(op);
                return Ok(());
            }
        }

        if op.remaining == 0 {
            emit(transport, &Response::Ok);
            return Ok(());
        }

        // skip checks happen at block boundaries only
        while op.skip_bad
            && op.page.is_multiple_of(block_pages)
            && op.page < geom.total_pages()
            && self.is_bad_block(op.page)?
        {
            emit(
                transport,
                &Response::BadBlockSkipped {
                    addr: geom.addr_of_page(op.page, op.include_spare),
                    size: block_bytes,
                },
            );
            if op.absorb {
                op.remaining = op.remaining.saturating_sub(block_bytes);
            }
            op.page += block_pages;
            if op.remaining == 0 {
                emit(transport, &Response::Ok);
                return Ok(());
            }
        }

        if op.page >= geom.total_pages() {
            return Err(ErrorCode::AddrExceeded);
        }

        match self
            .hal
            .read_page(op.page, &mut self.scratch[..eff_page], op.include_spare)
        {
            FlashStatus::Ready => {
                op.avail = eff_page.min(op.remaining as usize);
                op.sent = 0;
                op.remaining -= op.avail as u32;
                op.page += 1;
            }
            FlashStatus::Error | FlashStatus::Timeout => {
                // report and continue with the next block
                let block = geom.block_start_page(op.page);
                self.report_bad_block(transport, block, op.include_spare)?;
                if op.absorb {
                    op.remaining = op.remaining.saturating_sub(block_bytes);
                }
                op.page = geom.next_block_page(op.page);
            }
            FlashStatus::Busy | FlashStatus::InvalidCmd => return Err(ErrorCode::NandRd),
        }

        self.pending = Pending::Read(op);
        Ok(())
    }

    // =========================================================================
    // Bad block enumeration
    // =========================================================================

    fn cmd_read_bad_blocks<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ErrorCode> {
        self.require_idle()?;
        let geom = self.geom()?;

        if !self.hal.supports_bad_block_scan() || geom.spare_size == 0 {
            // no marks to scan: replay what this session already knows
            for block_page in self.bbt.iter() {
                emit(
                    transport,
                    &Response::BadBlock {
                        addr: geom.addr_of_page(block_page, false),
                        size: geom.block_size,
                    },
                );
            }
            emit(transport, &Response::Ok);
            return Ok(());
        }

        self.bbt.clear();
        self.pending = Pending::Scan(ScanOp { page: 0 });
        Ok(())
    }

    fn advance_scan<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        mut op: ScanOp,
    ) -> Result<(), ErrorCode> {
        let geom = self.geom()?;

        if op.page >= geom.total_pages() {
            log::info!("bad block scan done: {} bad", self.bbt.len());
            emit(transport, &Response::Ok);
            return Ok(());
        }

        if self.check_block_marks(&geom, op.page) {
            self.report_bad_block(transport, op.page, false)?;
        }

        op.page += geom.pages_per_block();
        self.pending = Pending::Scan(op);
        Ok(())
    }

    // =========================================================================
    // Write session
    // =========================================================================

    fn cmd_write_start<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        span: Span,
    ) -> Result<(), ErrorCode> {
        self.require_idle()?;
        // a leftover program from an invalidated session must settle first
        self.drain_inflight(transport)?;

        let geom = self.geom()?;
        let include_spare = span.flags.contains(OpFlags::INCLUDE_SPARE);
        let page_size = geom.effective_page_size(include_spare);
        Self::check_span(&geom, &span, page_size, true)?;

        // write-start invalidates any prior open session
        self.write = Some(WriteSession {
            target: WriteTarget::Chip,
            page_size,
            include_spare,
            skip_bad: span.flags.contains(OpFlags::SKIP_BAD_BLOCK),
            page: geom.page_of_addr(span.addr, include_spare),
            expected: span.len,
            received: 0,
            acked: 0,
            absorb: span.len == geom.effective_total_size(include_spare),
            buf: PageBuf::new(),
        });

        emit(transport, &Response::Ok);

        // a bad block under the fresh cursor must be reported before the
        // host opens its first page window
        if let Err(code) = self.skip_at_block_boundary(transport) {
            self.write = None;
            return Err(code);
        }
        Ok(())
    }

    fn cmd_write_data<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), ErrorCode> {
        match (&self.write, kind) {
            (Some(s), WriteKind::Chip) if s.target == WriteTarget::Chip => {}
            (Some(s), WriteKind::Firmware)
                if matches!(s.target, WriteTarget::Firmware { .. }) => {}
            _ => return Err(ErrorCode::CmdInvalid),
        }

        // poll-before-proceed: the previous page must settle before new
        // bytes are accepted
        if let Err(code) = self.drain_inflight(transport) {
            self.write = None;
            return Err(code);
        }

        let result = self.accept_data(transport, data);
        if result.is_err() {
            self.write = None;
        }
        result
    }

    fn accept_data<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        data: &[u8],
    ) -> Result<(), ErrorCode> {
        let mut offset = 0;
        while offset < data.len() {
            let session = self.write.as_mut().ok_or(ErrorCode::CmdInvalid)?;
            if session.received + (data.len() - offset) as u32 > session.expected {
                return Err(ErrorCode::LenExceeded);
            }

            let room = session.page_size as usize - session.buf.len();
            let take = room.min(data.len() - offset);
            session
                .buf
                .extend_from_slice(&data[offset..offset + take])
                .map_err(|_| ErrorCode::BufOverflow)?;
            session.received += take as u32;
            offset += take;

            let full = session.buf.len() == session.page_size as usize;
            if full {
                self.flush_page(transport)?;
            }
        }
        Ok(())
    }

    /// Program the accumulated page and acknowledge it
    fn flush_page<T: DeviceTransport>(&mut self, transport: &mut T) -> Result<(), ErrorCode> {
        let session = self.write.as_ref().ok_or(ErrorCode::CmdInvalid)?;

        match session.target {
            WriteTarget::Chip => {
                let geom = self.geom()?;
                // a chunk may complete two pages; the first program must
                // settle before its buffer slot is reused
                self.drain_inflight(transport)?;
                self.skip_bad_write_blocks(transport)?;

                let session = self.write.as_mut().ok_or(ErrorCode::CmdInvalid)?;
                if session.page >= geom.total_pages() {
                    return Err(ErrorCode::AddrExceeded);
                }

                let len = session.buf.len();
                self.inflight_buf[..len].copy_from_slice(&session.buf);
                self.hal
                    .write_page_async(session.page, &self.inflight_buf[..len], session.include_spare);
                self.inflight = AsyncWrite::Writing {
                    page: session.page,
                    include_spare: session.include_spare,
                    data_len: len,
                };
                session.page += 1;

                // if that page closed its block, skip past any bad blocks
                // now: the notification must precede the acknowledgment,
                // or the host streams bytes the chip has no room for
                self.skip_at_block_boundary(transport)?;
            }
            WriteTarget::Firmware { slot, offset } => {
                let session = self.write.as_mut().ok_or(ErrorCode::CmdInvalid)?;
                self.images.write(slot, offset, &session.buf)?;
                session.target = WriteTarget::Firmware {
                    slot,
                    offset: offset + session.page_size,
                };
            }
        }

        let session = self.write.as_mut().ok_or(ErrorCode::CmdInvalid)?;
        session.buf.clear();
        session.acked = session.received;
        emit(
            transport,
            &Response::WriteAck {
                bytes_acked: session.received,
            },
        );
        Ok(())
    }

    /// Move the write cursor past bad blocks whenever it crosses onto a
    /// block boundary, so the skip notification reaches the host before
    /// the acknowledgment opens its next page window.
    fn skip_at_block_boundary<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ErrorCode> {
        let geom = self.geom()?;
        let needs_check = match self.write.as_ref() {
            Some(s) => {
                s.target == WriteTarget::Chip
                    && s.skip_bad
                    && s.received < s.expected
                    && s.page.is_multiple_of(geom.pages_per_block())
            }
            None => false,
        };
        if !needs_check {
            return Ok(());
        }
        // mark scans read the chip, so the outstanding program must settle
        self.drain_inflight(transport)?;
        self.skip_bad_write_blocks(transport)
    }

    /// Skip known-bad blocks ahead of the write cursor (block boundaries
    /// only)
    fn skip_bad_write_blocks<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ErrorCode> {
        let geom = self.geom()?;
        let block_pages = geom.pages_per_block();

        loop {
            let Some(session) = self.write.as_ref() else {
                return Err(ErrorCode::CmdInvalid);
            };
            // absorbing the skip may have consumed the rest of the stream
            if session.received >= session.expected {
                return Ok(());
            }
            if !session.skip_bad || !session.page.is_multiple_of(block_pages) {
                return Ok(());
            }
            if session.page >= geom.total_pages() {
                return Err(ErrorCode::AddrExceeded);
            }
            let page = session.page;
            let include_spare = session.include_spare;
            if !self.is_bad_block(page)? {
                return Ok(());
            }

            let block_bytes = geom.effective_block_size(include_spare);
            emit(
                transport,
                &Response::BadBlockSkipped {
                    addr: geom.addr_of_page(page, include_spare),
                    size: block_bytes,
                },
            );
            let session = self.write.as_mut().ok_or(ErrorCode::CmdInvalid)?;
            if session.absorb {
                session.expected = session
                    .received
                    .max(session.expected.saturating_sub(block_bytes));
            }
            session.page += block_pages;
        }
    }

    /// Drain the outstanding asynchronous page program until nothing is
    /// in flight.
    ///
    /// Bounded: `Busy` is retried up to [`WRITE_POLL_CEILING`] times per
    /// program, after which the write is declared timed out. A chip
    /// failure re-issues the buffered page to the next good block and the
    /// replacement program is drained in turn, so the caller always
    /// resumes with committed data.
    fn drain_inflight<T: DeviceTransport>(&mut self, transport: &mut T) -> Result<(), ErrorCode> {
        loop {
            let AsyncWrite::Writing {
                page,
                include_spare,
                data_len,
                ..
            } = self.inflight
            else {
                return Ok(());
            };

            let mut settled = false;
            for attempts in 0..WRITE_POLL_CEILING {
                match self.hal.read_status() {
                    FlashStatus::Ready => {
                        log::trace!("page {} committed after {} polls", page, attempts);
                        self.inflight = AsyncWrite::Idle;
                        settled = true;
                        break;
                    }
                    FlashStatus::Busy => {}
                    FlashStatus::Error | FlashStatus::Timeout => {
                        self.reissue_inflight(transport, page, include_spare, data_len)?;
                        settled = true;
                        break;
                    }
                    FlashStatus::InvalidCmd => {
                        self.inflight = AsyncWrite::Idle;
                        return Err(ErrorCode::Internal);
                    }
                }
            }
            if !settled {
                self.inflight = AsyncWrite::Idle;
                return Err(ErrorCode::NandWr);
            }
        }
    }

    /// A page program failed: record the block bad, re-program the kept
    /// page data into the next good block and move the write cursor past
    /// it (report and continue).
    fn reissue_inflight<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        failed_page: u32,
        include_spare: bool,
        data_len: usize,
    ) -> Result<(), ErrorCode> {
        let geom = self.geom()?;
        let block_pages = geom.pages_per_block();
        let block_bytes = geom.effective_block_size(include_spare);
        let failed_block = geom.block_start_page(failed_page);

        self.inflight = AsyncWrite::Idle;
        self.report_bad_block(transport, failed_block, include_spare)?;

        let skip_bad = self.write.as_ref().map(|s| s.skip_bad).unwrap_or(false);
        let mut new_page = geom.next_block_page(failed_page);
        while skip_bad && new_page < geom.total_pages() && self.is_bad_block(new_page)? {
            emit(
                transport,
                &Response::BadBlockSkipped {
                    addr: geom.addr_of_page(new_page, include_spare),
                    size: block_bytes,
                },
            );
            if let Some(session) = self.write.as_mut() {
                if session.absorb {
                    session.expected = session
                        .received
                        .max(session.expected.saturating_sub(block_bytes));
                }
            }
            new_page += block_pages;
        }
        if new_page >= geom.total_pages() {
            self.write = None;
            return Err(ErrorCode::AddrExceeded);
        }

        self.hal
            .write_page_async(new_page, &self.inflight_buf[..data_len], include_spare);
        self.inflight = AsyncWrite::Writing {
            page: new_page,
            include_spare,
            data_len,
        };
        if let Some(session) = self.write.as_mut() {
            session.page = new_page + 1;
        }
        Ok(())
    }

    fn cmd_write_end<T: DeviceTransport>(&mut self, transport: &mut T) -> Result<(), ErrorCode> {
        match &self.write {
            Some(s) if s.target == WriteTarget::Chip => {}
            _ => return Err(ErrorCode::CmdInvalid),
        }

        if let Err(code) = self.drain_inflight(transport) {
            self.write = None;
            return Err(code);
        }

        // write is None only in the error paths above
        let session = self.write.take().ok_or(ErrorCode::CmdInvalid)?;
        if !session.buf.is_empty() {
            // a partial page cannot be programmed
            return Err(ErrorCode::NandWr);
        }
        if session.acked != session.received {
            emit(
                transport,
                &Response::WriteAck {
                    bytes_acked: session.received,
                },
            );
        }
        emit(transport, &Response::Ok);
        Ok(())
    }

    // =========================================================================
    // Firmware update
    // =========================================================================

    fn cmd_fw_update_start<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
        addr: u32,
        len: u32,
    ) -> Result<(), ErrorCode> {
        self.require_idle()?;

        let image_size = self.images.image_size();
        if !addr.is_multiple_of(FW_UPDATE_PAGE_SIZE) {
            return Err(ErrorCode::AddrNotAligned);
        }
        if !len.is_multiple_of(FW_UPDATE_PAGE_SIZE) {
            return Err(ErrorCode::LenNotAligned);
        }
        let end = addr.checked_add(len).ok_or(ErrorCode::AddrExceeded)?;
        if end > image_size {
            return Err(ErrorCode::AddrExceeded);
        }

        let slot = self.active_slot().other();
        self.images.erase_image(slot)?;

        log::info!("firmware update: {} bytes into slot {}", len, slot.index());

        self.write = Some(WriteSession {
            target: WriteTarget::Firmware { slot, offset: addr },
            page_size: FW_UPDATE_PAGE_SIZE,
            include_spare: false,
            skip_bad: false,
            page: 0,
            expected: len,
            received: 0,
            acked: 0,
            absorb: false,
            buf: PageBuf::new(),
        });

        emit(transport, &Response::Ok);
        Ok(())
    }

    fn cmd_fw_update_end<T: DeviceTransport>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ErrorCode> {
        match &self.write {
            Some(s) if matches!(s.target, WriteTarget::Firmware { .. }) => {}
            _ => return Err(ErrorCode::CmdInvalid),
        }

        let session = self.write.take().ok_or(ErrorCode::CmdInvalid)?;
        if !session.buf.is_empty() {
            return Err(ErrorCode::NandWr);
        }

        // the atomic A/B switch: this is the only mutation of the boot
        // record, so power loss anywhere earlier keeps the old image
        let slot = self.boot.switch_image()?;
        self.active = Some(slot);
        log::info!("firmware update complete, active image {}", slot.index());

        emit(transport, &Response::Ok);
        Ok(())
    }

    // =========================================================================
    // Pending operation advancement
    // =========================================================================

    fn advance<T: DeviceTransport>(&mut self, transport: &mut T) -> Result<(), ErrorCode> {
        match core::mem::take(&mut self.pending) {
            Pending::None => Ok(()),
            Pending::Erase(op) => self.advance_erase(transport, op),
            Pending::Read(op) => self.advance_read(transport, op),
            Pending::Scan(op) => self.advance_scan(transport, op),
        }
    }
}

/// Which data-stream command a chunk arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Chip,
    Firmware,
}
