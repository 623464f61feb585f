//! High-level programmer client
//!
//! Drives the device over a [`Transport`], pairing each command with its
//! terminal status while routing out-of-band notifications (bad blocks,
//! skips, progress, write acks) to an [`EventSink`]. The write path keeps
//! at most one page of unacknowledged data outstanding, which matches
//! the device's single asynchronous page buffer.

use pageprog_proto::command::{MAX_COMMAND_FRAME, MAX_DATA_LEN};
use pageprog_proto::{
    ChipGeometry, Command, Configure, DataChunk, FirmwareVersion, OpFlags, Response,
    ResponseDecoder, Span, CHIP_ID_LEN, FW_UPDATE_PAGE_SIZE,
};

use crate::error::{HostError, Result};
use crate::transport::Transport;

/// Transport poll granularity while waiting for a response
const POLL_INTERVAL_MS: u32 = 50;

/// How long to wait for any response frame before declaring the device
/// unresponsive. Long operations emit progress well within this.
const RESPONSE_TIMEOUT_MS: u32 = 10_000;

/// Observer for out-of-band notifications during an operation
pub trait EventSink {
    /// Cumulative progress of the running operation
    fn on_progress(&mut self, _bytes_done: u64, _bytes_total: u64) {}

    /// A block failed during the operation and was recorded as bad
    fn on_bad_block(&mut self, _addr: u32, _size: u32) {}

    /// A known-bad block was skipped
    fn on_bad_block_skipped(&mut self, _addr: u32, _size: u32) {}
}

/// Sink that ignores all notifications
pub struct NullSink;

impl EventSink for NullSink {}

/// A bad block reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadBlockInfo {
    /// Effective byte address of the block
    pub addr: u32,
    /// Effective block size in bytes
    pub size: u32,
}

/// Programmer client over a byte-stream transport
pub struct Programmer<T> {
    transport: T,
    decoder: ResponseDecoder,
    geometry: Option<ChipGeometry>,
}

impl<T: Transport> Programmer<T> {
    /// Create a client over an open transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: ResponseDecoder::new(),
            geometry: None,
        }
    }

    /// Geometry of the configured chip, if any
    pub fn geometry(&self) -> Option<&ChipGeometry> {
        self.geometry.as_ref()
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        let mut buf = [0u8; MAX_COMMAND_FRAME];
        let n = command.encode(&mut buf);
        self.transport.write(&buf[..n])?;
        self.transport.flush()
    }

    /// Block until the next response frame arrives
    fn next_response(&mut self) -> Result<Response> {
        loop {
            if let Some(response) = self.decoder.next()? {
                log::trace!("response {:?}", response);
                return Ok(response);
            }
            // the decoder holds at most one incomplete frame here, so a
            // transport packet always fits
            let mut buf = [0u8; 64];
            let mut waited = 0;
            let n = loop {
                let n = self.transport.read_nonblock(&mut buf, POLL_INTERVAL_MS)?;
                if n > 0 {
                    break n;
                }
                waited += POLL_INTERVAL_MS;
                if waited >= RESPONSE_TIMEOUT_MS {
                    return Err(HostError::Timeout);
                }
            };
            self.decoder.push(&buf[..n]);
        }
    }

    /// Wait for the terminal status of a command that produces nothing else
    fn expect_ok(&mut self, context: &'static str) -> Result<()> {
        match self.next_response()? {
            Response::Ok => Ok(()),
            Response::Error(code) => Err(HostError::Device(code)),
            _ => Err(HostError::UnexpectedFrame(context)),
        }
    }

    /// Run a query command that answers with one DATA frame and OK
    fn query(&mut self, command: &Command, context: &'static str) -> Result<Vec<u8>> {
        self.send(command)?;
        let payload = match self.next_response()? {
            Response::Data(data) => data.to_vec(),
            Response::Error(code) => return Err(HostError::Device(code)),
            _ => return Err(HostError::UnexpectedFrame(context)),
        };
        self.expect_ok(context)?;
        Ok(payload)
    }

    /// Configure the chip geometry and HAL parameters
    pub fn configure(&mut self, geometry: ChipGeometry, hal_config: &[u8]) -> Result<()> {
        let mut blob = heapless::Vec::new();
        blob.extend_from_slice(hal_config).map_err(|_| {
            HostError::InvalidParameter(format!(
                "HAL config blob too large ({} bytes)",
                hal_config.len()
            ))
        })?;
        self.send(&Command::Configure(Configure {
            geometry,
            hal_config: blob,
        }))?;
        self.expect_ok("configure")?;
        self.geometry = Some(geometry);
        Ok(())
    }

    /// Read the chip identification bytes
    pub fn read_id(&mut self) -> Result<[u8; CHIP_ID_LEN]> {
        let payload = self.query(&Command::ReadId, "read-id")?;
        payload
            .try_into()
            .map_err(|_| HostError::UnexpectedFrame("read-id"))
    }

    /// Query the device firmware version
    pub fn version(&mut self) -> Result<FirmwareVersion> {
        let payload = self.query(&Command::GetVersion, "get-version")?;
        FirmwareVersion::from_wire(&payload).ok_or(HostError::UnexpectedFrame("get-version"))
    }

    /// Query the active firmware image slot (0 or 1)
    pub fn active_image(&mut self) -> Result<u8> {
        let payload = self.query(&Command::GetActiveImage, "get-active-image")?;
        match payload.as_slice() {
            [slot] => Ok(*slot),
            _ => Err(HostError::UnexpectedFrame("get-active-image")),
        }
    }

    /// Erase a block range
    pub fn erase(&mut self, span: Span, sink: &mut dyn EventSink) -> Result<()> {
        self.send(&Command::Erase(span))?;
        loop {
            match self.next_response()? {
                Response::Ok => return Ok(()),
                Response::Error(code) => return Err(HostError::Device(code)),
                Response::Progress { bytes_done } => {
                    sink.on_progress(bytes_done as u64, span.len as u64)
                }
                Response::BadBlock { addr, size } => sink.on_bad_block(addr, size),
                Response::BadBlockSkipped { addr, size } => sink.on_bad_block_skipped(addr, size),
                Response::Data(_) | Response::WriteAck { .. } => {
                    return Err(HostError::UnexpectedFrame("erase"))
                }
            }
        }
    }

    /// Read a page range, collecting the data frames until the terminal
    /// status. With full-chip skipping the result is shorter than the
    /// requested length by the skipped blocks.
    pub fn read(&mut self, span: Span, sink: &mut dyn EventSink) -> Result<Vec<u8>> {
        self.send(&Command::Read(span))?;
        let mut out = Vec::with_capacity(span.len as usize);
        loop {
            match self.next_response()? {
                Response::Data(data) => {
                    out.extend_from_slice(&data);
                    sink.on_progress(out.len() as u64, span.len as u64);
                }
                Response::BadBlock { addr, size } => sink.on_bad_block(addr, size),
                Response::BadBlockSkipped { addr, size } => sink.on_bad_block_skipped(addr, size),
                Response::Ok => return Ok(out),
                Response::Error(code) => return Err(HostError::Device(code)),
                Response::Progress { .. } | Response::WriteAck { .. } => {
                    return Err(HostError::UnexpectedFrame("read"))
                }
            }
        }
    }

    /// Write `data` to the span, returning the number of bytes streamed.
    ///
    /// At most one page is kept unacknowledged; a BAD_BLOCK arriving while
    /// waiting re-arms the wait, since the acknowledgment it raced past
    /// now covers a reprogrammed page. A full-chip write shrinks by one
    /// block per skipped block and the tail of `data` is dropped to match.
    pub fn write(&mut self, span: Span, data: &[u8], sink: &mut dyn EventSink) -> Result<u64> {
        if data.len() != span.len as usize {
            return Err(HostError::InvalidParameter(format!(
                "data length {} does not match span length {}",
                data.len(),
                span.len
            )));
        }
        let geometry = self
            .geometry
            .ok_or_else(|| HostError::InvalidParameter("chip not configured".into()))?;
        let include_spare = span.flags.contains(OpFlags::INCLUDE_SPARE);
        let page = geometry.effective_page_size(include_spare) as u64;
        let absorb = span.len == geometry.effective_total_size(include_spare);

        self.send(&Command::WriteStart(span))?;
        self.expect_ok("write-start")?;

        let mut sent: u64 = 0;
        let mut acked: u64 = 0;
        let mut total = data.len() as u64;

        while sent < total {
            if sent - acked >= page {
                self.wait_write_ack(&mut acked, &mut total, absorb, sink)?;
                continue;
            }
            let window = page - (sent - acked);
            let n = (total - sent).min(window).min(MAX_DATA_LEN as u64) as usize;
            let mut chunk = DataChunk::new();
            // n <= MAX_DATA_LEN
            let _ = chunk.extend_from_slice(&data[sent as usize..sent as usize + n]);
            self.send(&Command::WriteData(chunk))?;
            sent += n as u64;
            sink.on_progress(sent, total);
        }

        self.send(&Command::WriteEnd)?;
        loop {
            match self.next_response()? {
                Response::Ok => return Ok(sent),
                Response::Error(code) => return Err(HostError::Device(code)),
                Response::WriteAck { .. } => {}
                Response::BadBlock { addr, size } => sink.on_bad_block(addr, size),
                Response::BadBlockSkipped { addr, size } => sink.on_bad_block_skipped(addr, size),
                Response::Data(_) | Response::Progress { .. } => {
                    return Err(HostError::UnexpectedFrame("write-end"))
                }
            }
        }
    }

    /// Block until the cumulative write acknowledgment advances
    fn wait_write_ack(
        &mut self,
        acked: &mut u64,
        total: &mut u64,
        absorb: bool,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        loop {
            match self.next_response()? {
                Response::WriteAck { bytes_acked } => {
                    *acked = bytes_acked as u64;
                    return Ok(());
                }
                // the failed page is being reprogrammed; keep waiting for
                // the acknowledgment that covers it
                Response::BadBlock { addr, size } => sink.on_bad_block(addr, size),
                Response::BadBlockSkipped { addr, size } => {
                    sink.on_bad_block_skipped(addr, size);
                    if absorb {
                        *total = (*total).saturating_sub(size as u64);
                    }
                }
                Response::Error(code) => return Err(HostError::Device(code)),
                Response::Ok | Response::Data(_) | Response::Progress { .. } => {
                    return Err(HostError::UnexpectedFrame("write-data"))
                }
            }
        }
    }

    /// Enumerate the device's bad blocks
    pub fn read_bad_blocks(&mut self, sink: &mut dyn EventSink) -> Result<Vec<BadBlockInfo>> {
        self.send(&Command::ReadBadBlocks)?;
        let mut blocks = Vec::new();
        loop {
            match self.next_response()? {
                Response::BadBlock { addr, size } => {
                    sink.on_bad_block(addr, size);
                    blocks.push(BadBlockInfo { addr, size });
                }
                Response::Ok => return Ok(blocks),
                Response::Error(code) => return Err(HostError::Device(code)),
                _ => return Err(HostError::UnexpectedFrame("read-bad-blocks")),
            }
        }
    }

    /// Stream a firmware image into the inactive slot and switch to it.
    ///
    /// The image is zero-padded to the update page granularity.
    pub fn fw_update(&mut self, image: &[u8], sink: &mut dyn EventSink) -> Result<()> {
        let page = FW_UPDATE_PAGE_SIZE as usize;
        let padded_len = image.len().div_ceil(page) * page;
        let mut padded = Vec::with_capacity(padded_len);
        padded.extend_from_slice(image);
        padded.resize(padded_len, 0);

        self.send(&Command::FwUpdateStart {
            addr: 0,
            len: padded_len as u32,
        })?;
        self.expect_ok("fw-update-start")?;

        let mut sent: u64 = 0;
        let mut acked: u64 = 0;
        let total = padded_len as u64;
        while sent < total {
            if sent - acked >= page as u64 {
                match self.next_response()? {
                    Response::WriteAck { bytes_acked } => acked = bytes_acked as u64,
                    Response::Error(code) => return Err(HostError::Device(code)),
                    _ => return Err(HostError::UnexpectedFrame("fw-update-data")),
                }
                continue;
            }
            let window = page as u64 - (sent - acked);
            let n = (total - sent).min(window).min(MAX_DATA_LEN as u64) as usize;
            let mut chunk = DataChunk::new();
            let _ = chunk.extend_from_slice(&padded[sent as usize..sent as usize + n]);
            self.send(&Command::FwUpdateData(chunk))?;
            sent += n as u64;
            sink.on_progress(sent, total);
        }

        self.send(&Command::FwUpdateEnd)?;
        loop {
            match self.next_response()? {
                Response::Ok => return Ok(()),
                Response::Error(code) => return Err(HostError::Device(code)),
                Response::WriteAck { .. } => {}
                _ => return Err(HostError::UnexpectedFrame("fw-update-end")),
            }
        }
    }
}
