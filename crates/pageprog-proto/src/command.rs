//! Command frames (host -> device)
//!
//! Every command is a single logical frame: a one-byte opcode followed by
//! kind-specific fields, little-endian, no checksum. Frames are not
//! aligned to transport packets; the decoder reassembles them from an
//! arbitrarily fragmented byte stream.

use bitflags::bitflags;
use heapless::Vec;

use crate::error::ErrorCode;
use crate::geometry::ChipGeometry;

/// Largest single transport packet the protocol must tolerate
pub const TRANSPORT_MTU: usize = 64;

/// Maximum raw data bytes in a write-data / fw-update-data frame
/// (opcode + length byte leave this much of the MTU)
pub const MAX_DATA_LEN: usize = TRANSPORT_MTU - 2;

/// Maximum length of the opaque HAL configuration blob
pub const MAX_HAL_CONFIG_LEN: usize = 64;

/// Command opcodes
pub mod cmd {
    /// Read chip identification bytes
    pub const READ_ID: u8 = 0x00;
    /// Erase a block range
    pub const ERASE: u8 = 0x01;
    /// Read a page range
    pub const READ: u8 = 0x02;
    /// Open a write session
    pub const WRITE_START: u8 = 0x03;
    /// Stream data into the open write session
    pub const WRITE_DATA: u8 = 0x04;
    /// Close the write session
    pub const WRITE_END: u8 = 0x05;
    /// Configure chip geometry and HAL parameters
    pub const CONFIGURE: u8 = 0x06;
    /// Enumerate bad blocks
    pub const READ_BAD_BLOCKS: u8 = 0x07;
    /// Query firmware version
    pub const GET_VERSION: u8 = 0x08;
    /// Query the active firmware image slot
    pub const GET_ACTIVE_IMAGE: u8 = 0x09;
    /// Open a firmware update session
    pub const FW_UPDATE_START: u8 = 0x0A;
    /// Stream firmware image data
    pub const FW_UPDATE_DATA: u8 = 0x0B;
    /// Close the firmware update session and switch images
    pub const FW_UPDATE_END: u8 = 0x0C;
}

bitflags! {
    /// Flags carried by addressed operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u8 {
        /// Skip blocks listed in (or scanned into) the bad block table
        const SKIP_BAD_BLOCK = 0x01;
        /// Address the chip in spare-inclusive effective sizes
        const INCLUDE_SPARE = 0x02;
    }
}

/// Address range of an erase/read/write operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Start address in effective bytes
    pub addr: u32,
    /// Length in effective bytes
    pub len: u32,
    /// Operation flags
    pub flags: OpFlags,
}

/// Data chunk of a write-data frame
pub type DataChunk = Vec<u8, MAX_DATA_LEN>;

/// Configure command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configure {
    /// Chip geometry interpreted by the dispatcher
    pub geometry: ChipGeometry,
    /// HAL-specific blob forwarded verbatim (timings, command bytes)
    pub hal_config: Vec<u8, MAX_HAL_CONFIG_LEN>,
}

/// A decoded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read chip identification bytes
    ReadId,
    /// Erase a block range
    Erase(Span),
    /// Read a page range
    Read(Span),
    /// Open a write session
    WriteStart(Span),
    /// Stream data into the open write session
    WriteData(DataChunk),
    /// Close the write session
    WriteEnd,
    /// Configure chip geometry and HAL parameters
    Configure(Configure),
    /// Enumerate bad blocks
    ReadBadBlocks,
    /// Query firmware version
    GetVersion,
    /// Query the active firmware image slot
    GetActiveImage,
    /// Open a firmware update session against the flat image space
    FwUpdateStart {
        /// Offset within the image
        addr: u32,
        /// Total image length
        len: u32,
    },
    /// Stream firmware image data
    FwUpdateData(DataChunk),
    /// Close the firmware update session and switch images
    FwUpdateEnd,
}

impl Command {
    /// Wire opcode of this command
    pub fn code(&self) -> u8 {
        match self {
            Self::ReadId => cmd::READ_ID,
            Self::Erase(_) => cmd::ERASE,
            Self::Read(_) => cmd::READ,
            Self::WriteStart(_) => cmd::WRITE_START,
            Self::WriteData(_) => cmd::WRITE_DATA,
            Self::WriteEnd => cmd::WRITE_END,
            Self::Configure(_) => cmd::CONFIGURE,
            Self::ReadBadBlocks => cmd::READ_BAD_BLOCKS,
            Self::GetVersion => cmd::GET_VERSION,
            Self::GetActiveImage => cmd::GET_ACTIVE_IMAGE,
            Self::FwUpdateStart { .. } => cmd::FW_UPDATE_START,
            Self::FwUpdateData(_) => cmd::FW_UPDATE_DATA,
            Self::FwUpdateEnd => cmd::FW_UPDATE_END,
        }
    }

    /// Whether this command may only run against a configured chip.
    ///
    /// Configure itself and the device-identity queries are exempt;
    /// everything else must be rejected with `ChipNotConf` until a
    /// configure has succeeded.
    pub fn requires_configured(&self) -> bool {
        !matches!(
            self,
            Self::Configure(_) | Self::GetVersion | Self::GetActiveImage
        )
    }

    /// Encode into `out`, returning the frame length.
    ///
    /// `out` must hold at least [`MAX_COMMAND_FRAME`] bytes.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        out[0] = self.code();
        match self {
            Self::ReadId
            | Self::WriteEnd
            | Self::ReadBadBlocks
            | Self::GetVersion
            | Self::GetActiveImage
            | Self::FwUpdateEnd => 1,
            Self::Erase(span) | Self::Read(span) | Self::WriteStart(span) => {
                out[1..5].copy_from_slice(&span.addr.to_le_bytes());
                out[5..9].copy_from_slice(&span.len.to_le_bytes());
                out[9] = span.flags.bits();
                10
            }
            Self::WriteData(data) | Self::FwUpdateData(data) => {
                out[1] = data.len() as u8;
                out[2..2 + data.len()].copy_from_slice(data);
                2 + data.len()
            }
            Self::Configure(conf) => {
                let g = &conf.geometry;
                out[1..5].copy_from_slice(&g.page_size.to_le_bytes());
                out[5..9].copy_from_slice(&g.block_size.to_le_bytes());
                out[9..13].copy_from_slice(&g.total_size.to_le_bytes());
                out[13..17].copy_from_slice(&g.spare_size.to_le_bytes());
                out[17] = g.bad_block_mark_offset;
                out[18] = conf.hal_config.len() as u8;
                out[19..19 + conf.hal_config.len()].copy_from_slice(&conf.hal_config);
                19 + conf.hal_config.len()
            }
            Self::FwUpdateStart { addr, len } => {
                out[1..5].copy_from_slice(&addr.to_le_bytes());
                out[5..9].copy_from_slice(&len.to_le_bytes());
                9
            }
        }
    }
}

/// Largest possible encoded command frame (configure with a full HAL blob)
pub const MAX_COMMAND_FRAME: usize = 19 + MAX_HAL_CONFIG_LEN;

fn le_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn parse_span(buf: &[u8]) -> Span {
    Span {
        addr: le_u32(&buf[1..]),
        len: le_u32(&buf[5..]),
        flags: OpFlags::from_bits_truncate(buf[9]),
    }
}

/// Incremental command decoder
///
/// Accumulates stream bytes until a complete frame is available. A decode
/// error leaves the stream desynchronized, so the buffer is discarded and
/// the caller is expected to report the error to the host.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buf: Vec<u8, { 2 * MAX_COMMAND_FRAME }>,
}

impl CommandDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed stream bytes, returning how many were accepted
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let room = self.buf.capacity() - self.buf.len();
        let take = bytes.len().min(room);
        // capacity reserved above
        let _ = self.buf.extend_from_slice(&bytes[..take]);
        take
    }

    /// Discard all buffered bytes (stream resynchronization)
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Try to decode the next complete command frame
    pub fn next(&mut self) -> Result<Option<Command>, ErrorCode> {
        let need = match self.frame_len() {
            Ok(Some(n)) => n,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        if self.buf.len() < need {
            return Ok(None);
        }
        let result = Self::parse(&self.buf[..need]);
        match result {
            Ok(command) => {
                self.drain(need);
                Ok(Some(command))
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// Total frame length for the buffered opcode, or None if more header
    /// bytes are needed to determine it.
    fn frame_len(&self) -> Result<Option<usize>, ErrorCode> {
        let buf = &self.buf;
        let Some(&code) = buf.first() else {
            return Ok(None);
        };
        match code {
            cmd::READ_ID
            | cmd::WRITE_END
            | cmd::READ_BAD_BLOCKS
            | cmd::GET_VERSION
            | cmd::GET_ACTIVE_IMAGE
            | cmd::FW_UPDATE_END => Ok(Some(1)),
            cmd::ERASE | cmd::READ | cmd::WRITE_START => Ok(Some(10)),
            cmd::FW_UPDATE_START => Ok(Some(9)),
            cmd::WRITE_DATA | cmd::FW_UPDATE_DATA => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                if len as usize > MAX_DATA_LEN {
                    return Err(ErrorCode::CmdDataSize);
                }
                Ok(Some(2 + len as usize))
            }
            cmd::CONFIGURE => {
                let Some(&hal_len) = buf.get(18) else {
                    return Ok(None);
                };
                if hal_len as usize > MAX_HAL_CONFIG_LEN {
                    return Err(ErrorCode::CmdDataSize);
                }
                Ok(Some(19 + hal_len as usize))
            }
            _ => Err(ErrorCode::CmdInvalid),
        }
    }

    /// Parse a complete frame
    fn parse(frame: &[u8]) -> Result<Command, ErrorCode> {
        let command = match frame[0] {
            cmd::READ_ID => Command::ReadId,
            cmd::ERASE => Command::Erase(parse_span(frame)),
            cmd::READ => Command::Read(parse_span(frame)),
            cmd::WRITE_START => Command::WriteStart(parse_span(frame)),
            cmd::WRITE_END => Command::WriteEnd,
            cmd::READ_BAD_BLOCKS => Command::ReadBadBlocks,
            cmd::GET_VERSION => Command::GetVersion,
            cmd::GET_ACTIVE_IMAGE => Command::GetActiveImage,
            cmd::FW_UPDATE_END => Command::FwUpdateEnd,
            cmd::WRITE_DATA | cmd::FW_UPDATE_DATA => {
                let mut data = DataChunk::new();
                data.extend_from_slice(&frame[2..])
                    .map_err(|_| ErrorCode::CmdDataSize)?;
                if frame[0] == cmd::WRITE_DATA {
                    Command::WriteData(data)
                } else {
                    Command::FwUpdateData(data)
                }
            }
            cmd::CONFIGURE => {
                let geometry = ChipGeometry {
                    page_size: le_u32(&frame[1..]),
                    block_size: le_u32(&frame[5..]),
                    total_size: le_u32(&frame[9..]),
                    spare_size: le_u32(&frame[13..]),
                    bad_block_mark_offset: frame[17],
                };
                let mut hal_config = Vec::new();
                hal_config
                    .extend_from_slice(&frame[19..])
                    .map_err(|_| ErrorCode::CmdDataSize)?;
                Command::Configure(Configure {
                    geometry,
                    hal_config,
                })
            }
            cmd::FW_UPDATE_START => Command::FwUpdateStart {
                addr: le_u32(&frame[1..]),
                len: le_u32(&frame[5..]),
            },
            _ => return Err(ErrorCode::CmdInvalid),
        };
        Ok(command)
    }

    fn drain(&mut self, n: usize) {
        let remaining = self.buf.len() - n;
        self.buf.copy_within(n.., 0);
        self.buf.truncate(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Command {
        let mut dec = CommandDecoder::new();
        assert_eq!(dec.push(bytes), bytes.len());
        dec.next().unwrap().unwrap()
    }

    #[test]
    fn erase_frame_round_trip() {
        let command = Command::Erase(Span {
            addr: 0x0002_0000,
            len: 0x0006_0000,
            flags: OpFlags::SKIP_BAD_BLOCK,
        });
        let mut buf = [0u8; MAX_COMMAND_FRAME];
        let n = command.encode(&mut buf);
        assert_eq!(n, 10);
        assert_eq!(decode_one(&buf[..n]), command);
    }

    #[test]
    fn write_data_frame_round_trip() {
        let mut data = DataChunk::new();
        data.extend_from_slice(&[0xAA; 62]).unwrap();
        let command = Command::WriteData(data);
        let mut buf = [0u8; MAX_COMMAND_FRAME];
        let n = command.encode(&mut buf);
        assert_eq!(n, 64);
        assert_eq!(decode_one(&buf[..n]), command);
    }

    #[test]
    fn configure_frame_round_trip() {
        let mut hal_config = Vec::new();
        hal_config.extend_from_slice(&[1, 2, 3, 4]).unwrap();
        let command = Command::Configure(Configure {
            geometry: ChipGeometry {
                page_size: 2048,
                block_size: 131072,
                total_size: 268435456,
                spare_size: 64,
                bad_block_mark_offset: 0,
            },
            hal_config,
        });
        let mut buf = [0u8; MAX_COMMAND_FRAME];
        let n = command.encode(&mut buf);
        assert_eq!(n, 23);
        assert_eq!(decode_one(&buf[..n]), command);
    }

    #[test]
    fn frame_split_across_pushes() {
        let command = Command::WriteStart(Span {
            addr: 0,
            len: 4096,
            flags: OpFlags::empty(),
        });
        let mut buf = [0u8; MAX_COMMAND_FRAME];
        let n = command.encode(&mut buf);

        let mut dec = CommandDecoder::new();
        dec.push(&buf[..3]);
        assert_eq!(dec.next().unwrap(), None);
        dec.push(&buf[3..n]);
        assert_eq!(dec.next().unwrap(), Some(command));
        assert_eq!(dec.next().unwrap(), None);
    }

    #[test]
    fn two_frames_in_one_push() {
        let mut buf = [0u8; 2 * MAX_COMMAND_FRAME];
        let n1 = Command::ReadId.encode(&mut buf);
        let n2 = Command::GetVersion.encode(&mut buf[n1..]);

        let mut dec = CommandDecoder::new();
        dec.push(&buf[..n1 + n2]);
        assert_eq!(dec.next().unwrap(), Some(Command::ReadId));
        assert_eq!(dec.next().unwrap(), Some(Command::GetVersion));
        assert_eq!(dec.next().unwrap(), None);
    }

    #[test]
    fn unknown_opcode_rejected_and_resynced() {
        let mut dec = CommandDecoder::new();
        dec.push(&[0xEE, 0x01, 0x02]);
        assert_eq!(dec.next(), Err(ErrorCode::CmdInvalid));
        // buffer was discarded, decoder accepts a fresh frame
        let mut buf = [0u8; MAX_COMMAND_FRAME];
        let n = Command::ReadId.encode(&mut buf);
        dec.push(&buf[..n]);
        assert_eq!(dec.next().unwrap(), Some(Command::ReadId));
    }

    #[test]
    fn oversized_data_length_rejected() {
        let mut dec = CommandDecoder::new();
        dec.push(&[cmd::WRITE_DATA, 63]);
        assert_eq!(dec.next(), Err(ErrorCode::CmdDataSize));
    }
}
