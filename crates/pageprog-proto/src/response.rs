//! Response frames (device -> host)
//!
//! Two-byte header `code, info`. DATA frames (`code` 0) carry `info` raw
//! bytes; STATUS frames (`code` 1) interpret `info` as a sub-kind with a
//! fixed-size payload. STATUS frames other than OK/ERROR are out-of-band
//! notifications that may be interleaved with DATA at any point.

use core::fmt;

use heapless::Vec;

use crate::command::MAX_DATA_LEN;
use crate::error::ErrorCode;

/// Response frame codes
pub mod resp {
    /// Raw data frame
    pub const DATA: u8 = 0x00;
    /// Status frame
    pub const STATUS: u8 = 0x01;
}

/// STATUS sub-kinds (the `info` byte of a STATUS frame)
pub mod status {
    /// Operation finished successfully
    pub const OK: u8 = 0x00;
    /// Operation failed with an error code
    pub const ERROR: u8 = 0x01;
    /// A block failed and was recorded as bad
    pub const BAD_BLOCK: u8 = 0x02;
    /// Cumulative write acknowledgment
    pub const WRITE_ACK: u8 = 0x03;
    /// A known-bad block was skipped without touching hardware
    pub const BAD_BLOCK_SKIPPED: u8 = 0x04;
    /// Cumulative progress report
    pub const PROGRESS: u8 = 0x05;
}

/// Payload of a DATA frame
pub type DataPayload = Vec<u8, MAX_DATA_LEN>;

/// A decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Raw data
    Data(DataPayload),
    /// Terminal success
    Ok,
    /// Terminal failure with a device error code
    Error(ErrorCode),
    /// A block failed during the operation and was recorded as bad
    BadBlock {
        /// Effective byte address of the block
        addr: u32,
        /// Effective block size in bytes
        size: u32,
    },
    /// A known-bad block was skipped
    BadBlockSkipped {
        /// Effective byte address of the block
        addr: u32,
        /// Effective block size in bytes
        size: u32,
    },
    /// Cumulative bytes accepted by the device write session
    WriteAck {
        /// Total acknowledged bytes since write-start
        bytes_acked: u32,
    },
    /// Cumulative operation progress
    Progress {
        /// Total bytes completed so far
        bytes_done: u32,
    },
}

/// Largest possible encoded response frame (a full DATA frame)
pub const MAX_RESPONSE_FRAME: usize = 2 + MAX_DATA_LEN;

impl Response {
    /// Encode into `out`, returning the frame length.
    ///
    /// `out` must hold at least [`MAX_RESPONSE_FRAME`] bytes.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        match self {
            Self::Data(data) => {
                out[0] = resp::DATA;
                out[1] = data.len() as u8;
                out[2..2 + data.len()].copy_from_slice(data);
                2 + data.len()
            }
            Self::Ok => {
                out[0] = resp::STATUS;
                out[1] = status::OK;
                2
            }
            Self::Error(code) => {
                out[0] = resp::STATUS;
                out[1] = status::ERROR;
                out[2] = code.to_wire();
                3
            }
            Self::BadBlock { addr, size } | Self::BadBlockSkipped { addr, size } => {
                out[0] = resp::STATUS;
                out[1] = if matches!(self, Self::BadBlock { .. }) {
                    status::BAD_BLOCK
                } else {
                    status::BAD_BLOCK_SKIPPED
                };
                out[2..6].copy_from_slice(&addr.to_le_bytes());
                out[6..10].copy_from_slice(&size.to_le_bytes());
                10
            }
            Self::WriteAck { bytes_acked } => {
                out[0] = resp::STATUS;
                out[1] = status::WRITE_ACK;
                out[2..6].copy_from_slice(&bytes_acked.to_le_bytes());
                6
            }
            Self::Progress { bytes_done } => {
                out[0] = resp::STATUS;
                out[1] = status::PROGRESS;
                out[2..6].copy_from_slice(&bytes_done.to_le_bytes());
                6
            }
        }
    }
}

/// Response stream decode failure
///
/// Any of these means the stream may be desynchronized; the session must
/// be treated as fatal by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Unknown response code byte
    InvalidCode(u8),
    /// Unknown STATUS sub-kind
    InvalidStatus(u8),
    /// ERROR frame carried an unknown error byte
    InvalidErrorByte(u8),
    /// DATA frame declares more payload than a frame can carry
    OversizedData(u8),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCode(c) => write!(f, "invalid response code 0x{:02X}", c),
            Self::InvalidStatus(s) => write!(f, "invalid status sub-kind 0x{:02X}", s),
            Self::InvalidErrorByte(b) => write!(f, "unknown device error byte 0x{:02X}", b),
            Self::OversizedData(n) => write!(
                f,
                "DATA frame declares {} payload bytes, limit is {}",
                n, MAX_DATA_LEN
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for WireError {}

fn le_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Incremental response decoder
///
/// Buffers stream bytes until a complete frame is available. A frame may
/// arrive split across any number of transport reads.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    buf: Vec<u8, { 4 * MAX_RESPONSE_FRAME }>,
}

impl ResponseDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed stream bytes, returning how many were accepted
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let room = self.buf.capacity() - self.buf.len();
        let take = bytes.len().min(room);
        let _ = self.buf.extend_from_slice(&bytes[..take]);
        take
    }

    /// Try to decode the next complete response frame
    pub fn next(&mut self) -> Result<Option<Response>, WireError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let need = match (self.buf[0], self.buf[1]) {
            (resp::DATA, len) => {
                if len as usize > MAX_DATA_LEN {
                    return Err(WireError::OversizedData(len));
                }
                2 + len as usize
            }
            (resp::STATUS, status::OK) => 2,
            (resp::STATUS, status::ERROR) => 3,
            (resp::STATUS, status::BAD_BLOCK) | (resp::STATUS, status::BAD_BLOCK_SKIPPED) => 10,
            (resp::STATUS, status::WRITE_ACK) | (resp::STATUS, status::PROGRESS) => 6,
            (resp::STATUS, sub) => return Err(WireError::InvalidStatus(sub)),
            (code, _) => return Err(WireError::InvalidCode(code)),
        };
        if self.buf.len() < need {
            return Ok(None);
        }
        let frame = &self.buf[..need];
        let response = match (frame[0], frame[1]) {
            (resp::DATA, len) => {
                let mut data = DataPayload::new();
                // len was validated against MAX_DATA_LEN above
                let _ = data.extend_from_slice(&frame[2..2 + len as usize]);
                Response::Data(data)
            }
            (_, status::OK) => Response::Ok,
            (_, status::ERROR) => {
                let byte = frame[2];
                let code = ErrorCode::from_wire(byte).ok_or(WireError::InvalidErrorByte(byte))?;
                Response::Error(code)
            }
            (_, status::BAD_BLOCK) => Response::BadBlock {
                addr: le_u32(&frame[2..]),
                size: le_u32(&frame[6..]),
            },
            (_, status::BAD_BLOCK_SKIPPED) => Response::BadBlockSkipped {
                addr: le_u32(&frame[2..]),
                size: le_u32(&frame[6..]),
            },
            (_, status::WRITE_ACK) => Response::WriteAck {
                bytes_acked: le_u32(&frame[2..]),
            },
            (_, status::PROGRESS) => Response::Progress {
                bytes_done: le_u32(&frame[2..]),
            },
            _ => unreachable!(),
        };
        self.drain(need);
        Ok(Some(response))
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

    fn round_trip(response: Response) {
        let mut buf = [0u8; MAX_RESPONSE_FRAME];
        let n = response.encode(&mut buf);
        let mut dec = ResponseDecoder::new();
        dec.push(&buf[..n]);
        assert_eq!(dec.next().unwrap(), Some(response));
        assert_eq!(dec.next().unwrap(), None);
    }

    #[test]
    fn status_frames_round_trip() {
        round_trip(Response::Ok);
        round_trip(Response::Error(ErrorCode::ChipNotConf));
        round_trip(Response::BadBlock {
            addr: 0x0004_0000,
            size: 0x0002_0000,
        });
        round_trip(Response::BadBlockSkipped {
            addr: 0x0004_0000,
            size: 0x0002_0000,
        });
        round_trip(Response::WriteAck { bytes_acked: 4096 });
        round_trip(Response::Progress { bytes_done: 2048 });
    }

    #[test]
    fn data_frame_round_trip() {
        let mut data = DataPayload::new();
        data.extend_from_slice(&[0x5A; 62]).unwrap();
        round_trip(Response::Data(data));
    }

    #[test]
    fn fragmented_frame_reassembled() {
        let response = Response::BadBlock {
            addr: 0x1234_5678,
            size: 0x0002_0000,
        };
        let mut buf = [0u8; MAX_RESPONSE_FRAME];
        let n = response.encode(&mut buf);

        let mut dec = ResponseDecoder::new();
        for &byte in &buf[..n - 1] {
            dec.push(&[byte]);
            assert_eq!(dec.next().unwrap(), None);
        }
        dec.push(&buf[n - 1..n]);
        assert_eq!(dec.next().unwrap(), Some(response));
    }

    #[test]
    fn interleaved_status_and_data() {
        let mut stream = std::vec::Vec::new();
        let mut scratch = [0u8; MAX_RESPONSE_FRAME];

        let mut data = DataPayload::new();
        data.extend_from_slice(&[1, 2, 3]).unwrap();
        for response in [
            Response::Data(data),
            Response::Progress { bytes_done: 3 },
            Response::Ok,
        ] {
            let n = response.encode(&mut scratch);
            stream.extend_from_slice(&scratch[..n]);
        }

        let mut dec = ResponseDecoder::new();
        dec.push(&stream);
        assert!(matches!(dec.next().unwrap(), Some(Response::Data(_))));
        assert_eq!(
            dec.next().unwrap(),
            Some(Response::Progress { bytes_done: 3 })
        );
        assert_eq!(dec.next().unwrap(), Some(Response::Ok));
    }

    #[test]
    fn invalid_code_is_fatal() {
        let mut dec = ResponseDecoder::new();
        dec.push(&[0x7F, 0x00]);
        assert_eq!(dec.next(), Err(WireError::InvalidCode(0x7F)));
    }

    #[test]
    fn oversized_data_length_is_fatal() {
        // a declared length past the frame limit must fail, not truncate
        let mut dec = ResponseDecoder::new();
        let mut stream = std::vec::Vec::from([resp::DATA, 100]);
        stream.extend_from_slice(&[0xAB; 100]);
        dec.push(&stream);
        assert_eq!(dec.next(), Err(WireError::OversizedData(100)));

        // 255 would also outgrow the accumulator and stall forever
        let mut dec = ResponseDecoder::new();
        dec.push(&[resp::DATA, 255]);
        assert_eq!(dec.next(), Err(WireError::OversizedData(255)));
    }
}
