//! Device error taxonomy
//!
//! Every error the device can report travels on the wire as a negative
//! code in a single byte (two's complement). The host surfaces these
//! verbatim.

use core::fmt;

/// Device-reported error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ErrorCode {
    /// Internal device error
    Internal = -1,
    /// Address plus length runs past the end of the chip
    AddrExceeded = -2,
    /// Address is not valid for the configured chip
    AddrInvalid = -3,
    /// Address is not aligned to the effective page/block size
    AddrNotAligned = -4,
    /// Flash program operation failed or timed out
    NandWr = -5,
    /// Flash read operation failed
    NandRd = -6,
    /// Flash erase operation failed
    NandErase = -7,
    /// Operation requires a configured chip
    ChipNotConf = -8,
    /// Command payload size does not match the command
    CmdDataSize = -9,
    /// Unknown or out-of-sequence command
    CmdInvalid = -10,
    /// Device buffer capacity exceeded
    BufOverflow = -11,
    /// Length is not aligned to the effective page/block size
    LenNotAligned = -12,
    /// Length runs past the declared transfer size
    LenExceeded = -13,
    /// Length is not valid for the operation
    LenInvalid = -14,
    /// Bad block table is full
    BbtOverflow = -15,
}

impl ErrorCode {
    /// Wire representation (two's complement in one byte)
    pub fn to_wire(self) -> u8 {
        self as i8 as u8
    }

    /// Decode a wire byte back into an error code
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte as i8 {
            -1 => Some(Self::Internal),
            -2 => Some(Self::AddrExceeded),
            -3 => Some(Self::AddrInvalid),
            -4 => Some(Self::AddrNotAligned),
            -5 => Some(Self::NandWr),
            -6 => Some(Self::NandRd),
            -7 => Some(Self::NandErase),
            -8 => Some(Self::ChipNotConf),
            -9 => Some(Self::CmdDataSize),
            -10 => Some(Self::CmdInvalid),
            -11 => Some(Self::BufOverflow),
            -12 => Some(Self::LenNotAligned),
            -13 => Some(Self::LenExceeded),
            -14 => Some(Self::LenInvalid),
            -15 => Some(Self::BbtOverflow),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal device error"),
            Self::AddrExceeded => write!(f, "address exceeds chip size"),
            Self::AddrInvalid => write!(f, "invalid address"),
            Self::AddrNotAligned => write!(f, "address not aligned"),
            Self::NandWr => write!(f, "flash write failed"),
            Self::NandRd => write!(f, "flash read failed"),
            Self::NandErase => write!(f, "flash erase failed"),
            Self::ChipNotConf => write!(f, "chip not configured"),
            Self::CmdDataSize => write!(f, "command payload size wrong"),
            Self::CmdInvalid => write!(f, "invalid command"),
            Self::BufOverflow => write!(f, "device buffer overflow"),
            Self::LenNotAligned => write!(f, "length not aligned"),
            Self::LenExceeded => write!(f, "length exceeds transfer size"),
            Self::LenInvalid => write!(f, "invalid length"),
            Self::BbtOverflow => write!(f, "bad block table overflow"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for code in [
            ErrorCode::Internal,
            ErrorCode::AddrExceeded,
            ErrorCode::NandWr,
            ErrorCode::ChipNotConf,
            ErrorCode::BbtOverflow,
        ] {
            assert_eq!(ErrorCode::from_wire(code.to_wire()), Some(code));
        }
    }

    #[test]
    fn unknown_wire_byte() {
        assert_eq!(ErrorCode::from_wire(0x00), None);
        assert_eq!(ErrorCode::from_wire(0x7F), None);
    }
}
