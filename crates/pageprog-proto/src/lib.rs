//! pageprog-proto - Wire protocol for the pageprog flash programmer
//!
//! Shared between the device dispatcher and the host reader/writer pair.
//! The protocol is a little-endian request/response framing over a
//! reliable in-order byte stream (USB-CDC serial in the reference
//! transport), with out-of-band STATUS notifications interleaved into
//! the response stream.
//!
//! The crate is `no_std` compatible; the `std` feature adds
//! `std::error::Error` implementations for host use.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod command;
pub mod error;
pub mod geometry;
pub mod response;

pub use command::{Command, CommandDecoder, Configure, DataChunk, OpFlags, Span};
pub use error::ErrorCode;
pub use geometry::ChipGeometry;
pub use response::{Response, ResponseDecoder, WireError};

/// Number of chip identification bytes returned by read-id
pub const CHIP_ID_LEN: usize = 5;

/// Page granularity of the firmware-update data stream.
///
/// The device accumulates fw-update-data into pages of this size and the
/// host writer uses it as its acknowledgment window, so both sides must
/// agree on it.
pub const FW_UPDATE_PAGE_SIZE: u32 = 1024;

/// Device firmware version as carried by the get-version response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Patch version
    pub patch: u8,
}

impl FirmwareVersion {
    /// Wire size of the version payload (one reserved byte at the end)
    pub const WIRE_LEN: usize = 4;

    /// Encode as a get-version DATA payload
    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        [self.major, self.minor, self.patch, 0]
    }

    /// Decode a get-version DATA payload
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            major: bytes[0],
            minor: bytes[1],
            patch: bytes[2],
        })
    }
}

impl core::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_wire_round_trip() {
        let v = FirmwareVersion {
            major: 1,
            minor: 4,
            patch: 2,
        };
        assert_eq!(FirmwareVersion::from_wire(&v.to_wire()), Some(v));
        assert_eq!(FirmwareVersion::from_wire(&[1, 2]), None);
    }
}
