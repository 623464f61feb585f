//! pageprog-host - Host-side client for the pageprog flash programmer
//!
//! Connects to a programmer over a serial device or TCP socket and
//! drives the page-programming protocol: chip configuration, erase,
//! read, write with bad-block handling, bad-block enumeration and A/B
//! firmware updates.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod device;
pub mod error;
pub mod transport;

pub use device::{BadBlockInfo, EventSink, NullSink, Programmer};
pub use error::{HostError, Result};
pub use transport::Transport;
