//! pageprog-device - Device-side engine of the pageprog flash programmer
//!
//! Everything the MCU firmware needs above its hardware layer: the
//! command [`Dispatcher`], the [`FlashHal`] contract it drives, the
//! per-session [`BadBlockTable`] and the A/B boot image selector. The
//! firmware entry wires a concrete HAL and a USB-CDC transport adapter
//! into a dispatcher and calls [`Dispatcher::poll`] from its main loop.
//!
//! `no_std`; nothing here allocates.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bbt;
pub mod boot;
pub mod dispatcher;
pub mod hal;
pub mod transport;

pub use bbt::{BadBlockTable, BBT_CAPACITY};
pub use boot::{BootLayout, BootSelector, BootStorage, ImageSlot, ImageStorage};
pub use dispatcher::{Dispatcher, PAGE_BUF_CAPACITY, WRITE_POLL_CEILING};
pub use hal::{ChipId, FlashHal, FlashStatus};
pub use transport::{DeviceTransport, SendError};
