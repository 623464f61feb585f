//! Device-side transport adapter contract
//!
//! Wraps whatever byte-stream endpoint the firmware exposes (a USB-CDC
//! ring buffer in the reference hardware). The adapter has no retry
//! semantics of its own; the stream is assumed reliable and in-order.

/// Transport send failure (endpoint gone or ring full)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError;

/// Byte-stream endpoint polled by the dispatcher
pub trait DeviceTransport {
    /// Queue an outgoing frame
    fn send(&mut self, frame: &[u8]) -> Result<(), SendError>;

    /// Whether another frame can be queued without blocking
    fn send_ready(&self) -> bool;

    /// Borrow the bytes received since the last consume
    fn peek(&self) -> &[u8];

    /// Discard `n` bytes from the front of the receive buffer
    fn consume(&mut self, n: usize);
}
