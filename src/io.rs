//! The seams between the bootloader core and the hardware it runs against.

use crate::Error;

/// The result of a single timed byte read on the serial link.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ByteOutcome {
    /// A byte arrived before the deadline.
    Got(u8),
    /// The deadline passed with nothing to read.
    Timeout,
}

/// A raw byte-at-a-time serial link.
///
/// This is the only interface the transfer protocol has to the UART. On the
/// target it is a thin wrapper over the UART driver; on a host it can be a
/// real serial port or a scripted fake.
pub trait BytePort {
    /// Reads one byte, waiting at most `timeout_ms` milliseconds for it.
    fn recv_byte(&mut self, timeout_ms: u32) -> Result<ByteOutcome, Error>;

    /// Writes one byte to the link.
    fn send_byte(&mut self, byte: u8) -> Result<(), Error>;
}

/// Visual transfer-progress feedback.
pub trait Indicator {
    fn set(&mut self, on: bool);
    fn toggle(&mut self);
}

/// Indicator for builds without one.
pub struct NoIndicator;

impl Indicator for NoIndicator {
    fn set(&mut self, _on: bool) {}

    fn toggle(&mut self) {}
}
