//! Link event bits.
//!
//! The low byte carries level-triggered hardware status reported by a
//! [`HardwareLink`](crate::HardwareLink). The high byte carries software
//! events raised by application threads to wake the arbiter.

use bitflags::bitflags;

bitflags! {
    /// A set of link events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LinkEvents: u16 {
        /// The chip has bytes for us.
        const READABLE = 0x01;
        /// The link can accept more output.
        const WRITABLE = 0x02;
        /// All output has left the transmitter.
        const WRITE_EMPTY = 0x04;
        /// The chip reports command mode.
        const CMD_MODE = 0x10;
        /// The chip reports stream mode.
        const STREAM_MODE = 0x20;
        /// A caller queued an administrative command.
        const NEW_CMD = 0x100;
        /// A caller queued stream output.
        const NEW_DATA = 0x200;
        /// A caller drained stream input.
        const NEW_SPACE = 0x400;
    }
}

impl LinkEvents {
    /// No events.
    pub const NONE: Self = Self::empty();
    /// Mask of the hardware status bits.
    pub const HARDWARE: Self = Self::from_bits_retain(0x00ff);
    /// Mask of the software event bits.
    pub const SOFTWARE: Self = Self::from_bits_retain(0xff00);
}
