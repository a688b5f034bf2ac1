//! Hardware link abstraction for the BC4 Bluetooth radio.
//!
//! The radio sits behind a single serial link plus two control lines:
//! - a mode line selecting command frames or raw stream bytes
//! - a reset line that power-cycles the chip
//!
//! This is the lowest layer of brickcomm. Everything else builds on top of
//! the [`HardwareLink`] capability defined here. Only the link arbiter in
//! `brickcomm-bt` ever touches a `HardwareLink`.

pub mod error;
pub mod events;
pub mod traits;

pub use error::{LinkError, Result};
pub use events::LinkEvents;
pub use traits::{ChipMode, HardwareLink, POLL_SLICE};
