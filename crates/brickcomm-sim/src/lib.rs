//! A simulated BC4 radio chip.
//!
//! [`SimChip`] implements [`HardwareLink`](brickcomm_link::HardwareLink) and
//! answers the administrative command protocol the way the real chip does:
//! command frames are parsed while the mode line selects command mode, a
//! stream opened with `OPEN_STREAM` carries raw payload for one remote peer,
//! and the reset line reboots the chip.
//!
//! The paired [`SimController`] stays with the test (or CLI) and scripts the
//! outside world: devices in range, inbound connection requests, remote peers
//! sending and receiving data, and faults such as a mute chip, a corrupted
//! reply or a spontaneous reboot.
//!
//! ```no_run
//! use brickcomm_sim::{SimChip, SimConfig, SimDevice};
//!
//! let (chip, controller) = SimChip::new(SimConfig::default());
//! controller.add_device(SimDevice::new([0x00, 0x16, 0x53, 0x0a, 0x0b, 0x0c], "rover").echoing());
//! // hand `chip` to the engine, keep `controller` for scripting
//! # drop(chip);
//! ```

mod chip;
mod config;
mod controller;
mod state;

pub use chip::SimChip;
pub use config::{SimConfig, SimDevice};
pub use controller::{SimController, SimRemote, SimStats};
