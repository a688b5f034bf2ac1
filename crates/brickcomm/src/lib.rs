//! Bluetooth transport for the LEGO NXT brick.
//!
//! brickcomm drives the brick's BC4 radio chip over its single shared serial
//! link: one arbiter thread multiplexes the administrative command channel and
//! up to four buffered data connections, switching the chip between command
//! and stream mode as traffic demands.
//!
//! # Crate Structure
//!
//! - [`link`]: Hardware seam for the serial link and its control lines
//! - [`frame`]: Checksummed command frames and the opcode table
//! - [`conn`]: Per-connection buffers, packet and raw I/O modes
//! - [`bt`]: The engine: arbiter, channel table, administrative commands
//! - [`sim`]: Scripted in-process chip (behind `sim` feature)

/// Re-export hardware link types.
pub mod link {
    pub use brickcomm_link::*;
}

/// Re-export frame types.
pub mod frame {
    pub use brickcomm_frame::*;
}

/// Re-export connection buffer types.
pub mod conn {
    pub use brickcomm_conn::*;
}

/// Re-export engine types.
pub mod bt {
    pub use brickcomm_bt::*;
}

/// Re-export the simulated chip (requires `sim` feature).
#[cfg(feature = "sim")]
pub mod sim {
    pub use brickcomm_sim::*;
}

pub use brickcomm_bt::{Bluetooth, BtAddress, BtError, Connection, EngineConfig, IoMode};
