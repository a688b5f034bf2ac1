//! Command/reply framing for the BC4 radio.
//!
//! While the link is in command mode every message exchanged with the chip
//! is a small frame:
//! - a 1-byte length covering everything after it
//! - a 1-byte opcode
//! - opcode-specific parameters
//! - a 2-byte big-endian checksum (commands cover the opcode and params,
//!   replies also cover the length byte)
//!
//! [`ReplyReader`] pulls whole replies off a [`HardwareLink`](brickcomm_link::HardwareLink);
//! [`write_frame`] pushes an encoded command out.

pub mod codec;
pub mod error;
pub mod opcode;
pub mod reader;
pub mod writer;

pub use codec::{
    checksum, decode_command, decode_frame, encode_frame, encode_reply, Direction, Frame, MAX_FRAME_SIZE,
    MAX_PARAMS, MIN_LENGTH,
};
pub use error::{FrameError, Result};
pub use opcode::opcode_name;
pub use reader::ReplyReader;
pub use writer::write_frame;
