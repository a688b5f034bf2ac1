//! Buffered connection contract shared by every brick transport.
//!
//! A [`ConnectionBuffer`] presents a packet- or stream-oriented byte channel
//! over fixed-size input and output buffers. Application threads call
//! [`read`](ConnectionBuffer::read) / [`write`](ConnectionBuffer::write);
//! the owning transport moves bytes between the buffers and the wire with
//! [`pump_out`](ConnectionBuffer::pump_out) / [`pump_in`](ConnectionBuffer::pump_in)
//! and is told about new work through the [`Transport`] hooks.
//!
//! In packet mode every write is prefixed with a 2-byte little-endian length.
//! A zero-length packet is a soft end-of-file.

pub mod buffer;
pub mod error;
pub mod mode;
pub mod transport;

pub use buffer::{Available, BufferConfig, BufferStatus, ConnectionBuffer, Pump, DEFAULT_BUFFER_SIZE};
pub use error::{ConnError, Result};
pub use mode::{ConnState, IoMode};
pub use transport::Transport;
