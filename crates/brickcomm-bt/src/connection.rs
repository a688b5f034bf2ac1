use std::io;

use brickcomm_conn::{Available, BufferStatus, ConnError, ConnState, IoMode};
use brickcomm_link::LinkEvents;
use tracing::debug;

use crate::address::BtAddress;
use crate::bluetooth::Bluetooth;
use crate::channel::{Channel, SwitchPolicy};
use crate::error::Result;

/// An open Bluetooth connection.
///
/// Bound to one channel slot for one epoch: once the slot is closed and
/// re-used, every call on this handle reports [`ConnError::NotConnected`].
/// Dropping the handle closes the connection.
pub struct Connection {
    bt: Bluetooth,
    index: usize,
    epoch: u64,
}

impl Connection {
    pub(crate) fn new(bt: Bluetooth, index: usize, epoch: u64) -> Self {
        Self { bt, index, epoch }
    }

    fn channel(&self) -> std::result::Result<&Channel, ConnError> {
        let chan = &self.bt.engine().channels[self.index];
        if chan.buffer.epoch() != self.epoch {
            return Err(ConnError::NotConnected);
        }
        Ok(chan)
    }

    /// The chip handle carrying this connection.
    pub fn handle(&self) -> u8 {
        // Handles are 0..4.
        self.index as u8
    }

    pub fn address(&self) -> Option<BtAddress> {
        self.channel().ok().and_then(Channel::address)
    }

    pub fn state(&self) -> ConnState {
        self.channel().map_or(ConnState::Idle, |c| c.buffer.state())
    }

    pub fn status(&self) -> std::result::Result<BufferStatus, ConnError> {
        Ok(self.channel()?.buffer.status())
    }

    /// Read up to `buf.len()` bytes. With `wait` false, returns 0 when
    /// nothing is buffered.
    pub fn read(&self, buf: &mut [u8], wait: bool) -> std::result::Result<usize, ConnError> {
        self.channel()?.buffer.read(buf, wait)
    }

    /// Queue `data` for sending. With `wait`, blocks until all of it is
    /// buffered and sent.
    pub fn write(&self, data: &[u8], wait: bool) -> std::result::Result<usize, ConnError> {
        self.channel()?.buffer.write(data, wait)
    }

    pub fn available(&self, what: Available) -> std::result::Result<usize, ConnError> {
        self.channel()?.buffer.available(what)
    }

    /// Read one whole packet, or nothing. Never blocks.
    pub fn read_packet(&self, buf: &mut [u8]) -> std::result::Result<usize, ConnError> {
        self.channel()?.buffer.read_packet(buf)
    }

    /// Queue one whole packet, or nothing. Never blocks.
    pub fn send_packet(&self, buf: &[u8]) -> std::result::Result<usize, ConnError> {
        self.channel()?.buffer.send_packet(buf)
    }

    pub fn io_mode(&self) -> IoMode {
        self.channel().map_or(IoMode::default(), |c| c.buffer.io_mode())
    }

    pub fn set_io_mode(&self, mode: IoMode) -> std::result::Result<(), ConnError> {
        self.channel()?.buffer.set_io_mode(mode);
        Ok(())
    }

    pub fn switch_policy(&self) -> SwitchPolicy {
        self.channel().map_or(SwitchPolicy::default(), Channel::policy)
    }

    /// Control whether the arbiter switches to this connection only to
    /// look for input.
    pub fn set_switch_policy(&self, policy: SwitchPolicy) -> std::result::Result<(), ConnError> {
        self.channel()?.set_policy(policy);
        self.bt.engine().events.notify(LinkEvents::NEW_CMD);
        Ok(())
    }

    /// Link quality (0-255).
    pub fn signal_strength(&self) -> Result<u8> {
        self.channel()?;
        self.bt.signal_strength(self.handle())
    }

    /// Close the connection, flushing pending output first. Idempotent.
    pub fn close(&self) {
        let Ok(chan) = self.channel() else {
            return;
        };
        if chan.buffer.state() != ConnState::Idle {
            debug!(handle = self.index, "closing connection");
            chan.buffer.close();
        }
    }
}

impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Connection::read(self, buf, true) {
            Ok(n) => Ok(n),
            Err(ConnError::Eof) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Connection::write(self, buf, true).map_err(io::Error::from)
    }

    /// Writes already block until sent.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.index)
            .field("epoch", &self.epoch)
            .field("state", &self.state())
            .finish()
    }
}
