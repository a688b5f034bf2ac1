use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{ConnError, Result};
use crate::mode::{ConnState, IoMode};
use crate::transport::Transport;

/// Default size of each of the input and output buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Interval used while polling during close.
const CLOSE_POLL: Duration = Duration::from_millis(1);

/// What [`ConnectionBuffer::available`] should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Available {
    /// Bytes that can be read without blocking.
    Ready,
    /// Bytes still to be read from the current packet.
    PacketRemaining,
    /// Total length of the current packet.
    PacketLength,
}

/// What a pump needs before it can make further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Waiting on the application (more output, or room for input).
    AwaitCaller,
    /// Waiting on the link (room to transmit, or bytes to receive).
    AwaitLink,
}

/// Sizing and close timing for a connection buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Size of each of the input and output buffers.
    pub capacity: usize,
    /// Largest packet a single write may produce.
    pub max_packet: usize,
    /// Time allowed on close for pending output to drain.
    pub close_flush: Duration,
    /// Time allowed on close for the peer's own EOF packet.
    pub close_eof: Duration,
    /// Time allowed on close for the transport to confirm the link is down.
    pub close_release: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_SIZE,
            max_packet: 0xffff,
            close_flush: Duration::from_millis(1000),
            close_eof: Duration::from_millis(500),
            close_release: Duration::from_millis(5000),
        }
    }
}

/// Point-in-time view used by transports when scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    pub state: ConnState,
    /// Output bytes not yet handed to the link.
    pub pending_output: usize,
    /// Input bytes not yet read by the application.
    pub buffered_input: usize,
    /// Size of the input buffer (0 while idle).
    pub capacity: usize,
}

struct Inner {
    state: ConnState,
    mode: IoMode,
    header: usize,
    input: Vec<u8>,
    in_cnt: usize,
    in_offset: usize,
    output: Vec<u8>,
    out_cnt: usize,
    out_offset: usize,
    /// Negative while header bytes of the next packet are still unread.
    pkt_offset: isize,
    pkt_len: usize,
    epoch: u64,
}

impl Inner {
    fn set_header(&mut self, header: usize) {
        self.header = header;
        self.pkt_offset = -(header as isize);
        self.pkt_len = 0;
    }

    fn pending_output(&self) -> usize {
        self.out_cnt - self.out_offset
    }

    fn drop_output(&mut self) {
        self.out_cnt = 0;
        self.out_offset = 0;
    }
}

/// A buffered, optionally packet-framed byte channel.
///
/// All methods take `&self`; the buffer is shared between application
/// threads and the transport worker behind its own lock.
pub struct ConnectionBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    transport: Arc<dyn Transport>,
    config: BufferConfig,
}

impl ConnectionBuffer {
    /// Create an idle buffer owned by `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: BufferConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnState::Idle,
                mode: IoMode::Packet,
                header: 0,
                input: Vec::new(),
                in_cnt: 0,
                in_offset: 0,
                output: Vec::new(),
                out_cnt: 0,
                out_offset: 0,
                pkt_offset: 0,
                pkt_len: 0,
                epoch: 0,
            }),
            cond: Condvar::new(),
            transport,
            config,
        }
    }

    /// Allocate buffers and mark the connection open.
    ///
    /// Returns the new epoch, which changes every time the slot is bound.
    pub fn bind(&self, mode: IoMode) -> u64 {
        let mut st = self.inner.lock();
        st.input = vec![0; self.config.capacity];
        st.output = vec![0; self.config.capacity];
        st.in_cnt = 0;
        st.in_offset = 0;
        st.drop_output();
        st.mode = mode;
        st.set_header(mode.header_size());
        st.state = ConnState::Connected;
        st.epoch += 1;
        self.cond.notify_all();
        st.epoch
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Bind generation of the current connection.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn io_mode(&self) -> IoMode {
        self.inner.lock().mode
    }

    /// Switch framing. Any partially read packet header is forgotten.
    pub fn set_io_mode(&self, mode: IoMode) {
        let mut st = self.inner.lock();
        st.mode = mode;
        st.set_header(mode.header_size());
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn status(&self) -> BufferStatus {
        let st = self.inner.lock();
        BufferStatus {
            state: st.state,
            pending_output: st.pending_output(),
            buffered_input: st.in_cnt,
            capacity: st.input.len(),
        }
    }

    /// Write `data`, optionally blocking until it is all buffered and sent.
    ///
    /// In packet mode the payload is truncated to the maximum packet size
    /// and prefixed with its length. Without `wait`, returns `Ok(0)` if
    /// output is still pending or a packet would not fit whole, so a packet
    /// never straddles two non-blocking calls. In raw mode a non-blocking
    /// write buffers as much as fits.
    pub fn write(&self, data: &[u8], wait: bool) -> Result<usize> {
        let mut st = self.inner.lock();
        self.write_locked(&mut st, data, wait)
    }

    /// Read into `buf`, optionally blocking until at least one byte arrives.
    ///
    /// In packet mode at most one packet is returned per call; a packet
    /// larger than `buf` is returned over several calls. A zero-length
    /// packet switches the connection to EOF.
    pub fn read(&self, buf: &mut [u8], wait: bool) -> Result<usize> {
        let mut st = self.inner.lock();
        let len = buf.len();
        self.read_locked(&mut st, Some(buf), len, wait)
    }

    /// Report buffered input according to `what`.
    pub fn available(&self, what: Available) -> Result<usize> {
        let mut st = self.inner.lock();
        self.available_locked(&mut st, what)
    }

    /// Read one whole packet without blocking.
    ///
    /// A packet smaller than the buffer is only returned once all of it has
    /// arrived; otherwise returns `Ok(0)`.
    pub fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.inner.lock();
        let pkt = self.available_locked(&mut st, Available::PacketRemaining)?;
        if pkt < self.config.capacity && self.available_locked(&mut st, Available::Ready)? < pkt {
            return Ok(0);
        }
        let len = buf.len();
        self.read_locked(&mut st, Some(buf), len, false)
    }

    /// Queue one whole packet without blocking. Returns `Ok(0)` if it does
    /// not fit in the output buffer.
    pub fn send_packet(&self, buf: &[u8]) -> Result<usize> {
        let mut st = self.inner.lock();
        if buf.len() > self.config.capacity.saturating_sub(st.header) {
            return Ok(0);
        }
        self.write_locked(&mut st, buf, false)
    }

    /// Close the connection.
    ///
    /// Gives pending output a bounded time to drain (sending a soft EOF in
    /// packet mode when the transport uses one), asks the transport to drop
    /// the link, waits a bounded time for confirmation and finally frees the
    /// buffers. Always ends in [`ConnState::Idle`].
    pub fn close(&self) {
        let eof_expected = {
            let mut st = self.inner.lock();
            if st.state == ConnState::Idle {
                return;
            }
            let mut eof_expected = false;
            if st.state.is_open() {
                if self.transport.sends_eof() && st.header > 0 {
                    self.send_eof(&mut st);
                }
                eof_expected = st.state != ConnState::Eof && st.header > 0;
                st.state = ConnState::Disconnecting;
            }
            eof_expected
        };

        // Let queued output go, discarding input meanwhile.
        self.linger(self.config.close_flush, true);
        if eof_expected {
            self.linger(self.config.close_eof, false);
        }

        let need_disconnect = {
            let mut st = self.inner.lock();
            st.drop_output();
            if st.state == ConnState::Eof {
                st.state = ConnState::Disconnecting;
            }
            st.state == ConnState::Disconnecting
        };
        if need_disconnect && !self.transport.disconnect(self) {
            self.disconnected();
        }

        let mut st = self.inner.lock();
        let deadline = Instant::now() + self.config.close_release;
        while st.state.is_live() {
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                warn!("transport did not confirm close, forcing disconnect");
                st.state = ConnState::Disconnected;
                break;
            }
        }
        st.state = ConnState::Idle;
        st.input = Vec::new();
        st.output = Vec::new();
        st.in_cnt = 0;
        st.in_offset = 0;
        st.drop_output();
        self.cond.notify_all();
        debug!(epoch = st.epoch, "connection closed");
    }

    /// Mark the link as gone and wake every waiter.
    ///
    /// Returns false if the connection was already down. Pending output is
    /// dropped; buffered input stays readable.
    pub fn disconnected(&self) -> bool {
        let mut st = self.inner.lock();
        self.cond.notify_all();
        if !st.state.is_live() {
            return false;
        }
        st.state = ConnState::Disconnected;
        st.drop_output();
        true
    }

    /// Force the connection down after a transport reset.
    pub fn reset(&self) {
        let mut st = self.inner.lock();
        if st.state != ConnState::Idle {
            st.state = ConnState::Disconnected;
            st.drop_output();
        }
        self.cond.notify_all();
    }

    /// Flag that the transport had to throw input away.
    ///
    /// Packet framing restarts at the next header.
    pub fn mark_data_lost(&self) {
        let mut st = self.inner.lock();
        if st.state == ConnState::Connected {
            st.state = ConnState::DataLost;
            let header = st.header;
            st.set_header(header);
        }
    }

    /// Throw away everything currently buffered for reading.
    pub fn discard_input(&self) -> usize {
        let mut st = self.inner.lock();
        let cap = st.input.len();
        let mut total = 0;
        while let Ok(n) = self.read_locked(&mut st, None, cap, false) {
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    /// Hand pending output to `sink`, which returns how many bytes it took.
    pub fn pump_out<E>(&self, mut sink: impl FnMut(&[u8]) -> std::result::Result<usize, E>) -> std::result::Result<Pump, E> {
        let mut st = self.inner.lock();
        if st.out_offset >= st.out_cnt {
            return Ok(Pump::AwaitCaller);
        }
        let (start, end) = (st.out_offset, st.out_cnt);
        let sent = sink(&st.output[start..end])?;
        st.out_offset += sent;
        if st.out_offset >= st.out_cnt {
            st.drop_output();
            self.cond.notify_all();
            return Ok(Pump::AwaitCaller);
        }
        Ok(Pump::AwaitLink)
    }

    /// Fill the input buffer from `source`, which returns how many bytes it
    /// wrote into the slice it was given (0 when nothing is pending).
    pub fn pump_in<E>(&self, mut source: impl FnMut(&mut [u8]) -> std::result::Result<usize, E>) -> std::result::Result<Pump, E> {
        let mut st = self.inner.lock();
        let cap = st.input.len();
        if cap == 0 {
            return Ok(Pump::AwaitCaller);
        }
        while st.in_cnt < cap {
            if st.in_cnt == 0 {
                st.in_offset = 0;
            }
            let offset = (st.in_offset + st.in_cnt) % cap;
            let len = if offset >= st.in_offset {
                cap - offset
            } else {
                st.in_offset - offset
            };
            let got = source(&mut st.input[offset..offset + len])?;
            if got == 0 {
                break;
            }
            st.in_cnt += got;
        }
        if st.in_cnt > 0 {
            self.cond.notify_all();
        }
        Ok(if st.in_cnt >= cap {
            Pump::AwaitCaller
        } else {
            Pump::AwaitLink
        })
    }

    fn write_locked(&self, st: &mut MutexGuard<'_, Inner>, data: &[u8], wait: bool) -> Result<usize> {
        let state = st.state;
        match state {
            ConnState::DataLost => {
                st.state = ConnState::Connected;
                return Err(ConnError::DataLost);
            }
            ConnState::Idle => return Err(ConnError::NotConnected),
            state if !state.is_open() => return Err(ConnError::Closed),
            _ => {}
        }
        if st.out_cnt > 0 && !wait {
            return Ok(0);
        }

        let len = data.len().min(self.config.max_packet);
        let header = st.header;
        if !wait && header > 0 && header + len > st.output.len() {
            return Ok(0);
        }

        let mut hdr = len;
        let mut offset = -(header as isize);
        'io: while offset < len as isize {
            while st.out_cnt >= st.output.len() {
                if !wait && header == 0 {
                    break 'io;
                }
                self.transport.output_queued();
                self.cond.wait(st);
                if !st.state.is_open() {
                    return Err(ConnError::Closed);
                }
            }
            if offset < 0 {
                let at = st.out_cnt;
                st.output[at] = hdr as u8;
                hdr >>= 8;
                st.out_cnt += 1;
                offset += 1;
            } else {
                let from = offset as usize;
                let at = st.out_cnt;
                let cnt = (st.output.len() - at).min(len - from);
                st.output[at..at + cnt].copy_from_slice(&data[from..from + cnt]);
                st.out_cnt += cnt;
                offset += cnt as isize;
            }
        }

        self.flush_locked(st, wait)?;
        Ok(offset.max(0) as usize)
    }

    fn flush_locked(&self, st: &mut MutexGuard<'_, Inner>, wait: bool) -> Result<()> {
        if st.pending_output() == 0 {
            return Ok(());
        }
        self.transport.output_queued();
        if wait {
            while st.pending_output() > 0 && st.state.is_live() {
                self.cond.wait(st);
            }
            if !st.state.is_live() {
                return Err(ConnError::Closed);
            }
        }
        Ok(())
    }

    fn fill_locked(&self, st: &mut MutexGuard<'_, Inner>, wait: bool) {
        if st.in_cnt > 0 {
            return;
        }
        self.transport.input_wanted();
        if wait {
            self.cond.wait(st);
        }
    }

    fn read_locked(
        &self,
        st: &mut MutexGuard<'_, Inner>,
        mut data: Option<&mut [u8]>,
        out_len: usize,
        mut wait: bool,
    ) -> Result<usize> {
        let state = st.state;
        match state {
            ConnState::Idle => return Err(ConnError::NotConnected),
            ConnState::DataLost => {
                st.state = ConnState::Connected;
                return Err(ConnError::DataLost);
            }
            ConnState::Eof => {
                st.in_cnt = 0;
                st.in_offset = 0;
                return Err(ConnError::Eof);
            }
            _ => {}
        }
        self.fill_locked(st, false);
        if st.state == ConnState::Disconnected && st.in_cnt == 0 {
            return Err(ConnError::Eof);
        }
        if !wait && st.in_cnt == 0 {
            return Ok(0);
        }

        let header = st.header;
        let cap = st.input.len();
        if header == 0 {
            st.pkt_offset = 0;
            st.pkt_len = out_len;
        }
        let mut offset = 0;
        'io: while st.pkt_offset < st.pkt_len as isize {
            while st.in_cnt == 0 {
                if !wait {
                    return Ok(offset);
                }
                if st.state != ConnState::Connected {
                    if offset > 0 {
                        break 'io;
                    }
                    let state = st.state;
                    return Err(match state {
                        ConnState::Disconnected => ConnError::Eof,
                        ConnState::DataLost => {
                            st.state = ConnState::Connected;
                            ConnError::DataLost
                        }
                        _ => ConnError::NotConnected,
                    });
                }
                self.fill_locked(st, true);
            }
            if st.pkt_offset < 0 {
                let byte = st.input[st.in_offset] as usize;
                let shift = (header as isize + st.pkt_offset) * 8;
                st.pkt_len += byte << shift;
                st.pkt_offset += 1;
                st.in_offset += 1;
                st.in_cnt -= 1;
            } else {
                if offset >= out_len {
                    return Ok(offset);
                }
                let contiguous = if st.in_offset + st.in_cnt > cap {
                    cap - st.in_offset
                } else {
                    st.in_cnt
                };
                let n = contiguous
                    .min(out_len - offset)
                    .min(st.pkt_len - st.pkt_offset as usize);
                if let Some(out) = data.as_deref_mut() {
                    let from = st.in_offset;
                    out[offset..offset + n].copy_from_slice(&st.input[from..from + n]);
                }
                offset += n;
                st.in_offset += n;
                st.pkt_offset += n as isize;
                st.in_cnt -= n;
                if header == 0 {
                    wait = false;
                }
            }
            st.in_offset %= cap;
        }

        st.pkt_offset = -(header as isize);
        st.pkt_len = 0;
        if header > 0 && offset == 0 {
            st.state = ConnState::Eof;
            return Err(ConnError::Eof);
        }
        Ok(offset)
    }

    fn available_locked(&self, st: &mut MutexGuard<'_, Inner>, what: Available) -> Result<usize> {
        let state = st.state;
        match state {
            ConnState::Idle => return Err(ConnError::NotConnected),
            ConnState::DataLost => {
                st.state = ConnState::Connected;
                return Err(ConnError::DataLost);
            }
            _ => {}
        }
        self.fill_locked(st, false);
        if st.header == 0 {
            return Ok(st.in_cnt);
        }
        // Not inside a packet yet: try to consume its header.
        if st.pkt_offset < 0 {
            let _ = self.read_locked(st, None, 0, false);
        }
        if st.pkt_offset < 0 {
            return Ok(0);
        }
        if what == Available::PacketLength {
            return Ok(st.pkt_len);
        }
        let remaining = st.pkt_len - st.pkt_offset as usize;
        Ok(match what {
            Available::Ready => remaining.min(st.in_cnt),
            _ => remaining,
        })
    }

    fn send_eof(&self, st: &mut MutexGuard<'_, Inner>) {
        let deadline = Instant::now() + self.config.close_eof;
        while st.state.is_open() && st.out_cnt > 0 && Instant::now() < deadline {
            self.transport.output_queued();
            self.cond.wait_for(st, CLOSE_POLL);
        }
        let _ = self.write_locked(st, &[], false);
    }

    /// Keep the connection ticking during close: discard input and nudge the
    /// transport until output drains (or, with `until_drained` false, until
    /// the peer goes away) or `limit` passes.
    fn linger(&self, limit: Duration, until_drained: bool) {
        let deadline = Instant::now() + limit;
        let mut st = self.inner.lock();
        while st.state == ConnState::Disconnecting && Instant::now() < deadline {
            if until_drained && st.out_cnt == 0 {
                break;
            }
            let cap = st.input.len();
            let _ = self.read_locked(&mut st, None, cap, false);
            if st.out_cnt > 0 {
                self.transport.output_queued();
            }
            self.cond.wait_for(&mut st, CLOSE_POLL);
        }
    }
}

impl std::fmt::Debug for ConnectionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("ConnectionBuffer")
            .field("state", &st.state)
            .field("mode", &st.mode)
            .field("in_cnt", &st.in_cnt)
            .field("out_cnt", &st.out_cnt)
            .field("epoch", &st.epoch)
            .finish()
    }
}
