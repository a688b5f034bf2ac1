use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use brickcomm_conn::{BufferConfig, ConnectionBuffer, IoMode, Pump, Transport};
use brickcomm_link::{HardwareLink, LinkError, LinkEvents, POLL_SLICE};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::address::BtAddress;
use crate::engine::Engine;

/// Whether the arbiter switches to a channel just to look for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SwitchPolicy {
    /// Never switch to this channel.
    Disabled,
    /// Switch for output and to poll for input.
    #[default]
    Always,
    /// Switch only when there is output to send.
    OutputOnly,
}

#[derive(Debug, Default)]
struct ChannelMeta {
    address: Option<BtAddress>,
    policy: SwitchPolicy,
    last_poll: Option<Instant>,
}

/// One of the four connection slots. The slot index is the chip handle.
pub(crate) struct Channel {
    pub index: usize,
    pub buffer: ConnectionBuffer,
    meta: Mutex<ChannelMeta>,
    hooks: Arc<Hooks>,
}

impl Channel {
    pub fn new(index: usize, engine: Weak<Engine>, config: BufferConfig) -> Self {
        let hooks = Arc::new(Hooks {
            engine,
            index,
            active: AtomicBool::new(false),
        });
        Self {
            index,
            buffer: ConnectionBuffer::new(hooks.clone(), config),
            meta: Mutex::new(ChannelMeta::default()),
            hooks,
        }
    }

    /// Attach the slot to a new connection. Returns the buffer epoch.
    pub fn bind(&self, address: BtAddress, mode: IoMode) -> u64 {
        {
            let mut meta = self.meta.lock();
            meta.address = Some(address);
            meta.policy = SwitchPolicy::Always;
            meta.last_poll = None;
        }
        let epoch = self.buffer.bind(mode);
        debug!(handle = self.index, %address, ?mode, "channel bound");
        epoch
    }

    pub fn address(&self) -> Option<BtAddress> {
        self.meta.lock().address
    }

    pub fn policy(&self) -> SwitchPolicy {
        self.meta.lock().policy
    }

    pub fn set_policy(&self, policy: SwitchPolicy) {
        self.meta.lock().policy = policy;
    }

    /// Whether the arbiter is currently streaming this channel.
    pub fn set_active(&self, active: bool) {
        self.hooks.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.hooks.active.load(Ordering::Acquire)
    }

    /// Push pending output to the link.
    ///
    /// Returns the event that lets the channel progress: `NEW_DATA` once the
    /// output is drained, `WRITABLE` while the link is full.
    pub fn send(&self, link: &mut dyn HardwareLink) -> Result<LinkEvents, LinkError> {
        let pump = self.buffer.pump_out(|data| link.write(data))?;
        Ok(match pump {
            Pump::AwaitCaller => LinkEvents::NEW_DATA,
            Pump::AwaitLink => LinkEvents::WRITABLE,
        })
    }

    /// Pull pending input from the link.
    ///
    /// Returns `NEW_SPACE` when the input buffer is full, `READABLE` otherwise.
    pub fn recv(&self, link: &mut dyn HardwareLink) -> Result<LinkEvents, LinkError> {
        let pump = self.buffer.pump_in(|buf| link.read(buf))?;
        self.meta.lock().last_poll = Some(Instant::now());
        Ok(match pump {
            Pump::AwaitCaller => LinkEvents::NEW_SPACE,
            Pump::AwaitLink => LinkEvents::READABLE,
        })
    }

    /// True if the channel should be given stream time.
    pub fn needs_attention(&self, poll_interval: Duration) -> bool {
        let status = self.buffer.status();
        let meta = self.meta.lock();
        if !status.state.is_live() || meta.policy == SwitchPolicy::Disabled {
            return false;
        }
        if status.pending_output > 0 {
            return true;
        }
        if meta.policy == SwitchPolicy::OutputOnly || status.buffered_input >= status.capacity {
            return false;
        }
        status.buffered_input == 0 || meta.last_poll.is_none_or(|at| at.elapsed() >= poll_interval)
    }

    /// Empty the link's stream input before a mode switch.
    ///
    /// Reads for at least `linger`, giving the application a chance to make
    /// room. With `discard`, input that still does not fit is thrown away
    /// (for at most `limit`) and the connection is flagged as having lost
    /// data.
    pub fn flush_input(&self, link: &mut dyn HardwareLink, discard: bool, linger: Duration, limit: Duration) {
        if self.buffer.status().capacity == 0 {
            return;
        }
        let deadline = Instant::now() + linger;
        loop {
            let status = self.buffer.status();
            if status.capacity == 0 {
                return;
            }
            let pending = link.status().contains(LinkEvents::READABLE);
            if status.buffered_input >= status.capacity || !(pending || Instant::now() < deadline) {
                break;
            }
            if let Err(e) = self.recv(link) {
                warn!(handle = self.index, error = %e, "stream read failed during flush");
                return;
            }
            std::thread::sleep(POLL_SLICE);
        }

        if !discard || !link.status().contains(LinkEvents::READABLE) {
            return;
        }
        warn!(handle = self.index, "input overrun, dropping stream data");
        let start = Instant::now();
        let deadline = start + linger;
        loop {
            let pending = link.status().contains(LinkEvents::READABLE);
            let now = Instant::now();
            if !(pending || now < deadline) || now >= start + limit {
                break;
            }
            self.buffer.discard_input();
            if self.recv(link).is_err() {
                break;
            }
        }
        self.buffer.mark_data_lost();
    }

    /// Force the connection down after a link reset.
    pub fn reset(&self) {
        self.set_active(false);
        self.buffer.reset();
    }

    /// The chip reported the handle closed. Returns false if it was already down.
    pub fn disconnected(&self) -> bool {
        self.set_active(false);
        self.buffer.disconnected()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.index)
            .field("buffer", &self.buffer)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Transport hooks tying a channel's buffer to the arbiter.
struct Hooks {
    engine: Weak<Engine>,
    index: usize,
    active: AtomicBool,
}

impl Hooks {
    fn signal(&self, events: LinkEvents) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.events.notify(events);
        }
    }
}

impl Transport for Hooks {
    fn output_queued(&self) {
        self.signal(LinkEvents::NEW_DATA);
    }

    fn input_wanted(&self) {
        self.signal(LinkEvents::NEW_SPACE);
    }

    fn disconnect(&self, _buffer: &ConnectionBuffer) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        // Handles are 0..4, so the index always fits.
        match engine.close_connection(self.index as u8) {
            Ok(status) => {
                debug!(handle = self.index, status, "close requested");
                true
            }
            Err(e) => {
                debug!(handle = self.index, error = %e, "close not sent");
                false
            }
        }
    }

    fn sends_eof(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use brickcomm_link::ChipMode;

    use super::*;

    /// Loops written bytes back as readable input.
    #[derive(Default)]
    struct LoopLink {
        pending: Vec<u8>,
    }

    impl HardwareLink for LoopLink {
        fn write(&mut self, buf: &[u8]) -> brickcomm_link::Result<usize> {
            self.pending.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> brickcomm_link::Result<usize> {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        fn status(&mut self) -> LinkEvents {
            let mut status = LinkEvents::STREAM_MODE | LinkEvents::WRITABLE;
            if !self.pending.is_empty() {
                status.insert(LinkEvents::READABLE);
            }
            status
        }

        fn set_mode_line(&mut self, _mode: ChipMode) {}

        fn set_reset_line(&mut self, _high: bool) {}
    }

    fn channel(capacity: usize) -> Channel {
        let config = BufferConfig {
            capacity,
            ..BufferConfig::default()
        };
        Channel::new(1, Weak::new(), config)
    }

    fn addr() -> BtAddress {
        BtAddress([0, 0x16, 0x53, 1, 2, 3])
    }

    #[test]
    fn idle_channel_needs_nothing() {
        let chan = channel(16);
        assert!(!chan.needs_attention(Duration::ZERO));
    }

    #[test]
    fn fresh_connection_wants_a_poll() {
        let chan = channel(16);
        chan.bind(addr(), IoMode::Raw);
        assert!(chan.needs_attention(Duration::from_secs(60)));
        chan.set_policy(SwitchPolicy::OutputOnly);
        assert!(!chan.needs_attention(Duration::from_secs(60)));
        chan.buffer.write(b"hi", false).expect("write");
        assert!(chan.needs_attention(Duration::from_secs(60)));
        chan.set_policy(SwitchPolicy::Disabled);
        assert!(!chan.needs_attention(Duration::from_secs(60)));
    }

    #[test]
    fn buffered_input_waits_for_poll_interval() {
        let chan = channel(16);
        chan.bind(addr(), IoMode::Raw);
        let mut link = LoopLink {
            pending: b"abc".to_vec(),
        };
        chan.recv(&mut link).expect("recv");
        assert!(!chan.needs_attention(Duration::from_secs(60)));
        assert!(chan.needs_attention(Duration::ZERO));
    }

    #[test]
    fn send_and_recv_report_progress_events() {
        let chan = channel(8);
        chan.bind(addr(), IoMode::Raw);
        let mut link = LoopLink::default();
        assert_eq!(chan.send(&mut link).expect("send"), LinkEvents::NEW_DATA);
        chan.buffer.write(b"12345678", false).expect("write");
        assert_eq!(chan.send(&mut link).expect("send"), LinkEvents::NEW_DATA);
        assert_eq!(chan.recv(&mut link).expect("recv"), LinkEvents::NEW_SPACE);
        let mut out = [0u8; 8];
        assert_eq!(chan.buffer.read(&mut out, false).expect("read"), 8);
        assert_eq!(&out, b"12345678");
        assert_eq!(chan.recv(&mut link).expect("recv"), LinkEvents::READABLE);
    }

    #[test]
    fn overflowing_flush_marks_data_lost() {
        let chan = channel(4);
        chan.bind(addr(), IoMode::Raw);
        let mut link = LoopLink {
            pending: b"0123456789".to_vec(),
        };
        chan.flush_input(&mut link, true, Duration::from_millis(5), Duration::from_millis(50));
        assert!(link.pending.is_empty());
        let mut out = [0u8; 8];
        assert!(matches!(
            chan.buffer.read(&mut out, false),
            Err(brickcomm_conn::ConnError::DataLost)
        ));
    }

    #[test]
    fn gentle_flush_keeps_data() {
        let chan = channel(16);
        chan.bind(addr(), IoMode::Raw);
        let mut link = LoopLink {
            pending: b"abc".to_vec(),
        };
        chan.flush_input(&mut link, true, Duration::from_millis(2), Duration::from_millis(50));
        let mut out = [0u8; 8];
        assert_eq!(chan.buffer.read(&mut out, false).expect("read"), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn close_without_engine_still_finishes() {
        let chan = channel(16);
        chan.bind(addr(), IoMode::Packet);
        chan.buffer.close();
        assert_eq!(chan.buffer.state(), brickcomm_conn::ConnState::Idle);
    }

    #[test]
    fn reset_forces_disconnect() {
        let chan = channel(16);
        chan.bind(addr(), IoMode::Raw);
        chan.set_active(true);
        chan.reset();
        assert!(!chan.is_active());
        assert_eq!(chan.buffer.state(), brickcomm_conn::ConnState::Disconnected);
    }
}
