//! Shared engine state and the single-command request machinery.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use brickcomm_conn::{ConnError, ConnState};
use brickcomm_frame::{opcode, Frame};
use brickcomm_link::LinkEvents;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, trace};

use crate::address::BtAddress;
use crate::channel::Channel;
use crate::config::EngineConfig;
use crate::error::{BtError, Result};
use crate::events::EventSignal;

/// Number of channel slots; a channel's index is the chip handle it carries.
pub const CHANNELS: usize = 4;

/// Progress of the administrative request currently owning the chip.
///
/// Ordered: everything above `Idle` belongs to some caller, and the arbiter
/// only reads replies while the state is below `ReplyReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RequestState {
    /// The arbiter is not running.
    Off,
    /// The arbiter is draining the link before first use.
    Init,
    Idle,
    /// A command frame is waiting to be sent.
    Queued,
    /// Sent (or waiting on a notification); no reply yet.
    AwaitingChip,
    /// A reply is stored for the caller.
    ReplyReady,
    /// An inbound connection request is held for the listener.
    AwaitingInboundAccept,
    /// The request was aborted.
    Error,
}

/// What the link is carrying, as the arbiter last set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkMode {
    Command,
    Stream,
    /// A switch was not confirmed; the next command forces the issue.
    Unknown,
}

/// Why the arbiter aborted a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abort {
    Timeout,
    Reset,
    PoweredOff,
    ShutDown,
}

impl From<Abort> for BtError {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Timeout => BtError::Timeout,
            Abort::Reset => BtError::Reset,
            Abort::PoweredOff => BtError::PoweredOff,
            Abort::ShutDown => BtError::ShutDown,
        }
    }
}

/// Control-line changes that only the arbiter may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineRequest {
    PowerOn,
    PowerOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InquiryState {
    Idle,
    Running,
    Canceled,
    Complete,
}

/// Everything guarded by the command lock.
pub(crate) struct CmdState {
    pub req: RequestState,
    pub command: Option<Frame>,
    pub reply: Option<Frame>,
    pub timeout: Duration,
    pub deadline: Option<Instant>,
    /// The deadline was set already expired to force a reset.
    pub forced: bool,
    pub abort: Option<Abort>,
    /// Request state interrupted by an inbound connection request.
    pub saved: RequestState,
    pub inbound: Option<BtAddress>,
    pub mode: LinkMode,
    pub cur_chan: Option<usize>,
    pub listening: bool,
    pub powered: bool,
    pub reset_count: u32,
    pub pin: String,
    pub line: Option<LineRequest>,
    pub inquiry: InquiryState,
    pub cached_name: Option<String>,
    pub cached_address: Option<BtAddress>,
}

impl CmdState {
    fn new(pin: String) -> Self {
        Self {
            req: RequestState::Init,
            command: None,
            reply: None,
            timeout: Duration::ZERO,
            deadline: None,
            forced: false,
            abort: None,
            saved: RequestState::Idle,
            inbound: None,
            mode: LinkMode::Command,
            cur_chan: None,
            listening: false,
            powered: false,
            reset_count: 0,
            pin,
            line: None,
            inquiry: InquiryState::Idle,
            cached_name: None,
            cached_address: None,
        }
    }

    /// True once the current deadline has passed.
    pub fn timed_out(&self) -> bool {
        self.forced || self.deadline.is_some_and(|at| Instant::now() >= at)
    }
}

pub(crate) struct Engine {
    pub config: EngineConfig,
    pub state: Mutex<CmdState>,
    pub cond: Condvar,
    pub events: EventSignal,
    pub channels: [Channel; CHANNELS],
    pub running: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, pin: String) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let buffer = config.buffer_config();
            Self {
                channels: std::array::from_fn(|index| Channel::new(index, weak.clone(), buffer.clone())),
                state: Mutex::new(CmdState::new(pin)),
                cond: Condvar::new(),
                events: EventSignal::new(),
                running: AtomicBool::new(true),
                config,
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the arbiter to stop at its next suspension point.
    pub fn halt(&self) {
        self.running.store(false, Ordering::Release);
        self.events.notify(LinkEvents::NEW_CMD);
        let _st = self.state.lock();
        self.cond.notify_all();
    }

    /// Claim the command machinery, waiting for any other request to finish.
    pub fn begin(&self) -> Result<Command<'_>> {
        Command::claim(self, self.state.lock())
    }

    /// Channels whose link is still up.
    pub fn connected(&self) -> usize {
        self.channels.iter().filter(|c| c.buffer.state().is_live()).count()
    }

    /// Close the chip connection carried by `handle`.
    ///
    /// Only valid while the channel is mid-close. Returns the chip's status
    /// byte (0 is success).
    pub fn close_connection(&self, handle: u8) -> Result<u8> {
        let index = usize::from(handle);
        if index >= CHANNELS {
            return Err(BtError::InvalidHandle(handle));
        }
        let mut cmd = self.begin()?;
        // Both ends closing at once can leave the chip closing a dead handle,
        // which resets it. Give the remote's close a chance to land first.
        cmd.pause(self.config.close_delay_for(handle))?;
        let status = cmd.connection_status()?;
        if status[index] != 2 || self.channels[index].buffer.state() != ConnState::Disconnecting {
            debug!(handle, "connection already released");
            return Err(ConnError::NotConnected.into());
        }
        let reply = cmd.request(
            opcode::CLOSE_CONNECTION,
            &[handle],
            &[opcode::CLOSE_CONNECTION_RESULT],
            self.config.short_timeout,
        )?;
        for _ in 0..self.config.device_check_attempts {
            // A reset here is fine; the status query below tells.
            let _ = cmd.pause(self.config.reply_byte_timeout);
            if cmd.connection_status().is_ok() {
                break;
            }
        }
        Ok(reply.param(0))
    }

    /// Link quality (0-255) for the connection on `handle`.
    pub fn signal_strength(&self, handle: u8) -> Result<u8> {
        let index = usize::from(handle);
        if index >= CHANNELS {
            return Err(BtError::InvalidHandle(handle));
        }
        let mut cmd = self.begin()?;
        if self.channels[index].buffer.state() != ConnState::Connected {
            return Err(ConnError::NotConnected.into());
        }
        let reply = cmd.request(
            opcode::GET_LINK_QUALITY,
            &[handle],
            &[opcode::LINK_QUALITY_RESULT],
            self.config.short_timeout,
        )?;
        Ok(reply.param(0))
    }
}

/// Exclusive ownership of the command machinery.
///
/// Holds the command lock except while waiting on the arbiter. Dropping it
/// returns the machinery to `Idle` and lets the arbiter resume streaming.
pub(crate) struct Command<'a> {
    engine: &'a Engine,
    st: MutexGuard<'a, CmdState>,
}

impl<'a> Command<'a> {
    /// Wait for `Idle` on an already held lock and take over.
    pub fn claim(engine: &'a Engine, mut st: MutexGuard<'a, CmdState>) -> Result<Self> {
        loop {
            match st.req {
                RequestState::Idle => break,
                RequestState::Off => return Err(BtError::ShutDown),
                _ => engine.cond.wait(&mut st),
            }
        }
        st.req = RequestState::Queued;
        st.command = None;
        st.reply = None;
        st.abort = None;
        Ok(Self { engine, st })
    }

    /// Send a command and wait for a reply whose opcode is in `expect`.
    ///
    /// Replies with other opcodes are dropped. An empty `expect` accepts
    /// anything.
    pub fn request(&mut self, op: u8, params: &[u8], expect: &[u8], timeout: Duration) -> Result<Frame> {
        self.queue(op, params, timeout)?;
        self.await_reply(expect)
    }

    /// Wait for a further reply to the command already sent.
    pub fn next_reply(&mut self, expect: &[u8], timeout: Duration) -> Result<Frame> {
        if !self.st.powered {
            return Err(BtError::PoweredOff);
        }
        self.st.req = RequestState::AwaitingChip;
        self.arm(timeout);
        self.engine.events.notify(LinkEvents::NEW_CMD);
        self.await_reply(expect)
    }

    /// Send a command that has no reply. Returns once it is on the wire.
    pub fn send_only(&mut self, op: u8, params: &[u8]) -> Result<()> {
        self.queue(op, params, Duration::ZERO)?;
        self.st.deadline = None;
        loop {
            match self.st.req {
                RequestState::Queued => self.engine.cond.wait(&mut self.st),
                RequestState::Error => return Err(self.take_abort()),
                RequestState::Off => return Err(BtError::ShutDown),
                _ => return Ok(()),
            }
        }
    }

    /// Force a timeout, and with it a reset of the chip.
    pub fn force_reset(&mut self) -> Result<()> {
        if !self.st.powered {
            return Err(BtError::PoweredOff);
        }
        self.st.req = RequestState::AwaitingChip;
        self.st.forced = true;
        self.st.deadline = Some(Instant::now());
        self.engine.events.notify(LinkEvents::NEW_CMD);
        match self.await_reply(&[opcode::RESET_INDICATION]) {
            Err(BtError::Timeout) | Err(BtError::Reset) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Let the arbiter run for `period` without a command in flight.
    ///
    /// Returns `Ok(true)` if the link stayed quiet and `Ok(false)` if a chip
    /// message arrived meanwhile (which ends the pause early).
    pub fn pause(&mut self, period: Duration) -> Result<bool> {
        let until = Instant::now() + period;
        self.st.req = RequestState::AwaitingChip;
        self.st.deadline = None;
        self.st.forced = false;
        while self.st.req == RequestState::AwaitingChip {
            if self.engine.cond.wait_until(&mut self.st, until).timed_out() {
                break;
            }
        }
        let outcome = match self.st.req {
            RequestState::AwaitingChip => Ok(true),
            RequestState::ReplyReady => Ok(false),
            RequestState::Off => return Err(BtError::ShutDown),
            RequestState::Error => Err(self.take_abort()),
            _ => Err(BtError::Reset),
        };
        self.st.req = RequestState::Queued;
        self.st.command = None;
        self.st.reply = None;
        outcome
    }

    /// Have the arbiter change a control line, and wait until it has.
    pub fn apply_line(&mut self, line: LineRequest) -> Result<()> {
        self.st.line = Some(line);
        self.st.req = RequestState::AwaitingChip;
        self.st.deadline = None;
        self.engine.events.notify(LinkEvents::NEW_CMD);
        while self.st.line.is_some() {
            if self.st.req == RequestState::Off {
                return Err(BtError::ShutDown);
            }
            self.engine.cond.wait(&mut self.st);
        }
        self.st.req = RequestState::Queued;
        self.st.reply = None;
        Ok(())
    }

    /// Query which handles the chip considers connected.
    pub fn connection_status(&mut self) -> Result<[u8; CHANNELS]> {
        let reply = self.request(
            opcode::GET_CONNECTION_STATUS,
            &[],
            &[opcode::CONNECTION_STATUS_RESULT],
            self.engine.config.short_timeout,
        )?;
        let mut status = [0u8; CHANNELS];
        status.copy_from_slice(&reply_range::<CHANNELS>(&reply, 3));
        Ok(status)
    }

    /// Wait on the command condition for at most `period`.
    pub fn wait_for(&mut self, period: Duration) {
        self.engine.cond.wait_for(&mut self.st, period);
    }

    fn queue(&mut self, op: u8, params: &[u8], timeout: Duration) -> Result<()> {
        if !self.engine.is_running() {
            return Err(BtError::ShutDown);
        }
        if !self.st.powered {
            return Err(BtError::PoweredOff);
        }
        trace!(op = opcode::opcode_name(op), "queueing command");
        self.st.command = Some(Frame::new(op, params.to_vec()));
        self.st.reply = None;
        self.st.abort = None;
        self.st.req = RequestState::Queued;
        self.arm(timeout);
        self.engine.events.notify(LinkEvents::NEW_CMD);
        Ok(())
    }

    fn arm(&mut self, timeout: Duration) {
        self.st.forced = false;
        self.st.timeout = timeout;
        self.st.deadline = Some(Instant::now() + timeout);
    }

    fn await_reply(&mut self, expect: &[u8]) -> Result<Frame> {
        loop {
            match self.st.req {
                RequestState::ReplyReady => {
                    if let Some(reply) = self.st.reply.take() {
                        if expect.is_empty() || expect.contains(&reply.opcode) {
                            return Ok(reply);
                        }
                        trace!(op = opcode::opcode_name(reply.opcode), "ignoring unwanted reply");
                    }
                    self.st.req = RequestState::AwaitingChip;
                }
                RequestState::Error => return Err(self.take_abort()),
                RequestState::Off => return Err(BtError::ShutDown),
                RequestState::Idle | RequestState::Init => return Err(BtError::Reset),
                _ => self.engine.cond.wait(&mut self.st),
            }
        }
    }

    fn take_abort(&mut self) -> BtError {
        self.st.abort.take().unwrap_or(Abort::Reset).into()
    }
}

impl Deref for Command<'_> {
    type Target = CmdState;

    fn deref(&self) -> &CmdState {
        &self.st
    }
}

impl DerefMut for Command<'_> {
    fn deref_mut(&mut self) -> &mut CmdState {
        &mut self.st
    }
}

impl Drop for Command<'_> {
    fn drop(&mut self) {
        if self.st.req != RequestState::Off {
            self.st.req = RequestState::Idle;
        }
        self.st.command = None;
        self.st.reply = None;
        self.st.deadline = None;
        self.st.forced = false;
        self.engine.cond.notify_all();
        self.engine.events.notify(LinkEvents::NEW_CMD);
    }
}

/// `N` reply parameter bytes starting at `start`, zero-filled if short.
pub(crate) fn reply_range<const N: usize>(reply: &Frame, start: usize) -> [u8; N] {
    let mut out = [0u8; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = reply.param(start + i);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_states_are_ordered() {
        assert!(RequestState::Off < RequestState::Init);
        assert!(RequestState::Init < RequestState::Idle);
        assert!(RequestState::Queued < RequestState::AwaitingChip);
        assert!(RequestState::AwaitingChip < RequestState::ReplyReady);
        assert!(RequestState::ReplyReady < RequestState::AwaitingInboundAccept);
        assert!(RequestState::AwaitingInboundAccept < RequestState::Error);
    }

    #[test]
    fn abort_maps_to_errors() {
        assert!(matches!(BtError::from(Abort::Timeout), BtError::Timeout));
        assert!(matches!(BtError::from(Abort::ShutDown), BtError::ShutDown));
    }

    #[test]
    fn reply_range_zero_fills() {
        let reply = Frame::new(opcode::CONNECTION_STATUS_RESULT, vec![0, 0, 0, 2, 0]);
        assert_eq!(reply_range::<4>(&reply, 3), [2, 0, 0, 0]);
    }

    #[test]
    fn claim_waits_for_idle_and_drop_releases() {
        let engine = Engine::new(EngineConfig::default(), "1234".to_string());
        engine.state.lock().req = RequestState::Idle;
        {
            let cmd = engine.begin().expect("idle engine should be claimable");
            assert_eq!(cmd.req, RequestState::Queued);
        }
        assert_eq!(engine.state.lock().req, RequestState::Idle);
    }

    #[test]
    fn claim_fails_after_shutdown() {
        let engine = Engine::new(EngineConfig::default(), "1234".to_string());
        engine.state.lock().req = RequestState::Off;
        assert!(matches!(engine.begin(), Err(BtError::ShutDown)));
    }

    #[test]
    fn commands_fail_while_powered_off() {
        let engine = Engine::new(EngineConfig::default(), "1234".to_string());
        engine.state.lock().req = RequestState::Idle;
        let mut cmd = engine.begin().expect("claim");
        let result = cmd.request(opcode::GET_VERSION, &[], &[], Duration::from_millis(10));
        assert!(matches!(result, Err(BtError::PoweredOff)));
    }
}
