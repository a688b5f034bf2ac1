//! The link arbiter: the only thread that touches the [`HardwareLink`].
//!
//! It alternates between two phases:
//! - command: send the queued administrative frame and route replies,
//!   handling chip notifications inline
//! - stream: pick a channel that needs attention, open a stream to it and
//!   shuttle bytes for at least one I/O quantum
//!
//! Any protocol failure ends in a full chip reset.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use brickcomm_frame::{encode_frame, opcode, write_frame, FrameError, ReplyReader};
use brickcomm_link::{ChipMode, HardwareLink, LinkError, LinkEvents, POLL_SLICE};
use bytes::BytesMut;
use parking_lot::MutexGuard;
use tracing::{debug, error, info, trace, warn};

use crate::address::{BtAddress, ADDRESS_LEN, NAME_LEN};
use crate::engine::{Abort, CmdState, Engine, LineRequest, LinkMode, RequestState, CHANNELS};

type State<'a> = MutexGuard<'a, CmdState>;

pub(crate) struct Arbiter {
    engine: Arc<Engine>,
    link: Box<dyn HardwareLink>,
    reader: ReplyReader,
    bad_frames: u32,
    retries_left: u32,
}

impl Arbiter {
    pub fn new(engine: Arc<Engine>, link: Box<dyn HardwareLink>) -> Self {
        let reader = ReplyReader::with_timeout(engine.config.reply_byte_timeout);
        Self {
            engine,
            link,
            reader,
            bad_frames: 0,
            retries_left: 0,
        }
    }

    pub fn run(mut self) {
        info!(link = self.link.name(), "link arbiter started");
        self.wait_init();
        while self.engine.is_running() {
            self.process_commands();
            if !self.engine.is_running() {
                break;
            }
            self.process_streams();
        }
        self.stop();
    }

    /// Drain whatever the chip sent before we started, then open for business.
    fn wait_init(&mut self) {
        self.engine.state.lock().req = RequestState::Init;
        self.process_commands();
        let mut st = self.engine.state.lock();
        if st.req == RequestState::Init {
            st.req = RequestState::Idle;
        }
        self.engine.cond.notify_all();
    }

    fn stop(&mut self) {
        let engine = Arc::clone(&self.engine);
        let mut st = engine.state.lock();
        self.link.set_mode_line(ChipMode::Command);
        self.link.set_reset_line(false);
        for chan in &engine.channels {
            chan.reset();
        }
        st.req = RequestState::Off;
        st.abort = Some(Abort::ShutDown);
        st.mode = LinkMode::Command;
        st.cur_chan = None;
        st.listening = false;
        st.powered = false;
        st.inbound = None;
        engine.cond.notify_all();
        info!(resets = st.reset_count, "link arbiter stopped");
    }

    /// Run the command phase until nothing is pending and the link is quiet.
    fn process_commands(&mut self) {
        self.switch_to_cmd();
        let engine = Arc::clone(&self.engine);
        loop {
            {
                let mut st = engine.state.lock();
                self.apply_line(&mut st);
                if st.req == RequestState::Queued {
                    self.send_command(&mut st);
                }
                self.process_reply(&mut st);
            }
            let fired = engine.events.wait(
                &mut *self.link,
                LinkEvents::READABLE | LinkEvents::NEW_CMD,
                engine.config.command_poll,
            );
            if !engine.is_running() {
                return;
            }
            let busy = {
                let st = engine.state.lock();
                st.req > RequestState::Idle || st.line.is_some()
            };
            if !busy && !fired.contains(LinkEvents::READABLE) {
                return;
            }
        }
    }

    fn apply_line(&mut self, st: &mut State<'_>) {
        let Some(line) = st.line.take() else {
            return;
        };
        match line {
            LineRequest::PowerOn => {
                info!("powering radio on");
                self.link.set_reset_line(true);
                if !self.drain(self.engine.config.reset_wait, Some(opcode::RESET_INDICATION)) {
                    warn!("no reset indication after power on");
                }
            }
            LineRequest::PowerOff => {
                info!("powering radio off");
                self.link.set_mode_line(ChipMode::Command);
                self.link.set_reset_line(false);
                st.mode = LinkMode::Command;
                st.cur_chan = None;
            }
        }
        self.engine.cond.notify_all();
    }

    fn send_command(&mut self, st: &mut State<'_>) {
        let Some(frame) = st.command.clone() else {
            st.req = RequestState::AwaitingChip;
            return;
        };
        trace!(op = opcode::opcode_name(frame.opcode), "sending command");
        if let Err(e) = self.write_command(frame.opcode, &frame.params) {
            self.fault(st, e);
            return;
        }
        self.retries_left = if is_query(frame.opcode) && !st.forced {
            self.engine.config.reply_retries
        } else {
            0
        };
        st.req = RequestState::AwaitingChip;
        self.engine.cond.notify_all();
    }

    /// Route replies until one is handed to the caller or the link is quiet.
    fn process_reply(&mut self, st: &mut State<'_>) {
        let engine = Arc::clone(&self.engine);
        while st.req < RequestState::ReplyReady {
            let frame = match self.reader.read_reply(&mut *self.link) {
                Ok(Some(frame)) => {
                    self.bad_frames = 0;
                    frame
                }
                Ok(None) => {
                    if st.timed_out() {
                        self.timed_out(st);
                    }
                    return;
                }
                Err(FrameError::Link(e)) => {
                    self.fault(st, FrameError::Link(e));
                    return;
                }
                Err(e) => {
                    self.bad_frames += 1;
                    warn!(error = %e, failures = self.bad_frames, "bad reply frame");
                    if self.bad_frames > engine.config.frame_retries {
                        self.reset(st, Abort::Reset);
                        return;
                    }
                    continue;
                }
            };

            match frame.opcode {
                opcode::RESET_INDICATION => {
                    warn!("radio reset itself");
                    self.reset(st, Abort::Reset);
                    return;
                }
                opcode::CLOSE_CONNECTION_RESULT => {
                    let handle = usize::from(frame.param(1));
                    if handle < CHANNELS {
                        if engine.channels[handle].disconnected() {
                            info!(handle, "connection closed");
                        }
                        if st.cur_chan == Some(handle) {
                            st.cur_chan = None;
                        }
                    }
                }
                opcode::REQUEST_CONNECTION => {
                    let address = BtAddress::from_wire(&frame.params);
                    if st.listening {
                        debug!(%address, "inbound connection request");
                        st.saved = st.req;
                        st.req = RequestState::AwaitingInboundAccept;
                        st.inbound = Some(address);
                        engine.cond.notify_all();
                    } else {
                        debug!(%address, "rejecting inbound connection, nobody listening");
                        if let Err(e) = self.write_command(opcode::ACCEPT_CONNECTION, &[0]) {
                            self.fault(st, e);
                            return;
                        }
                    }
                    continue;
                }
                opcode::REQUEST_PIN_CODE => {
                    let mut params = [0u8; ADDRESS_LEN + NAME_LEN];
                    params[..ADDRESS_LEN].copy_from_slice(&BtAddress::from_wire(&frame.params).to_wire());
                    let pin = st.pin.as_bytes();
                    let n = pin.len().min(NAME_LEN);
                    params[ADDRESS_LEN..ADDRESS_LEN + n].copy_from_slice(&pin[..n]);
                    debug!(address = %BtAddress::from_wire(&params), "answering pin request");
                    if let Err(e) = self.write_command(opcode::PIN_CODE, &params) {
                        self.fault(st, e);
                        return;
                    }
                    continue;
                }
                opcode::PIN_CODE_ACK => continue,
                _ => {}
            }

            if st.req == RequestState::AwaitingChip {
                st.reply = Some(frame);
                st.req = RequestState::ReplyReady;
                engine.cond.notify_all();
            } else {
                trace!(op = opcode::opcode_name(frame.opcode), "dropping unsolicited reply");
            }
        }
    }

    /// The command deadline passed with no reply.
    fn timed_out(&mut self, st: &mut State<'_>) {
        if st.req == RequestState::AwaitingChip && self.retries_left > 0 && !st.forced {
            if let Some(frame) = st.command.clone() {
                self.retries_left -= 1;
                debug!(op = opcode::opcode_name(frame.opcode), "no reply, resending");
                if let Err(e) = self.write_command(frame.opcode, &frame.params) {
                    self.fault(st, e);
                    return;
                }
                st.deadline = Some(Instant::now() + st.timeout);
                return;
            }
        }
        if st.forced {
            info!("reset requested");
        } else {
            warn!(state = ?st.req, "command timed out");
        }
        self.reset(st, Abort::Timeout);
    }

    /// Run the stream phase. Returns when a command needs the link or no
    /// channel wants stream time.
    fn process_streams(&mut self) {
        let engine = Arc::clone(&self.engine);
        let config = &engine.config;
        loop {
            let next = {
                let st = engine.state.lock();
                if st.req != RequestState::Idle
                    || st.line.is_some()
                    || st.listening
                    || !st.powered
                    || !engine.is_running()
                {
                    return;
                }
                match self.select_chan(st.cur_chan) {
                    Some(next) => next,
                    None => return,
                }
            };
            if !self.switch_to_stream(next) {
                return;
            }

            let chan = &engine.channels[next];
            let until = Instant::now() + config.io_quantum;
            chan.set_active(true);
            while chan.buffer.state().is_live() {
                let mut wanted = match chan.send(&mut *self.link) {
                    Ok(events) => events,
                    Err(e) => {
                        chan.set_active(false);
                        self.stream_fault(e);
                        return;
                    }
                };
                match chan.recv(&mut *self.link) {
                    Ok(events) => wanted.insert(events),
                    Err(e) => {
                        chan.set_active(false);
                        self.stream_fault(e);
                        return;
                    }
                }
                let remaining = until.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let fired = engine.events.wait(
                    &mut *self.link,
                    wanted | LinkEvents::CMD_MODE | LinkEvents::NEW_CMD,
                    remaining,
                );
                if fired.is_empty() || fired.intersects(LinkEvents::CMD_MODE | LinkEvents::NEW_CMD) {
                    break;
                }
            }
            chan.set_active(false);

            let st = engine.state.lock();
            if st.mode != LinkMode::Stream || st.listening || self.link.chip_mode() != Some(ChipMode::Stream) {
                return;
            }
        }
    }

    /// Next channel needing attention, scanning round-robin after `cur`.
    fn select_chan(&self, cur: Option<usize>) -> Option<usize> {
        let start = cur.unwrap_or(CHANNELS - 1);
        (1..=CHANNELS)
            .map(|step| (start + step) % CHANNELS)
            .find(|&i| self.engine.channels[i].needs_attention(self.engine.config.poll_interval))
    }

    fn switch_to_stream(&mut self, chan: usize) -> bool {
        let engine = Arc::clone(&self.engine);
        {
            let st = engine.state.lock();
            if st.mode == LinkMode::Stream && st.cur_chan == Some(chan) {
                return true;
            }
        }
        self.switch_to_cmd();
        let resets = {
            let st = engine.state.lock();
            if st.mode != LinkMode::Command {
                return false;
            }
            st.reset_count
        };

        debug!(handle = chan, "opening stream");
        // Handles are 0..4.
        if let Err(e) = self.write_command(opcode::OPEN_STREAM, &[chan as u8]) {
            let mut st = engine.state.lock();
            self.fault(&mut st, e);
            return false;
        }
        if !self.wait_switch(ChipMode::Stream, false) {
            return false;
        }

        let mut st = engine.state.lock();
        // Replies that raced the switch.
        self.process_reply(&mut st);
        if st.reset_count != resets || !engine.channels[chan].buffer.state().is_live() {
            return false;
        }
        self.link.set_mode_line(ChipMode::Stream);
        st.mode = LinkMode::Stream;
        st.cur_chan = Some(chan);
        true
    }

    fn switch_to_cmd(&mut self) {
        let engine = Arc::clone(&self.engine);
        let config = &engine.config;
        let (mode, cur) = {
            let st = engine.state.lock();
            (st.mode, st.cur_chan)
        };
        if mode == LinkMode::Command {
            return;
        }
        if mode == LinkMode::Stream && self.link.chip_mode() == Some(ChipMode::Command) {
            if let Some(c) = cur {
                engine.channels[c].flush_input(&mut *self.link, true, config.channel_flush_wait, config.flush_timeout);
            }
        }
        if !self
            .link
            .wait(LinkEvents::WRITE_EMPTY, config.flush_timeout)
            .contains(LinkEvents::WRITE_EMPTY)
        {
            warn!("stream output did not drain");
            let mut st = engine.state.lock();
            self.reset(&mut st, Abort::Reset);
            return;
        }

        // The chip only notices the mode line after a gap in the stream.
        std::thread::sleep(config.quiescence);
        if let Some(c) = cur {
            engine.channels[c].flush_input(&mut *self.link, false, config.channel_flush_wait, config.flush_timeout);
        }
        self.link.set_mode_line(ChipMode::Command);
        if !self.wait_switch(ChipMode::Command, true) {
            let mut st = engine.state.lock();
            self.reset(&mut st, Abort::Reset);
            return;
        }
        trace!("back in command mode");
        engine.state.lock().mode = LinkMode::Command;
    }

    /// Wait for the chip to report `target`, flushing stream input on the way
    /// when `flush` is set.
    fn wait_switch(&mut self, target: ChipMode, flush: bool) -> bool {
        let engine = Arc::clone(&self.engine);
        let config = &engine.config;
        let target_event = target.status_bit();
        let cur = engine.state.lock().cur_chan;
        let mut interest = target_event;
        if flush && cur.is_some() {
            interest |= LinkEvents::READABLE;
        }
        let deadline = Instant::now() + config.switch_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let fired = engine.events.wait(&mut *self.link, interest, remaining);
            if fired.contains(target_event) {
                return true;
            }
            if fired.is_empty() {
                break;
            }
            if let Some(c) = cur.filter(|_| fired.contains(LinkEvents::READABLE)) {
                engine.channels[c].flush_input(&mut *self.link, true, config.channel_flush_wait, config.flush_timeout);
            }
        }
        warn!(?target, "radio did not confirm mode switch");
        {
            let mut st = engine.state.lock();
            st.mode = LinkMode::Unknown;
            st.cur_chan = None;
        }
        self.link.chip_mode() == Some(target)
    }

    /// Hardware reset: pulse the reset line, wait for the chip to come back
    /// and check it answers. Every channel is forced down and any request in
    /// flight fails with `abort`.
    fn reset(&mut self, st: &mut State<'_>, abort: Abort) {
        let engine = Arc::clone(&self.engine);
        let config = &engine.config;
        warn!(count = st.reset_count + 1, ?abort, "resetting radio");

        let mut alive = false;
        for attempt in 0..config.reset_attempts.max(1) {
            self.drain(config.flush_timeout, None);
            self.link.set_mode_line(ChipMode::Command);
            self.link.set_reset_line(false);
            self.drain(config.reset_pulse, None);
            self.link.set_reset_line(true);
            if !self.drain(config.reset_wait, Some(opcode::RESET_INDICATION)) {
                debug!(attempt, "no reset indication");
            }
            if self.write_command(opcode::GET_OPERATING_MODE, &[]).is_ok()
                && self.drain(config.short_timeout, Some(opcode::OPERATING_MODE_RESULT))
            {
                alive = true;
                break;
            }
            debug!(attempt, "radio not answering after reset");
        }
        if !alive {
            error!("radio did not recover from reset");
        }

        for chan in &engine.channels {
            chan.reset();
        }
        st.mode = LinkMode::Command;
        st.cur_chan = None;
        st.listening = false;
        st.deadline = None;
        st.forced = false;
        let effective = if st.req == RequestState::AwaitingInboundAccept {
            st.inbound = None;
            st.saved
        } else {
            st.req
        };
        st.req = if effective > RequestState::Idle {
            st.abort = Some(abort);
            RequestState::Error
        } else {
            effective
        };
        st.reset_count += 1;
        self.reader.discard();
        self.bad_frames = 0;
        self.retries_left = 0;
        engine.cond.notify_all();
        info!(count = st.reset_count, "radio reset complete");
    }

    /// Read and drop replies for up to `period`. With `until`, stop early
    /// (returning true) once a frame with that opcode arrives.
    fn drain(&mut self, period: Duration, until: Option<u8>) -> bool {
        let deadline = Instant::now() + period;
        loop {
            match self.reader.read_reply(&mut *self.link) {
                Ok(Some(frame)) => {
                    if until == Some(frame.opcode) {
                        return true;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => trace!(error = %e, "discarding input"),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.link.wait(LinkEvents::READABLE, remaining.min(POLL_SLICE * 10));
        }
    }

    fn write_command(&mut self, op: u8, params: &[u8]) -> Result<(), FrameError> {
        let mut wire = BytesMut::new();
        encode_frame(op, params, &mut wire)?;
        write_frame(&mut *self.link, &wire, self.engine.config.flush_timeout)
    }

    /// A frame could not be written or read. A detached link stops the
    /// engine; anything else resets the chip.
    fn fault(&mut self, st: &mut State<'_>, err: FrameError) {
        if matches!(err, FrameError::Link(LinkError::Detached)) {
            error!("radio link detached, stopping");
            self.engine.running.store(false, Ordering::Release);
            return;
        }
        warn!(error = %err, "link fault");
        self.reset(st, Abort::Reset);
    }

    fn stream_fault(&mut self, err: LinkError) {
        let engine = Arc::clone(&self.engine);
        let mut st = engine.state.lock();
        self.fault(&mut st, FrameError::Link(err));
    }
}

/// Queries that are safe to resend when the reply goes missing.
fn is_query(op: u8) -> bool {
    matches!(
        op,
        opcode::GET_LINK_QUALITY
            | opcode::GET_LOCAL_ADDR
            | opcode::GET_FRIENDLY_NAME
            | opcode::GET_DISCOVERABLE
            | opcode::GET_PORT_OPEN
            | opcode::GET_VERSION
            | opcode::GET_BRICK_STATUSBYTE
            | opcode::GET_OPERATING_MODE
            | opcode::GET_CONNECTION_STATUS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_get_commands_are_resent() {
        assert!(is_query(opcode::GET_VERSION));
        assert!(is_query(opcode::GET_CONNECTION_STATUS));
        assert!(!is_query(opcode::CONNECT));
        assert!(!is_query(opcode::CLOSE_CONNECTION));
        assert!(!is_query(opcode::BEGIN_INQUIRY));
    }
}
