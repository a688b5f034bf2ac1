use std::collections::VecDeque;
use std::time::Instant;

use brickcomm_frame::{decode_command, encode_reply, opcode, Frame};
use brickcomm_link::ChipMode;
use bytes::BytesMut;
use tracing::{debug, trace};

use crate::config::{SimConfig, SimDevice};
use crate::controller::SimStats;

pub(crate) const HANDLES: usize = 4;
pub(crate) const NAME_LEN: usize = 16;

/// One open connection between the chip and a remote device.
#[derive(Debug)]
pub(crate) struct SimLink {
    pub device: SimDevice,
    /// Bytes the brick sent, waiting for the remote to take them.
    pub to_remote: VecDeque<u8>,
    /// Bytes the remote sent, waiting for the brick to read them.
    pub from_remote: VecDeque<u8>,
}

/// A reply frame queued for the brick.
#[derive(Debug)]
struct Outgoing {
    at: Instant,
    bytes: Vec<u8>,
    read: usize,
    /// First reply to a command (used to spot overlapping commands).
    solicited: bool,
    /// Part of a running inquiry (dropped by `CANCEL_INQUIRY`).
    inquiry: bool,
}

pub(crate) struct ChipState {
    pub config: SimConfig,
    pub powered: bool,
    pub chip_mode: ChipMode,
    pub arm_mode: ChipMode,
    pub active: Option<usize>,
    pub switch_pending: bool,
    pub name: String,
    pub op_mode: u8,
    pub status: [u8; 2],
    pub discoverable: bool,
    pub port: Option<usize>,
    pub known: Vec<SimDevice>,
    pub devices: Vec<SimDevice>,
    pub links: [Option<SimLink>; HANDLES],
    pub pending_inbound: Option<(usize, SimDevice)>,
    pending_connect: Option<(usize, SimDevice)>,
    cmd_rx: BytesMut,
    outbox: VecDeque<Outgoing>,
    pub muted: bool,
    pub corrupt_next: bool,
    pub pins: Vec<String>,
    pub stats: SimStats,
    last_stream_write: Option<Instant>,
}

impl ChipState {
    pub fn new(config: SimConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            powered: true,
            chip_mode: ChipMode::Command,
            arm_mode: ChipMode::Command,
            active: None,
            switch_pending: false,
            op_mode: 0,
            status: [0, 0],
            discoverable: true,
            port: None,
            known: Vec::new(),
            devices: Vec::new(),
            links: Default::default(),
            pending_inbound: None,
            pending_connect: None,
            cmd_rx: BytesMut::new(),
            outbox: VecDeque::new(),
            muted: false,
            corrupt_next: false,
            pins: Vec::new(),
            stats: SimStats::default(),
            last_stream_write: None,
        }
    }

    /// Complete a pending switch to command mode once the stream is drained.
    pub fn settle(&mut self) {
        if self.switch_pending && self.active_remote_empty() {
            self.enter_command_mode();
        }
    }

    fn active_remote_empty(&self) -> bool {
        self.active
            .and_then(|h| self.links[h].as_ref())
            .is_none_or(|link| link.from_remote.is_empty())
    }

    fn enter_command_mode(&mut self) {
        self.chip_mode = ChipMode::Command;
        self.active = None;
        self.switch_pending = false;
    }

    /// True while reads return stream payload rather than replies.
    pub fn streaming(&self) -> bool {
        self.chip_mode == ChipMode::Stream && (self.arm_mode == ChipMode::Stream || self.switch_pending)
    }

    pub fn readable(&self) -> bool {
        if !self.powered {
            return false;
        }
        if self.streaming() {
            return !self.active_remote_empty();
        }
        if self.arm_mode != ChipMode::Command {
            return false;
        }
        let now = Instant::now();
        self.outbox.iter().any(|out| out.at <= now)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if !self.powered {
            return 0;
        }
        if self.streaming() {
            let Some(link) = self.active.and_then(|h| self.links[h].as_mut()) else {
                return 0;
            };
            let n = buf.len().min(link.from_remote.len());
            for (slot, byte) in buf.iter_mut().zip(link.from_remote.drain(..n)) {
                *slot = byte;
            }
            self.settle();
            return n;
        }
        if self.arm_mode != ChipMode::Command {
            return 0;
        }

        let now = Instant::now();
        let mut n = 0;
        while n < buf.len() {
            let Some(idx) = self.outbox.iter().position(|out| out.at <= now) else {
                break;
            };
            let out = &mut self.outbox[idx];
            let take = (buf.len() - n).min(out.bytes.len() - out.read);
            buf[n..n + take].copy_from_slice(&out.bytes[out.read..out.read + take]);
            out.read += take;
            n += take;
            if out.read == out.bytes.len() {
                self.outbox.remove(idx);
            }
        }
        n
    }

    pub fn write(&mut self, buf: &[u8]) -> usize {
        if !self.powered {
            return buf.len();
        }
        if self.chip_mode == ChipMode::Stream {
            if let Some(link) = self.active.and_then(|h| self.links[h].as_mut()) {
                if link.device.echo {
                    link.from_remote.extend(buf);
                } else {
                    link.to_remote.extend(buf);
                }
                self.last_stream_write = Some(Instant::now());
            }
            return buf.len();
        }
        if self.arm_mode != ChipMode::Command {
            self.stats.dropped_writes += buf.len();
            return buf.len();
        }

        self.cmd_rx.extend_from_slice(buf);
        loop {
            match decode_command(&mut self.cmd_rx) {
                Ok(Some(frame)) => self.handle(frame),
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "sim chip dropped bad command frame");
                    self.stats.bad_frames += 1;
                }
            }
        }
        buf.len()
    }

    pub fn set_arm_mode(&mut self, mode: ChipMode) {
        self.arm_mode = mode;
        if mode == ChipMode::Command && self.chip_mode == ChipMode::Stream {
            let quiet = self.config.quiescence;
            if self.last_stream_write.is_some_and(|at| at.elapsed() < quiet) {
                self.stats.quiescence_violations += 1;
            }
            self.switch_pending = true;
            self.settle();
        }
    }

    pub fn set_reset_line(&mut self, high: bool) {
        if !high {
            self.power_down();
        } else if !self.powered {
            self.powered = true;
            self.stats.reset_pulses += 1;
            let boot = self.config.boot_delay;
            self.push(opcode::RESET_INDICATION, &[], boot, false);
        }
    }

    /// Drop everything a chip loses across a reboot.
    pub fn power_down(&mut self) {
        self.powered = false;
        self.enter_command_mode();
        self.links = Default::default();
        self.pending_inbound = None;
        self.pending_connect = None;
        self.port = None;
        self.cmd_rx.clear();
        self.outbox.clear();
        self.muted = false;
        self.corrupt_next = false;
    }

    /// Reboot without the brick asking for it.
    pub fn reboot(&mut self) {
        self.power_down();
        self.powered = true;
        let boot = self.config.boot_delay;
        self.push(opcode::RESET_INDICATION, &[], boot, false);
    }

    pub fn push(&mut self, op: u8, params: &[u8], delay: std::time::Duration, solicited: bool) {
        self.push_tagged(op, params, delay, solicited, false);
    }

    fn push_tagged(&mut self, op: u8, params: &[u8], delay: std::time::Duration, solicited: bool, inquiry: bool) {
        let mut wire = BytesMut::new();
        if encode_reply(op, params, &mut wire).is_err() {
            return;
        }
        let mut bytes = wire.to_vec();
        if self.corrupt_next {
            self.corrupt_next = false;
            if let Some(last) = bytes.last_mut() {
                *last ^= 0x5a;
            }
        }
        trace!(op = opcode::opcode_name(op), "sim chip queued reply");
        self.outbox.push_back(Outgoing {
            at: Instant::now() + delay,
            bytes,
            read: 0,
            solicited,
            inquiry,
        });
    }

    fn reply(&mut self, op: u8, params: &[u8]) {
        let delay = self.config.reply_delay;
        self.push(op, params, delay, true);
    }

    fn free_handle(&self) -> Option<usize> {
        (0..HANDLES).find(|&h| self.links[h].is_none() && self.port != Some(h))
    }

    pub fn open_link(&mut self, handle: usize, device: SimDevice) {
        self.links[handle] = Some(SimLink {
            device,
            to_remote: VecDeque::new(),
            from_remote: VecDeque::new(),
        });
    }

    /// Tear down a link and report it the way the chip does for a remote close.
    pub fn drop_link(&mut self, handle: usize, solicited: bool) -> bool {
        if self.links[handle].take().is_none() {
            return false;
        }
        if self.active == Some(handle) {
            self.enter_command_mode();
        }
        let delay = self.config.reply_delay;
        self.push(opcode::CLOSE_CONNECTION_RESULT, &[0, handle as u8], delay, solicited);
        true
    }

    pub fn handle_for(&self, address: &[u8; 6]) -> Option<usize> {
        (0..HANDLES).find(|&h| self.links[h].as_ref().is_some_and(|l| &l.device.address == address))
    }

    fn handle(&mut self, frame: Frame) {
        let op = frame.opcode;
        self.stats.commands.push(op);
        if self.muted {
            trace!(op = opcode::opcode_name(op), "sim chip muted, command ignored");
            return;
        }
        let background = matches!(
            op,
            opcode::PIN_CODE | opcode::ACCEPT_CONNECTION | opcode::CANCEL_INQUIRY | opcode::OPEN_STREAM
        );
        if !background && self.outbox.iter().any(|out| out.solicited) {
            self.stats.overlapping_commands += 1;
        }

        match op {
            opcode::GET_OPERATING_MODE => {
                let mode = self.op_mode;
                self.reply(opcode::OPERATING_MODE_RESULT, &[mode]);
            }
            opcode::SET_OPERATING_MODE => {
                self.op_mode = frame.param(0);
                let mode = self.op_mode;
                self.reply(opcode::OPERATING_MODE_RESULT, &[mode]);
            }
            opcode::OPEN_PORT => match (0..HANDLES).rev().find(|&h| self.links[h].is_none()) {
                Some(h) => {
                    self.port = Some(h);
                    self.reply(opcode::PORT_OPEN_RESULT, &[1, h as u8, 1]);
                }
                None => self.reply(opcode::PORT_OPEN_RESULT, &[0, 0xff, 0]),
            },
            opcode::CLOSE_PORT => {
                self.port = None;
                self.pending_inbound = None;
                self.reply(opcode::CLOSE_PORT_RESULT, &[1, 1]);
            }
            opcode::CONNECT => self.connect(&frame),
            opcode::PIN_CODE => self.pin_code(&frame),
            opcode::ACCEPT_CONNECTION => {
                let Some((handle, device)) = self.pending_inbound.take() else {
                    return;
                };
                if frame.param(0) == 1 {
                    self.open_link(handle, device);
                    self.port = None;
                    let delay = self.config.connect_delay;
                    self.push(opcode::CONNECT_RESULT, &[1, handle as u8], delay, true);
                } else {
                    self.stats.rejected_requests += 1;
                }
            }
            opcode::CLOSE_CONNECTION => {
                let handle = frame.param(0) as usize;
                if handle >= HANDLES || !self.drop_link(handle, true) {
                    self.reply(opcode::CLOSE_CONNECTION_RESULT, &[1, handle as u8]);
                }
            }
            opcode::OPEN_STREAM => {
                let handle = frame.param(0) as usize;
                if handle < HANDLES && self.links[handle].is_some() {
                    self.chip_mode = ChipMode::Stream;
                    self.active = Some(handle);
                    self.switch_pending = false;
                }
            }
            opcode::GET_CONNECTION_STATUS => {
                let mut params = [0u8; 3 + HANDLES];
                for h in 0..HANDLES {
                    if self.links[h].is_some() {
                        params[3 + h] = 2;
                    }
                }
                self.reply(opcode::CONNECTION_STATUS_RESULT, &params);
            }
            opcode::GET_LINK_QUALITY => {
                let handle = frame.param(0) as usize;
                let quality = if handle < HANDLES && self.links[handle].is_some() { 180 } else { 0 };
                self.reply(opcode::LINK_QUALITY_RESULT, &[quality]);
            }
            opcode::GET_FRIENDLY_NAME => {
                let name = pad_name(&self.name);
                self.reply(opcode::GET_FRIENDLY_NAME_RESULT, &name);
            }
            opcode::SET_FRIENDLY_NAME => {
                self.name = unpad_name(frame.param_range(0, NAME_LEN));
                self.reply(opcode::SET_FRIENDLY_NAME_ACK, &[]);
            }
            opcode::GET_LOCAL_ADDR => {
                let addr = wire_address(&self.config.address);
                self.reply(opcode::GET_LOCAL_ADDR_RESULT, &addr);
            }
            opcode::GET_VERSION => {
                let (major, minor) = self.config.version;
                self.reply(opcode::GET_VERSION_RESULT, &[major, minor]);
            }
            opcode::GET_BRICK_STATUSBYTE => {
                let status = self.status;
                self.reply(opcode::GET_BRICK_STATUSBYTE_RESULT, &status);
            }
            opcode::SET_BRICK_STATUSBYTE => {
                self.status = [frame.param(0), frame.param(1)];
                self.reply(opcode::SET_BRICK_STATUSBYTE_RESULT, &[]);
            }
            opcode::GET_DISCOVERABLE => {
                let visible = u8::from(self.discoverable);
                self.reply(opcode::GET_DISCOVERABLE_RESULT, &[visible]);
            }
            opcode::SET_DISCOVERABLE => {
                self.discoverable = frame.param(0) != 0;
                self.reply(opcode::SET_DISCOVERABLE_ACK, &[]);
            }
            opcode::GET_PORT_OPEN => {
                let open = u8::from(self.port.is_some());
                self.reply(opcode::GET_PORT_OPEN_RESULT, &[open]);
            }
            opcode::SET_FACTORY_SETTINGS => {
                self.known.clear();
                self.name = self.config.name.clone();
                self.discoverable = true;
                self.reply(opcode::SET_FACTORY_SETTINGS_ACK, &[]);
            }
            opcode::BEGIN_INQUIRY => self.begin_inquiry(&frame),
            opcode::CANCEL_INQUIRY => {
                self.outbox.retain(|out| !out.inquiry);
                self.reply(opcode::INQUIRY_STOPPED, &[]);
            }
            opcode::LOOKUP_NAME => {
                let addr = address_of(&frame);
                match self.devices.iter().find(|d| d.address == addr) {
                    Some(device) => {
                        let mut params = wire_address(&device.address).to_vec();
                        params.extend_from_slice(&pad_name(&device.name));
                        self.reply(opcode::LOOKUP_NAME_RESULT, &params);
                    }
                    None => self.reply(opcode::LOOKUP_NAME_FAILURE, &wire_address(&addr)),
                }
            }
            opcode::DUMP_LIST => {
                let delay = self.config.reply_delay;
                let items: Vec<Vec<u8>> = self.known.iter().map(device_record).collect();
                let mut first = true;
                for item in items {
                    self.push(opcode::LIST_ITEM, &item, delay, first);
                    first = false;
                }
                self.push(opcode::LIST_DUMP_STOPPED, &[], delay, first);
            }
            opcode::ADD_DEVICE => {
                let mut device = SimDevice::new(address_of(&frame), &unpad_name(frame.param_range(7, 7 + NAME_LEN)));
                let cod = frame.param_range(7 + NAME_LEN, 11 + NAME_LEN);
                if cod.len() == 4 {
                    device.class = u32::from_be_bytes([cod[0], cod[1], cod[2], cod[3]]);
                }
                self.known.retain(|d| d.address != device.address);
                self.known.push(device);
                self.reply(opcode::LIST_RESULT, &[0x50]);
            }
            opcode::REMOVE_DEVICE => {
                let addr = address_of(&frame);
                let before = self.known.len();
                self.known.retain(|d| d.address != addr);
                let status = if self.known.len() < before { 0x53 } else { 0x54 };
                self.reply(opcode::LIST_RESULT, &[status]);
            }
            other => debug!(op = opcode::opcode_name(other), "sim chip ignoring command"),
        }
    }

    fn connect(&mut self, frame: &Frame) {
        let addr = address_of(frame);
        let delay = self.config.connect_delay;
        let device = self.devices.iter().find(|d| d.address == addr).cloned();
        let (Some(device), Some(handle)) = (device, self.free_handle()) else {
            self.push(opcode::CONNECT_RESULT, &[0, 0xff], delay, true);
            return;
        };
        if device.pin.is_some() {
            let wire = wire_address(&device.address);
            self.pending_connect = Some((handle, device));
            self.push(opcode::REQUEST_PIN_CODE, &wire, self.config.reply_delay, true);
            return;
        }
        self.open_link(handle, device);
        self.push(opcode::CONNECT_RESULT, &[1, handle as u8], delay, true);
    }

    fn pin_code(&mut self, frame: &Frame) {
        let pin = unpad_name(frame.param_range(7, 7 + NAME_LEN));
        self.pins.push(pin.clone());
        let Some((handle, device)) = self.pending_connect.take() else {
            return;
        };
        let delay = self.config.connect_delay;
        if device.pin.as_deref() == Some(pin.as_str()) {
            let wire = wire_address(&device.address);
            self.push(opcode::PIN_CODE_ACK, &wire, self.config.reply_delay, false);
            self.open_link(handle, device);
            self.push(opcode::CONNECT_RESULT, &[1, handle as u8], delay, false);
        } else {
            self.push(opcode::CONNECT_RESULT, &[0, 0xff], delay, false);
        }
    }

    fn begin_inquiry(&mut self, frame: &Frame) {
        let max = frame.param(0) as usize;
        let step = self.config.inquiry_step;
        let found: Vec<Vec<u8>> = self
            .devices
            .iter()
            .take(if max == 0 { usize::MAX } else { max })
            .map(device_record)
            .collect();
        self.reply(opcode::INQUIRY_RUNNING, &[]);
        let mut delay = self.config.reply_delay;
        for record in &found {
            delay += step;
            self.push_tagged(opcode::INQUIRY_RESULT, record, delay, false, true);
        }
        delay += step;
        self.push_tagged(opcode::INQUIRY_STOPPED, &[], delay, false, true);
    }
}

pub(crate) fn wire_address(addr: &[u8; 6]) -> [u8; 7] {
    let mut wire = [0u8; 7];
    wire[..6].copy_from_slice(addr);
    wire
}

fn address_of(frame: &Frame) -> [u8; 6] {
    let mut addr = [0u8; 6];
    let raw = frame.param_range(0, 6);
    addr[..raw.len()].copy_from_slice(raw);
    addr
}

pub(crate) fn pad_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    for (slot, byte) in out.iter_mut().zip(name.bytes()) {
        *slot = byte;
    }
    out
}

fn unpad_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Address, name and class as carried by `INQUIRY_RESULT` and `LIST_ITEM`.
fn device_record(device: &SimDevice) -> Vec<u8> {
    let mut record = wire_address(&device.address).to_vec();
    record.extend_from_slice(&pad_name(&device.name));
    record.extend_from_slice(&device.class.to_be_bytes());
    record
}
