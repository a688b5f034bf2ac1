//! The public engine handle and its administrative operations.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use brickcomm_conn::{ConnState, IoMode};
use brickcomm_frame::{opcode, Frame};
use brickcomm_link::{HardwareLink, LinkEvents, POLL_SLICE};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::address::{decode_name, encode_name, BtAddress, ADDRESS_LEN, NAME_LEN};
use crate::arbiter::Arbiter;
use crate::config::{validate_pin, EngineConfig, Settings};
use crate::connection::Connection;
use crate::device::{DeviceInfo, DiscoveryListener, InquiryStatus};
use crate::engine::{reply_range, Command, Engine, InquiryState, LineRequest, LinkMode, RequestState, CHANNELS};
use crate::error::{BtError, Result};

/// Longest a listener sleeps between checks of its own deadline.
const LISTEN_SLICE: Duration = Duration::from_secs(1);

/// LIST_RESULT status for a device stored in the known-device list.
const LIST_ADDED: u8 = 0x50;
/// LIST_RESULT status for a device removed from the known-device list.
const LIST_REMOVED: u8 = 0x53;

/// Handle to a running Bluetooth engine.
///
/// Cheap to clone; every clone drives the same arbiter thread. The engine
/// stops when [`shutdown`](Bluetooth::shutdown) is called or the last handle
/// (including those held by open [`Connection`]s) is dropped.
///
/// ```text
///   app threads ──► Bluetooth ──► CmdState (one request) ─┐
///                       │                                 ▼
///                   Connection ──► Channel[0..4] ──► Arbiter ──► HardwareLink
/// ```
#[derive(Clone)]
pub struct Bluetooth {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub engine: Arc<Engine>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn stop(&self) -> Result<()> {
        self.engine.halt();
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| BtError::Io(std::io::Error::other("arbiter thread panicked")))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "stopping bluetooth engine");
        }
    }
}

/// Observable snapshot of the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub mode: LinkMode,
    /// Channel that owns stream mode, if any.
    pub active_channel: Option<usize>,
    pub listening: bool,
    /// Channels whose link is up.
    pub connected: usize,
    pub request: RequestState,
    pub powered: bool,
    pub reset_count: u32,
}

enum Notice {
    Found(DeviceInfo),
    Done(InquiryStatus),
}

impl Bluetooth {
    /// Start the engine on `link`.
    ///
    /// Spawns the arbiter thread, resets the chip, checks it answers, closes
    /// any stale listening port and primes the name and address caches.
    pub fn start(link: impl HardwareLink + 'static, config: EngineConfig) -> Result<Self> {
        let settings = match &config.settings_path {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        let engine = Engine::new(config, settings.bluetooth_pin);
        let arbiter = Arbiter::new(Arc::clone(&engine), Box::new(link));
        let thread = thread::Builder::new()
            .name("bt-arbiter".to_string())
            .spawn(move || arbiter.run())?;
        let bt = Self {
            inner: Arc::new(Inner {
                engine,
                thread: Mutex::new(Some(thread)),
            }),
        };
        bt.boot()?;
        Ok(bt)
    }

    fn boot(&self) -> Result<()> {
        let engine = self.engine();
        {
            let mut cmd = engine.begin()?;
            cmd.powered = true;
            cmd.force_reset()?;
            check_device(engine, &mut cmd)?;
            cmd.request(
                opcode::SET_OPERATING_MODE,
                &[1],
                &[opcode::OPERATING_MODE_RESULT],
                engine.config.short_timeout,
            )?;
        }
        self.close_port()?;
        let name = self.friendly_name()?;
        let address = self.local_address()?;
        info!(%address, name = %name, "bluetooth ready");
        Ok(())
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Close every live connection, stop the arbiter and power the chip down.
    pub fn shutdown(&self) -> Result<()> {
        let engine = self.engine();
        for chan in &engine.channels {
            if chan.buffer.state() != ConnState::Idle {
                chan.buffer.close();
            }
        }
        self.inner.stop()?;
        info!("bluetooth shut down");
        Ok(())
    }

    /// Connect to `target`, an address or the friendly name of a known device.
    ///
    /// `pin` overrides the configured PIN if the remote asks to pair.
    pub fn connect(&self, target: &str, mode: IoMode, pin: Option<&str>) -> Result<Connection> {
        if let Some(pin) = pin {
            validate_pin(pin)?;
        }
        let address = self.resolve(target)?;
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        if engine.connected() >= CHANNELS {
            return Err(BtError::NoFreeChannel);
        }
        let saved = pin.map(|p| std::mem::replace(&mut cmd.pin, p.to_string()));
        let outcome = connect_with(engine, &mut cmd, address, mode);
        if let Some(saved) = saved {
            cmd.pin = saved;
        }
        let (index, epoch) = outcome?;
        drop(cmd);
        info!(handle = index, %address, "connected");
        Ok(Connection::new(self.clone(), index, epoch))
    }

    fn resolve(&self, target: &str) -> Result<BtAddress> {
        if BtAddress::is_address(target) {
            return target.parse();
        }
        self.known_devices()?
            .into_iter()
            .find(|d| d.name == target)
            .map(|d| d.address)
            .ok_or_else(|| BtError::UnknownDevice(target.to_string()))
    }

    /// Wait for an inbound connection.
    ///
    /// `None` waits until [`cancel_listen`](Bluetooth::cancel_listen). While
    /// listening, the arbiter stays in command mode and existing connections
    /// get no stream time.
    pub fn listen(&self, timeout: Option<Duration>, mode: IoMode, pin: Option<&str>) -> Result<Connection> {
        if let Some(pin) = pin {
            validate_pin(pin)?;
        }
        let engine = self.engine();
        let (resets, saved) = {
            let mut cmd = engine.begin()?;
            if cmd.listening {
                return Err(BtError::Busy("already listening"));
            }
            let handle = open_port_with(engine, &mut cmd)?;
            debug!(handle, "listening port open");
            cmd.listening = true;
            let saved = pin.map(|p| std::mem::replace(&mut cmd.pin, p.to_string()));
            (cmd.reset_count, saved)
        };
        info!(?timeout, "listening for connections");

        let outcome = self.await_inbound(timeout, mode, resets);
        if let Some(saved) = saved {
            engine.state.lock().pin = saved;
        }
        match outcome {
            Ok((index, epoch)) => {
                info!(handle = index, "inbound connection accepted");
                Ok(Connection::new(self.clone(), index, epoch))
            }
            Err(e) => {
                if !matches!(e, BtError::ShutDown | BtError::PoweredOff) {
                    if let Err(close) = self.close_port() {
                        debug!(error = %close, "closing listening port");
                    }
                }
                Err(e)
            }
        }
    }

    fn await_inbound(&self, timeout: Option<Duration>, mode: IoMode, resets: u32) -> Result<(usize, u64)> {
        let engine = self.engine();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut expired = false;
        let mut st = engine.state.lock();
        while st.req != RequestState::AwaitingInboundAccept && st.listening && st.req != RequestState::Off {
            let slice = match deadline {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        st.listening = false;
                        expired = true;
                        break;
                    }
                    (at - now).min(LISTEN_SLICE)
                }
                None => LISTEN_SLICE,
            };
            engine.cond.wait_for(&mut st, slice);
        }

        if st.req == RequestState::Off {
            return Err(BtError::ShutDown);
        }
        if st.req != RequestState::AwaitingInboundAccept {
            return Err(if st.reset_count != resets {
                BtError::Reset
            } else if expired {
                BtError::Timeout
            } else {
                BtError::Cancelled
            });
        }

        let address = st.inbound.take().unwrap_or_default();
        st.req = st.saved;
        let accept = st.listening;
        st.listening = false;
        let mut cmd = Command::claim(engine, st)?;
        if !accept {
            debug!(%address, "rejecting connection, listen ended");
            cmd.send_only(opcode::ACCEPT_CONNECTION, &[0])?;
            return Err(if expired { BtError::Timeout } else { BtError::Cancelled });
        }
        let reply = cmd.request(
            opcode::ACCEPT_CONNECTION,
            &[1],
            &[opcode::CONNECT_RESULT],
            engine.config.long_timeout,
        )?;
        let index = checked_handle(opcode::ACCEPT_CONNECTION, &reply)?;
        if engine.channels[index].buffer.state().is_live() {
            return Err(BtError::NoFreeChannel);
        }
        Ok((index, engine.channels[index].bind(address, mode)))
    }

    /// Stop a pending [`listen`](Bluetooth::listen). Returns false if nobody
    /// was listening.
    pub fn cancel_listen(&self) -> bool {
        let engine = self.engine();
        let mut st = engine.state.lock();
        if !st.listening {
            return false;
        }
        st.listening = false;
        engine.cond.notify_all();
        engine.events.notify(LinkEvents::NEW_CMD);
        true
    }

    /// Discover nearby devices.
    ///
    /// `timeout_units` is in the chip's 1.28 s inquiry units and `class`
    /// filters by class of device (0 for any). Devices whose name did not
    /// come back are looked up individually.
    pub fn inquire(&self, max_devices: u8, timeout_units: u8, class: u32) -> Result<Vec<DeviceInfo>> {
        let mut found = Vec::new();
        let status = self.run_inquiry(max_devices, timeout_units, class, |d| found.push(d))?;
        debug!(?status, count = found.len(), "inquiry finished");
        for device in found.iter_mut().filter(|d| d.name.is_empty()) {
            if let Some(name) = self.lookup_name(device.address)? {
                device.name = name;
            }
        }
        Ok(found)
    }

    /// Run an inquiry in the background, reporting to `listener`.
    ///
    /// Results are delivered on a notifier thread, never on the caller's or
    /// the arbiter's.
    pub fn inquire_notify(
        &self,
        max_devices: u8,
        timeout_units: u8,
        class: u32,
        listener: impl DiscoveryListener,
    ) -> Result<()> {
        let (tx, rx) = unbounded::<Notice>();
        let mut listener = listener;
        thread::Builder::new().name("bt-discovery".to_string()).spawn(move || {
            for notice in rx {
                match notice {
                    Notice::Found(device) => listener.device_discovered(device),
                    Notice::Done(status) => {
                        listener.inquiry_completed(status);
                        break;
                    }
                }
            }
        })?;

        let bt = self.clone();
        thread::Builder::new().name("bt-inquiry".to_string()).spawn(move || {
            let status = bt
                .run_inquiry(max_devices, timeout_units, class, |d| {
                    let _ = tx.send(Notice::Found(d));
                })
                .unwrap_or_else(|e| {
                    warn!(error = %e, "inquiry failed");
                    InquiryStatus::Error
                });
            let _ = tx.send(Notice::Done(status));
        })?;
        Ok(())
    }

    fn run_inquiry(
        &self,
        max_devices: u8,
        timeout_units: u8,
        class: u32,
        mut on_device: impl FnMut(DeviceInfo),
    ) -> Result<InquiryStatus> {
        let engine = self.engine();
        let long = engine.config.long_timeout;
        let mut cmd = engine.begin()?;
        let mut params = vec![max_devices, 0, timeout_units];
        params.extend_from_slice(&class.to_be_bytes());
        cmd.inquiry = InquiryState::Running;

        let mut outcome = cmd.request(opcode::BEGIN_INQUIRY, &params, &[], long);
        let result = loop {
            let reply = match outcome {
                Ok(reply) => reply,
                Err(e) => break Err(e),
            };
            match reply.opcode {
                opcode::INQUIRY_RESULT if cmd.inquiry == InquiryState::Running => {
                    on_device(DeviceInfo::from_record(&reply.params));
                }
                opcode::INQUIRY_STOPPED => {
                    break Ok(if cmd.inquiry == InquiryState::Canceled {
                        InquiryStatus::Terminated
                    } else {
                        cmd.inquiry = InquiryState::Complete;
                        InquiryStatus::Completed
                    });
                }
                _ => {}
            }
            outcome = cmd.next_reply(&[], long);
        };
        cmd.inquiry = InquiryState::Idle;
        result
    }

    /// Stop a running inquiry once the chip has accepted it.
    ///
    /// Returns false if no inquiry is running.
    pub fn cancel_inquiry(&self) -> Result<bool> {
        let engine = self.engine();
        let mut st = engine.state.lock();
        loop {
            if st.inquiry != InquiryState::Running {
                return Ok(false);
            }
            match st.req {
                RequestState::AwaitingChip => break,
                RequestState::Off => return Err(BtError::ShutDown),
                _ => {
                    engine.cond.wait_for(&mut st, POLL_SLICE);
                }
            }
        }
        debug!("cancelling inquiry");
        st.command = Some(Frame::new(opcode::CANCEL_INQUIRY, Vec::new()));
        st.req = RequestState::Queued;
        st.inquiry = InquiryState::Canceled;
        engine.events.notify(LinkEvents::NEW_CMD);
        Ok(true)
    }

    /// Ask the chip for the name of `address`. `None` if the lookup failed.
    pub fn lookup_name(&self, address: BtAddress) -> Result<Option<String>> {
        let reply = self.request(
            opcode::LOOKUP_NAME,
            &address.to_wire(),
            &[opcode::LOOKUP_NAME_RESULT, opcode::LOOKUP_NAME_FAILURE],
            self.engine().config.long_timeout,
        )?;
        if reply.opcode == opcode::LOOKUP_NAME_FAILURE {
            debug!(%address, "name lookup failed");
            return Ok(None);
        }
        Ok(Some(decode_name(reply.param_range(ADDRESS_LEN, ADDRESS_LEN + NAME_LEN))))
    }

    /// The chip's list of known (paired) devices.
    pub fn known_devices(&self) -> Result<Vec<DeviceInfo>> {
        let engine = self.engine();
        let long = engine.config.long_timeout;
        let expect = [opcode::LIST_ITEM, opcode::LIST_DUMP_STOPPED];
        let mut cmd = engine.begin()?;
        let mut devices = Vec::new();
        let mut reply = cmd.request(opcode::DUMP_LIST, &[], &expect, long)?;
        while reply.opcode == opcode::LIST_ITEM {
            devices.push(DeviceInfo::from_record(&reply.params));
            reply = cmd.next_reply(&expect, long)?;
        }
        Ok(devices)
    }

    /// Store `device` in the chip's known-device list.
    pub fn add_device(&self, device: &DeviceInfo) -> Result<()> {
        let mut params = device.address.to_wire().to_vec();
        params.extend_from_slice(&encode_name(&device.name)?);
        params.extend_from_slice(&device.class.to_be_bytes());
        let reply = self.request(
            opcode::ADD_DEVICE,
            &params,
            &[opcode::LIST_RESULT],
            self.engine().config.long_timeout,
        )?;
        list_status(opcode::ADD_DEVICE, &reply, LIST_ADDED)
    }

    /// Drop `address` from the known-device list.
    pub fn remove_device(&self, address: BtAddress) -> Result<()> {
        let reply = self.request(
            opcode::REMOVE_DEVICE,
            &address.to_wire(),
            &[opcode::LIST_RESULT],
            self.engine().config.long_timeout,
        )?;
        list_status(opcode::REMOVE_DEVICE, &reply, LIST_REMOVED)
    }

    /// Open the chip's listening port. Returns the handle it reserved.
    ///
    /// Inbound requests are only accepted by [`listen`](Bluetooth::listen);
    /// with the port open but nobody listening they are rejected.
    pub fn open_port(&self) -> Result<u8> {
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        // Handles are 0..4.
        Ok(open_port_with(engine, &mut cmd)? as u8)
    }

    /// Close the listening port. Any pending listen ends.
    pub fn close_port(&self) -> Result<()> {
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        cmd.request(
            opcode::CLOSE_PORT,
            &[3],
            &[opcode::CLOSE_PORT_RESULT],
            engine.config.short_timeout,
        )?;
        cmd.listening = false;
        Ok(())
    }

    /// Per-handle status; 2 means connected.
    pub fn connection_status(&self) -> Result<[u8; CHANNELS]> {
        self.engine().begin()?.connection_status()
    }

    /// Firmware version as (major, minor).
    pub fn version(&self) -> Result<(u8, u8)> {
        let reply = self.short_request(opcode::GET_VERSION, &[], opcode::GET_VERSION_RESULT)?;
        Ok((reply.param(0), reply.param(1)))
    }

    /// The two brick status bytes, first byte high.
    pub fn status(&self) -> Result<u16> {
        let reply = self.short_request(opcode::GET_BRICK_STATUSBYTE, &[], opcode::GET_BRICK_STATUSBYTE_RESULT)?;
        Ok(u16::from_be_bytes(reply_range::<2>(&reply, 0)))
    }

    pub fn set_status(&self, status: u16) -> Result<()> {
        self.short_request(
            opcode::SET_BRICK_STATUSBYTE,
            &status.to_be_bytes(),
            opcode::SET_BRICK_STATUSBYTE_RESULT,
        )?;
        Ok(())
    }

    /// Whether the chip answers inquiries from other devices.
    pub fn visibility(&self) -> Result<bool> {
        let reply = self.short_request(opcode::GET_DISCOVERABLE, &[], opcode::GET_DISCOVERABLE_RESULT)?;
        Ok(reply.param(0) != 0)
    }

    pub fn set_visibility(&self, visible: bool) -> Result<()> {
        self.short_request(opcode::SET_DISCOVERABLE, &[u8::from(visible)], opcode::SET_DISCOVERABLE_ACK)?;
        Ok(())
    }

    pub fn port_open(&self) -> Result<bool> {
        let reply = self.short_request(opcode::GET_PORT_OPEN, &[], opcode::GET_PORT_OPEN_RESULT)?;
        Ok(reply.param(0) != 0)
    }

    pub fn operating_mode(&self) -> Result<u8> {
        let reply = self.short_request(opcode::GET_OPERATING_MODE, &[], opcode::OPERATING_MODE_RESULT)?;
        Ok(reply.param(0))
    }

    pub fn set_operating_mode(&self, mode: u8) -> Result<()> {
        self.short_request(opcode::SET_OPERATING_MODE, &[mode], opcode::OPERATING_MODE_RESULT)?;
        Ok(())
    }

    /// Restore the chip's factory settings. Clears the cached name.
    pub fn set_factory_settings(&self) -> Result<()> {
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        cmd.request(
            opcode::SET_FACTORY_SETTINGS,
            &[],
            &[opcode::SET_FACTORY_SETTINGS_ACK],
            engine.config.short_timeout,
        )?;
        cmd.cached_name = None;
        Ok(())
    }

    /// The chip's friendly name, cached after the first read.
    pub fn friendly_name(&self) -> Result<String> {
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        if let Some(name) = &cmd.cached_name {
            return Ok(name.clone());
        }
        let reply = cmd.request(
            opcode::GET_FRIENDLY_NAME,
            &[],
            &[opcode::GET_FRIENDLY_NAME_RESULT],
            engine.config.short_timeout,
        )?;
        let name = decode_name(reply.param_range(0, NAME_LEN));
        cmd.cached_name = Some(name.clone());
        Ok(name)
    }

    pub fn set_friendly_name(&self, name: &str) -> Result<()> {
        let raw = encode_name(name)?;
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        cmd.cached_name = None;
        cmd.request(
            opcode::SET_FRIENDLY_NAME,
            &raw,
            &[opcode::SET_FRIENDLY_NAME_ACK],
            engine.config.long_timeout,
        )?;
        cmd.cached_name = Some(name.to_string());
        Ok(())
    }

    /// The chip's own address, cached after the first read.
    pub fn local_address(&self) -> Result<BtAddress> {
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        if let Some(address) = cmd.cached_address {
            return Ok(address);
        }
        let reply = cmd.request(
            opcode::GET_LOCAL_ADDR,
            &[],
            &[opcode::GET_LOCAL_ADDR_RESULT],
            engine.config.short_timeout,
        )?;
        let address = BtAddress::from_wire(&reply.params);
        cmd.cached_address = Some(address);
        Ok(address)
    }

    /// Link quality (0-255) of the connection on `handle`.
    pub fn signal_strength(&self, handle: u8) -> Result<u8> {
        self.engine().signal_strength(handle)
    }

    /// Force a chip reset. Every connection is dropped. Returns the new reset
    /// count.
    pub fn reset(&self) -> Result<u32> {
        let mut cmd = self.engine().begin()?;
        cmd.force_reset()?;
        Ok(cmd.reset_count)
    }

    pub fn reset_count(&self) -> u32 {
        self.engine().state.lock().reset_count
    }

    pub fn power(&self) -> bool {
        self.engine().state.lock().powered
    }

    /// Power the radio on or off. Powering off drops every connection.
    pub fn set_power(&self, on: bool) -> Result<()> {
        let engine = self.engine();
        let mut cmd = engine.begin()?;
        if cmd.powered == on {
            return Ok(());
        }
        if on {
            cmd.apply_line(LineRequest::PowerOn)?;
            cmd.powered = true;
            check_device(engine, &mut cmd)?;
        } else {
            if engine.connected() > 0 || cmd.listening {
                cmd.force_reset()?;
            }
            cmd.apply_line(LineRequest::PowerOff)?;
            cmd.powered = false;
        }
        info!(on, "radio power changed");
        Ok(())
    }

    pub fn link_state(&self) -> LinkState {
        let engine = self.engine();
        let st = engine.state.lock();
        LinkState {
            mode: st.mode,
            active_channel: st.cur_chan.filter(|_| st.mode == LinkMode::Stream),
            listening: st.listening,
            connected: engine.connected(),
            request: st.req,
            powered: st.powered,
            reset_count: st.reset_count,
        }
    }

    /// The PIN presented when a remote asks to pair.
    pub fn pin(&self) -> String {
        self.engine().state.lock().pin.clone()
    }

    pub fn set_pin(&self, pin: &str) -> Result<()> {
        validate_pin(pin)?;
        self.engine().state.lock().pin = pin.to_string();
        Ok(())
    }

    /// Re-read the settings file and apply it.
    pub fn reload_settings(&self) -> Result<()> {
        let settings = Settings::load(self.settings_path()?)?;
        debug!("settings reloaded");
        self.engine().state.lock().pin = settings.bluetooth_pin;
        Ok(())
    }

    /// Persist the current settings.
    pub fn save_settings(&self) -> Result<()> {
        let settings = Settings {
            bluetooth_pin: self.pin(),
        };
        settings.save(self.settings_path()?)
    }

    fn settings_path(&self) -> Result<&std::path::Path> {
        self.engine()
            .config
            .settings_path
            .as_deref()
            .ok_or_else(|| BtError::Settings("no settings path configured".to_string()))
    }

    fn request(&self, op: u8, params: &[u8], expect: &[u8], timeout: Duration) -> Result<Frame> {
        self.engine().begin()?.request(op, params, expect, timeout)
    }

    fn short_request(&self, op: u8, params: &[u8], expect: u8) -> Result<Frame> {
        self.request(op, params, &[expect], self.engine().config.short_timeout)
    }
}

impl std::fmt::Debug for Bluetooth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bluetooth").field("state", &self.link_state()).finish()
    }
}

/// Poll the chip until it answers, or give up with `Timeout`.
fn check_device(engine: &Engine, cmd: &mut Command<'_>) -> Result<()> {
    for attempt in 0..engine.config.device_check_attempts {
        match cmd.request(
            opcode::GET_OPERATING_MODE,
            &[],
            &[opcode::OPERATING_MODE_RESULT],
            engine.config.check_timeout,
        ) {
            Ok(_) => return Ok(()),
            Err(e @ (BtError::ShutDown | BtError::PoweredOff)) => return Err(e),
            Err(e) => debug!(attempt, error = %e, "radio not answering"),
        }
    }
    Err(BtError::Timeout)
}

fn connect_with(engine: &Engine, cmd: &mut Command<'_>, address: BtAddress, mode: IoMode) -> Result<(usize, u64)> {
    debug!(%address, "connecting");
    let reply = cmd.request(
        opcode::CONNECT,
        &address.to_wire(),
        &[opcode::CONNECT_RESULT],
        engine.config.long_timeout,
    )?;
    let index = checked_handle(opcode::CONNECT, &reply)?;
    if engine.channels[index].buffer.state().is_live() {
        return Err(BtError::NoFreeChannel);
    }
    // A remote that refuses the stream closes straight away.
    if !cmd.pause(engine.config.connect_settle)? {
        warn!(%address, handle = index, "connection dropped during setup");
        return Err(BtError::SetupAborted);
    }
    Ok((index, engine.channels[index].bind(address, mode)))
}

fn open_port_with(engine: &Engine, cmd: &mut Command<'_>) -> Result<usize> {
    let reply = cmd.request(
        opcode::OPEN_PORT,
        &[],
        &[opcode::PORT_OPEN_RESULT],
        engine.config.short_timeout,
    )?;
    checked_handle(opcode::OPEN_PORT, &reply)
}

/// Status byte 1 and a handle in range, or the matching error.
fn checked_handle(op: u8, reply: &Frame) -> Result<usize> {
    let status = reply.param(0);
    if status != 1 {
        return Err(BtError::Rejected { opcode: op, status });
    }
    let handle = reply.param(1);
    if usize::from(handle) >= CHANNELS {
        return Err(BtError::InvalidHandle(handle));
    }
    Ok(usize::from(handle))
}

fn list_status(op: u8, reply: &Frame, success: u8) -> Result<()> {
    match reply.param(0) {
        status if status == success => Ok(()),
        status => Err(BtError::Rejected { opcode: op, status }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brickcomm_sim::{SimChip, SimConfig, SimDevice};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(ms(2));
        }
        check()
    }

    #[test]
    fn cancel_after_capture_rejects_the_request() {
        let config = EngineConfig {
            io_quantum: ms(20),
            command_poll: ms(5),
            reply_byte_timeout: ms(50),
            check_timeout: ms(100),
            short_timeout: ms(300),
            reset_wait: ms(200),
            quiescence: ms(15),
            reset_pulse: ms(5),
            ..EngineConfig::default()
        };
        let (chip, controller) = SimChip::new(SimConfig::default());
        let bt = Bluetooth::start(chip, config).expect("engine should start");
        bt.open_port().expect("open port");
        let resets = bt.reset_count();

        // Stand in for a listener that has not yet woken up to the capture.
        bt.engine().state.lock().listening = true;
        assert!(controller.request_connection(SimDevice::new([0, 0x16, 0x53, 9, 9, 9], "late")));
        assert!(wait_for(|| bt.engine().state.lock().req == RequestState::AwaitingInboundAccept));

        assert!(bt.cancel_listen());
        let result = bt.await_inbound(Some(Duration::from_secs(1)), IoMode::Packet, resets);
        assert!(matches!(result, Err(BtError::Cancelled)));

        assert!(wait_for(|| controller.stats().rejected_requests == 1));
        let state = bt.link_state();
        assert_eq!(state.connected, 0);
        assert!(!state.listening);
        assert!(bt.engine().channels.iter().all(|c| c.address().is_none()));
        assert_eq!(bt.engine().state.lock().req, RequestState::Idle);
        bt.shutdown().expect("shutdown");
    }

    #[test]
    fn checked_handle_rejects_failure_and_range() {
        let ok = Frame::new(opcode::CONNECT_RESULT, vec![1, 2]);
        assert_eq!(checked_handle(opcode::CONNECT, &ok).expect("handle 2"), 2);

        let refused = Frame::new(opcode::CONNECT_RESULT, vec![0, 0xff]);
        assert!(matches!(
            checked_handle(opcode::CONNECT, &refused),
            Err(BtError::Rejected { opcode: opcode::CONNECT, status: 0 })
        ));

        let wild = Frame::new(opcode::CONNECT_RESULT, vec![1, 9]);
        assert!(matches!(checked_handle(opcode::CONNECT, &wild), Err(BtError::InvalidHandle(9))));
    }

    #[test]
    fn list_status_matches_success_code() {
        let added = Frame::new(opcode::LIST_RESULT, vec![LIST_ADDED]);
        assert!(list_status(opcode::ADD_DEVICE, &added, LIST_ADDED).is_ok());

        let missing = Frame::new(opcode::LIST_RESULT, vec![0x54]);
        assert!(matches!(
            list_status(opcode::REMOVE_DEVICE, &missing, LIST_REMOVED),
            Err(BtError::Rejected { status: 0x54, .. })
        ));
    }
}
