use std::sync::Arc;
use std::time::{Duration, Instant};

use brickcomm_frame::opcode;
use brickcomm_link::ChipMode;

use crate::chip::Shared;
use crate::config::SimDevice;
use crate::state::{pad_name, wire_address, HANDLES};

/// Counters the chip keeps about how it was driven.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Every command opcode received, in order (including while muted).
    pub commands: Vec<u8>,
    /// Mode line dropped to command mode too soon after stream output.
    pub quiescence_violations: usize,
    /// Commands sent while an earlier reply was still unread.
    pub overlapping_commands: usize,
    /// Low-to-high transitions of the reset line.
    pub reset_pulses: usize,
    /// Bytes written while the chip and the mode line disagreed.
    pub dropped_writes: usize,
    /// Command frames that failed to decode.
    pub bad_frames: usize,
    /// Inbound connection requests answered with a reject.
    pub rejected_requests: usize,
}

/// Scripts the world around a [`SimChip`](crate::SimChip).
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Shared>,
}

impl SimController {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Put a device in radio range.
    pub fn add_device(&self, device: SimDevice) {
        let mut st = self.shared.state.lock();
        st.devices.retain(|d| d.address != device.address);
        st.devices.push(device);
    }

    /// Store a device in the chip's known-device list.
    pub fn add_known(&self, device: SimDevice) {
        let mut st = self.shared.state.lock();
        st.known.retain(|d| d.address != device.address);
        st.known.push(device);
    }

    /// Contents of the known-device list.
    pub fn known(&self) -> Vec<SimDevice> {
        self.shared.state.lock().known.clone()
    }

    /// Handle on the remote end of a connection to `address`.
    pub fn remote(&self, address: [u8; 6]) -> SimRemote {
        SimRemote {
            shared: Arc::clone(&self.shared),
            address,
        }
    }

    /// Have `device` ask to connect through the open listening port.
    ///
    /// Returns false when no port is open or a request is already pending.
    pub fn request_connection(&self, device: SimDevice) -> bool {
        let mut st = self.shared.state.lock();
        let Some(port) = st.port else {
            return false;
        };
        if st.pending_inbound.is_some() || !st.powered {
            return false;
        }
        let mut params = wire_address(&device.address).to_vec();
        params.extend_from_slice(&pad_name(&device.name));
        params.extend_from_slice(&device.class.to_be_bytes());
        if !st.devices.iter().any(|d| d.address == device.address) {
            st.devices.push(device.clone());
        }
        st.pending_inbound = Some((port, device));
        let delay = st.config.reply_delay;
        st.push(opcode::REQUEST_CONNECTION, &params, delay, false);
        true
    }

    /// Stop answering commands (they are still recorded). A reset clears it.
    pub fn mute(&self, muted: bool) {
        self.shared.state.lock().muted = muted;
    }

    /// Flip a checksum bit in the next reply the chip queues.
    pub fn corrupt_next_reply(&self) {
        self.shared.state.lock().corrupt_next = true;
    }

    /// Reboot the chip as if it crashed, dropping every connection.
    pub fn reboot(&self) {
        self.shared.state.lock().reboot();
    }

    /// Change the friendly name the chip reports.
    pub fn set_name(&self, name: &str) {
        self.shared.state.lock().name = name.to_string();
    }

    pub fn name(&self) -> String {
        self.shared.state.lock().name.clone()
    }

    pub fn operating_mode(&self) -> u8 {
        self.shared.state.lock().op_mode
    }

    pub fn discoverable(&self) -> bool {
        self.shared.state.lock().discoverable
    }

    pub fn stats(&self) -> SimStats {
        self.shared.state.lock().stats.clone()
    }

    /// Command opcodes received so far.
    pub fn commands(&self) -> Vec<u8> {
        self.shared.state.lock().stats.commands.clone()
    }

    /// PINs presented through `PIN_CODE`.
    pub fn pins(&self) -> Vec<String> {
        self.shared.state.lock().pins.clone()
    }

    pub fn chip_mode(&self) -> ChipMode {
        self.shared.state.lock().chip_mode
    }

    pub fn arm_mode(&self) -> ChipMode {
        self.shared.state.lock().arm_mode
    }

    pub fn is_powered(&self) -> bool {
        self.shared.state.lock().powered
    }

    pub fn port_open(&self) -> bool {
        self.shared.state.lock().port.is_some()
    }

    pub fn connection_count(&self) -> usize {
        let st = self.shared.state.lock();
        (0..HANDLES).filter(|&h| st.links[h].is_some()).count()
    }
}

impl std::fmt::Debug for SimController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimController").finish_non_exhaustive()
    }
}

/// The far end of a simulated connection.
pub struct SimRemote {
    shared: Arc<Shared>,
    address: [u8; 6],
}

impl SimRemote {
    pub fn address(&self) -> [u8; 6] {
        self.address
    }

    pub fn handle(&self) -> Option<u8> {
        self.shared.state.lock().handle_for(&self.address).map(|h| h as u8)
    }

    pub fn is_connected(&self) -> bool {
        self.handle().is_some()
    }

    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        loop {
            if st.handle_for(&self.address).is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.shared.written.wait_for(&mut st, Duration::from_millis(5));
        }
    }

    /// Queue raw bytes for the brick. Returns false when not connected.
    pub fn inject(&self, data: &[u8]) -> bool {
        let mut st = self.shared.state.lock();
        let Some(handle) = st.handle_for(&self.address) else {
            return false;
        };
        match st.links[handle].as_mut() {
            Some(link) => {
                link.from_remote.extend(data);
                true
            }
            None => false,
        }
    }

    /// Send one length-prefixed packet to the brick.
    pub fn send_packet(&self, payload: &[u8]) -> bool {
        let mut wire = (payload.len() as u16).to_le_bytes().to_vec();
        wire.extend_from_slice(payload);
        self.inject(&wire)
    }

    /// Everything the brick sent that has not been taken yet.
    pub fn take_output(&self) -> Vec<u8> {
        let mut st = self.shared.state.lock();
        let Some(handle) = st.handle_for(&self.address) else {
            return Vec::new();
        };
        match st.links[handle].as_mut() {
            Some(link) => link.to_remote.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Wait for one complete length-prefixed packet from the brick.
    pub fn recv_packet(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        loop {
            let handle = st.handle_for(&self.address);
            if let Some(link) = handle.and_then(|h| st.links[h].as_mut()) {
                if link.to_remote.len() >= 2 {
                    let len = usize::from(link.to_remote[0]) | usize::from(link.to_remote[1]) << 8;
                    if link.to_remote.len() >= 2 + len {
                        link.to_remote.drain(..2);
                        return Some(link.to_remote.drain(..len).collect());
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.shared.written.wait_for(&mut st, (deadline - now).min(Duration::from_millis(5)));
        }
    }

    /// Drop the connection from the remote side.
    pub fn close(&self) -> bool {
        let mut st = self.shared.state.lock();
        match st.handle_for(&self.address) {
            Some(handle) => st.drop_link(handle, false),
            None => false,
        }
    }
}

impl std::fmt::Debug for SimRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRemote").field("address", &self.address).finish()
    }
}
