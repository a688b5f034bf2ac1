use std::sync::Arc;

use brickcomm_link::{ChipMode, HardwareLink, LinkError, LinkEvents, Result};
use parking_lot::{Condvar, Mutex};

use crate::config::SimConfig;
use crate::controller::SimController;
use crate::state::ChipState;

pub(crate) struct Shared {
    pub state: Mutex<ChipState>,
    /// Signalled whenever the brick writes, so remotes can block on output.
    pub written: Condvar,
}

/// The brick-side half of the simulated radio.
///
/// Owned by whoever drives the link (normally the engine's arbiter thread).
pub struct SimChip {
    shared: Arc<Shared>,
    detached: bool,
}

impl SimChip {
    /// Create a chip and the controller that scripts it.
    ///
    /// The chip starts powered with the reset line high, in command mode,
    /// without having announced a reset.
    pub fn new(config: SimConfig) -> (Self, SimController) {
        let shared = Arc::new(Shared {
            state: Mutex::new(ChipState::new(config)),
            written: Condvar::new(),
        });
        let controller = SimController::new(Arc::clone(&shared));
        (
            Self {
                shared,
                detached: false,
            },
            controller,
        )
    }

    /// Make every further read and write fail as if the serial port vanished.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl HardwareLink for SimChip {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.detached {
            return Err(LinkError::Detached);
        }
        let n = self.shared.state.lock().write(buf);
        self.shared.written.notify_all();
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.detached {
            return Err(LinkError::Detached);
        }
        let n = self.shared.state.lock().read(buf);
        if n > 0 {
            self.shared.written.notify_all();
        }
        Ok(n)
    }

    fn status(&mut self) -> LinkEvents {
        let mut st = self.shared.state.lock();
        let base = LinkEvents::WRITABLE | LinkEvents::WRITE_EMPTY;
        if !st.powered {
            return base | LinkEvents::CMD_MODE;
        }
        st.settle();
        let mut status = base | st.chip_mode.status_bit();
        if st.readable() {
            status |= LinkEvents::READABLE;
        }
        status
    }

    fn set_mode_line(&mut self, mode: ChipMode) {
        self.shared.state.lock().set_arm_mode(mode);
    }

    fn set_reset_line(&mut self, high: bool) {
        self.shared.state.lock().set_reset_line(high);
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

impl std::fmt::Debug for SimChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("SimChip")
            .field("powered", &st.powered)
            .field("chip_mode", &st.chip_mode)
            .field("arm_mode", &st.arm_mode)
            .field("active", &st.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use brickcomm_frame::{encode_frame, opcode, Frame, ReplyReader};
    use bytes::BytesMut;

    use super::*;
    use crate::config::SimDevice;

    const ROVER: [u8; 6] = [0x00, 0x16, 0x53, 0x0a, 0x0b, 0x0c];

    fn send(chip: &mut SimChip, op: u8, params: &[u8]) {
        let mut wire = BytesMut::new();
        encode_frame(op, params, &mut wire).expect("encode");
        assert_eq!(chip.write(&wire).expect("write"), wire.len());
    }

    fn recv(chip: &mut SimChip, reader: &mut ReplyReader) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(frame) = reader.read_reply(chip).expect("read reply") {
                return frame;
            }
            assert!(Instant::now() < deadline, "no reply from sim chip");
            chip.wait(LinkEvents::READABLE, Duration::from_millis(10));
        }
    }

    fn wire_addr(addr: [u8; 6]) -> Vec<u8> {
        let mut out = addr.to_vec();
        out.push(0);
        out
    }

    fn open_stream(chip: &mut SimChip, reader: &mut ReplyReader) -> u8 {
        send(chip, opcode::CONNECT, &wire_addr(ROVER));
        let result = recv(chip, reader);
        assert_eq!(result.opcode, opcode::CONNECT_RESULT);
        assert_eq!(result.param(0), 1);
        let handle = result.param(1);
        send(chip, opcode::OPEN_STREAM, &[handle]);
        assert_eq!(chip.chip_mode(), Some(ChipMode::Stream));
        chip.set_mode_line(ChipMode::Stream);
        handle
    }

    #[test]
    fn reset_pulse_announces_reset() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        let mut reader = ReplyReader::new();
        chip.set_reset_line(false);
        assert!(!controller.is_powered());
        chip.set_reset_line(true);
        let frame = recv(&mut chip, &mut reader);
        assert_eq!(frame.opcode, opcode::RESET_INDICATION);
        assert_eq!(controller.stats().reset_pulses, 1);
    }

    #[test]
    fn answers_version_query() {
        let (mut chip, _controller) = SimChip::new(SimConfig::default());
        let mut reader = ReplyReader::new();
        send(&mut chip, opcode::GET_VERSION, &[]);
        let frame = recv(&mut chip, &mut reader);
        assert_eq!(frame.opcode, opcode::GET_VERSION_RESULT);
        assert_eq!(frame.params.as_ref(), &[1, 2]);
    }

    #[test]
    fn echo_device_streams_back() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        controller.add_device(SimDevice::new(ROVER, "rover").echoing());
        let mut reader = ReplyReader::new();
        open_stream(&mut chip, &mut reader);

        chip.write(b"ping").expect("write");
        let mut buf = [0u8; 8];
        let n = chip.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn remote_sees_stream_output() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        controller.add_device(SimDevice::new(ROVER, "rover"));
        let mut reader = ReplyReader::new();
        open_stream(&mut chip, &mut reader);

        chip.write(&[2, 0, 7, 8]).expect("write");
        let remote = controller.remote(ROVER);
        assert_eq!(remote.recv_packet(Duration::from_millis(100)), Some(vec![7, 8]));

        remote.send_packet(&[9]);
        let mut buf = [0u8; 8];
        let n = chip.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], &[1, 0, 9]);
    }

    #[test]
    fn overlapping_commands_are_counted() {
        let config = SimConfig {
            reply_delay: Duration::from_millis(50),
            ..SimConfig::default()
        };
        let (mut chip, controller) = SimChip::new(config);
        send(&mut chip, opcode::GET_VERSION, &[]);
        send(&mut chip, opcode::GET_FRIENDLY_NAME, &[]);
        assert_eq!(controller.stats().overlapping_commands, 1);
    }

    #[test]
    fn early_switch_counts_quiescence_violation() {
        let config = SimConfig {
            quiescence: Duration::from_millis(500),
            ..SimConfig::default()
        };
        let (mut chip, controller) = SimChip::new(config);
        controller.add_device(SimDevice::new(ROVER, "rover"));
        let mut reader = ReplyReader::new();
        open_stream(&mut chip, &mut reader);

        chip.write(&[1, 0, 1]).expect("write");
        chip.set_mode_line(ChipMode::Command);
        assert_eq!(controller.stats().quiescence_violations, 1);
        assert_eq!(chip.chip_mode(), Some(ChipMode::Command));
    }

    #[test]
    fn pending_stream_input_delays_switch() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        controller.add_device(SimDevice::new(ROVER, "rover"));
        let mut reader = ReplyReader::new();
        open_stream(&mut chip, &mut reader);

        controller.remote(ROVER).inject(&[1, 2, 3]);
        chip.set_mode_line(ChipMode::Command);
        assert_eq!(chip.chip_mode(), Some(ChipMode::Stream));

        let mut buf = [0u8; 8];
        assert_eq!(chip.read(&mut buf).expect("read"), 3);
        assert_eq!(chip.chip_mode(), Some(ChipMode::Command));
    }

    #[test]
    fn inbound_request_and_accept() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        let mut reader = ReplyReader::new();
        send(&mut chip, opcode::OPEN_PORT, &[]);
        let port = recv(&mut chip, &mut reader);
        assert_eq!(port.params.as_ref(), &[1, 3, 1]);

        assert!(controller.request_connection(SimDevice::new(ROVER, "rover")));
        let request = recv(&mut chip, &mut reader);
        assert_eq!(request.opcode, opcode::REQUEST_CONNECTION);
        assert_eq!(request.param_range(0, 6), &ROVER);

        send(&mut chip, opcode::ACCEPT_CONNECTION, &[1]);
        let result = recv(&mut chip, &mut reader);
        assert_eq!(result.opcode, opcode::CONNECT_RESULT);
        assert_eq!(result.params.as_ref(), &[1, 3]);
        assert!(controller.remote(ROVER).is_connected());
    }

    #[test]
    fn pin_device_requires_matching_pin() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        controller.add_device(SimDevice::new(ROVER, "rover").with_pin("0000"));
        let mut reader = ReplyReader::new();

        send(&mut chip, opcode::CONNECT, &wire_addr(ROVER));
        assert_eq!(recv(&mut chip, &mut reader).opcode, opcode::REQUEST_PIN_CODE);
        let mut pin = wire_addr(ROVER);
        pin.extend_from_slice(&crate::state::pad_name("0000"));
        send(&mut chip, opcode::PIN_CODE, &pin);
        assert_eq!(recv(&mut chip, &mut reader).opcode, opcode::PIN_CODE_ACK);
        let result = recv(&mut chip, &mut reader);
        assert_eq!(result.param(0), 1);
        assert_eq!(controller.pins(), vec!["0000".to_string()]);
    }

    #[test]
    fn inquiry_reports_devices_then_stops() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        controller.add_device(SimDevice::new(ROVER, "rover").with_class(0x1234));
        controller.add_device(SimDevice::new([1, 2, 3, 4, 5, 6], "other"));
        let mut reader = ReplyReader::new();

        send(&mut chip, opcode::BEGIN_INQUIRY, &[1, 0, 2, 0, 0, 0, 0]);
        assert_eq!(recv(&mut chip, &mut reader).opcode, opcode::INQUIRY_RUNNING);
        let result = recv(&mut chip, &mut reader);
        assert_eq!(result.opcode, opcode::INQUIRY_RESULT);
        assert_eq!(result.param_range(0, 6), &ROVER);
        assert_eq!(result.param_range(7, 12), b"rover");
        assert_eq!(result.param_range(23, 27), &[0, 0, 0x12, 0x34]);
        assert_eq!(recv(&mut chip, &mut reader).opcode, opcode::INQUIRY_STOPPED);
    }

    #[test]
    fn remote_close_drops_stream() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        controller.add_device(SimDevice::new(ROVER, "rover"));
        let mut reader = ReplyReader::new();
        let handle = open_stream(&mut chip, &mut reader);

        assert!(controller.remote(ROVER).close());
        assert_eq!(chip.chip_mode(), Some(ChipMode::Command));
        chip.set_mode_line(ChipMode::Command);
        let frame = recv(&mut chip, &mut reader);
        assert_eq!(frame.opcode, opcode::CLOSE_CONNECTION_RESULT);
        assert_eq!(frame.params.as_ref(), &[0, handle]);
        assert_eq!(controller.connection_count(), 0);
    }

    #[test]
    fn muted_chip_never_replies() {
        let (mut chip, controller) = SimChip::new(SimConfig::default());
        controller.mute(true);
        send(&mut chip, opcode::GET_VERSION, &[]);
        std::thread::sleep(Duration::from_millis(10));
        let mut buf = [0u8; 8];
        assert_eq!(chip.read(&mut buf).expect("read"), 0);
        assert_eq!(controller.commands(), vec![opcode::GET_VERSION]);
    }

    #[test]
    fn detached_chip_errors() {
        let (mut chip, _controller) = SimChip::new(SimConfig::default());
        chip.detach();
        assert!(matches!(chip.write(&[1]), Err(LinkError::Detached)));
    }
}
