//! The engine on a simulated chip with a small demo neighbourhood.

use std::path::Path;

use brickcomm_bt::{Bluetooth, EngineConfig};
use brickcomm_sim::{SimChip, SimConfig, SimController, SimDevice};
use tracing::debug;

use crate::exit::{bt_error, CliResult};

/// Echoing robot, also on the chip's known-device list.
pub const ROVER: ([u8; 6], &str) = ([0x00, 0x16, 0x53, 0x0a, 0x0b, 0x0c], "rover");
/// Echoing robot, only visible to an inquiry.
pub const SCOUT: ([u8; 6], &str) = ([0x00, 0x16, 0x53, 0x0d, 0x0e, 0x0f], "scout");
/// Phone that insists on PIN 0000.
pub const PHONE: ([u8; 6], &str) = ([0x00, 0x11, 0x22, 0x33, 0x44, 0x55], "phone");

const PHONE_CLASS: u32 = 0x005a_020c;
const PHONE_PIN: &str = "0000";

pub struct Session {
    pub bt: Bluetooth,
    pub controller: SimController,
    pub config: EngineConfig,
}

impl Session {
    /// Start the engine, reading the engine config from `config` if given.
    pub fn open(config: Option<&Path>) -> CliResult<Self> {
        let config = load_config(config)?;
        let (chip, controller) = SimChip::new(SimConfig::default());
        controller.add_device(SimDevice::new(ROVER.0, ROVER.1).echoing());
        controller.add_device(SimDevice::new(SCOUT.0, SCOUT.1).echoing());
        controller.add_device(
            SimDevice::new(PHONE.0, PHONE.1)
                .with_class(PHONE_CLASS)
                .with_pin(PHONE_PIN),
        );
        controller.add_known(SimDevice::new(ROVER.0, ROVER.1));

        let bt = Bluetooth::start(chip, config.clone()).map_err(|e| bt_error("start failed", e))?;
        Ok(Self {
            bt,
            controller,
            config,
        })
    }

    pub fn close(self) -> CliResult<()> {
        let stats = self.controller.stats();
        debug!(
            overlapping = stats.overlapping_commands,
            dropped = stats.dropped_writes,
            "closing session"
        );
        self.bt.shutdown().map_err(|e| bt_error("shutdown failed", e))
    }
}

pub fn load_config(path: Option<&Path>) -> CliResult<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .map_err(|e| bt_error(&format!("config {}", path.display()), e)),
        None => Ok(EngineConfig::default()),
    }
}
