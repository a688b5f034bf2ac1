#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use brickcomm_bt::{Bluetooth, EngineConfig};
use brickcomm_sim::{SimChip, SimConfig, SimController, SimDevice};

pub const ROVER: [u8; 6] = [0x00, 0x16, 0x53, 0x0a, 0x0b, 0x0c];
pub const ROVER_TEXT: &str = "00:16:53:0A:0B:0C";
pub const SCOUT: [u8; 6] = [0x00, 0x16, 0x53, 0x0d, 0x0e, 0x0f];
pub const PHONE: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Engine timing shrunk to keep the scenarios quick.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        io_quantum: ms(20),
        command_poll: ms(5),
        switch_timeout: ms(200),
        reply_byte_timeout: ms(50),
        check_timeout: ms(100),
        short_timeout: ms(300),
        long_timeout: ms(1500),
        reset_wait: ms(200),
        close_delay: ms(5),
        close_delay_port: ms(10),
        flush_timeout: ms(100),
        quiescence: ms(15),
        channel_flush_wait: ms(5),
        reset_pulse: ms(5),
        connect_settle: ms(20),
        close_flush: ms(100),
        close_eof: ms(20),
        close_release: ms(500),
        poll_interval: ms(10),
        ..EngineConfig::default()
    }
}

pub fn start_with(sim: SimConfig, config: EngineConfig) -> (Bluetooth, SimController) {
    let (chip, controller) = SimChip::new(sim);
    let bt = Bluetooth::start(chip, config).expect("engine should start on the simulated chip");
    (bt, controller)
}

/// Engine on a fresh chip with a plain remote `ROVER` in range.
pub fn start() -> (Bluetooth, SimController) {
    let (bt, controller) = start_with(SimConfig::default(), fast_config());
    controller.add_device(SimDevice::new(ROVER, "rover"));
    (bt, controller)
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(ms(2));
    }
    check()
}

pub fn temp_path(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "brickcomm-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir.join("settings.json")
}
