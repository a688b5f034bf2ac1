use std::time::Duration;

/// Timing and identity of a simulated chip.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay before a command's reply becomes readable.
    pub reply_delay: Duration,
    /// Delay before `CONNECT_RESULT` for an outbound connect.
    pub connect_delay: Duration,
    /// Time from reset line high to `RESET_INDICATION`.
    pub boot_delay: Duration,
    /// Spacing between inquiry results.
    pub inquiry_step: Duration,
    /// Minimum silence after stream output before the mode line may drop
    /// to command mode. Shorter gaps are counted as violations.
    pub quiescence: Duration,
    /// Firmware version reported by `GET_VERSION`.
    pub version: (u8, u8),
    /// Local friendly name.
    pub name: String,
    /// Local address.
    pub address: [u8; 6],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            reply_delay: Duration::from_millis(1),
            connect_delay: Duration::from_millis(5),
            boot_delay: Duration::from_millis(5),
            inquiry_step: Duration::from_millis(5),
            quiescence: Duration::from_millis(10),
            version: (1, 2),
            name: "NXT".to_string(),
            address: [0x00, 0x16, 0x53, 0x00, 0x00, 0x01],
        }
    }
}

/// A remote Bluetooth device the simulated chip can see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub address: [u8; 6],
    pub name: String,
    /// Class of device, sent big-endian.
    pub class: u32,
    /// PIN the device insists on, if it requires pairing.
    pub pin: Option<String>,
    /// Echo every byte received straight back.
    pub echo: bool,
}

impl SimDevice {
    pub fn new(address: [u8; 6], name: &str) -> Self {
        Self {
            address,
            name: name.to_string(),
            class: 0x0008_0804,
            pin: None,
            echo: false,
        }
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    pub fn with_class(mut self, class: u32) -> Self {
        self.class = class;
        self
    }

    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }
}
