use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use brickcomm_conn::BufferConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BtError, Result};

/// PIN used when no settings file provides one.
pub const DEFAULT_PIN: &str = "1234";

/// Longest PIN the chip accepts.
pub const MAX_PIN_LEN: usize = 16;

/// Timing and retry policy for the engine.
///
/// Durations serialize as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum stream time given to a channel before switching away.
    #[serde(with = "millis")]
    pub io_quantum: Duration,
    /// Idle poll while in command mode.
    #[serde(with = "millis")]
    pub command_poll: Duration,
    /// Time allowed for the chip to confirm a mode switch.
    #[serde(with = "millis")]
    pub switch_timeout: Duration,
    /// Time allowed for the rest of a reply once its first byte arrives.
    #[serde(with = "millis")]
    pub reply_byte_timeout: Duration,
    /// Reply deadline for the power-up device check.
    #[serde(with = "millis")]
    pub check_timeout: Duration,
    /// Reply deadline for simple queries.
    #[serde(with = "millis")]
    pub short_timeout: Duration,
    /// Reply deadline for connects, inquiries and list operations.
    #[serde(with = "millis")]
    pub long_timeout: Duration,
    /// Time allowed for the chip to announce itself after a reset pulse.
    #[serde(with = "millis")]
    pub reset_wait: Duration,
    /// Pause before closing an outbound connection.
    #[serde(with = "millis")]
    pub close_delay: Duration,
    /// Pause before closing the inbound connection on handle 3.
    #[serde(with = "millis")]
    pub close_delay_port: Duration,
    /// Output drain and input flush limit around resets and switches.
    #[serde(with = "millis")]
    pub flush_timeout: Duration,
    /// Silence required before dropping the mode line to command.
    #[serde(with = "millis")]
    pub quiescence: Duration,
    /// How long a channel lingers for late input while flushing.
    #[serde(with = "millis")]
    pub channel_flush_wait: Duration,
    /// How long the reset line is held low.
    #[serde(with = "millis")]
    pub reset_pulse: Duration,
    /// Wait after a successful connect for an immediate close.
    #[serde(with = "millis")]
    pub connect_settle: Duration,
    /// Close grace for pending output.
    #[serde(with = "millis")]
    pub close_flush: Duration,
    /// Close grace for the peer's end of stream.
    #[serde(with = "millis")]
    pub close_eof: Duration,
    /// Close grace for the chip to release the handle.
    #[serde(with = "millis")]
    pub close_release: Duration,
    /// A channel with buffered input is polled again after this long.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Reset sequences tried before giving up on the chip.
    pub reset_attempts: u32,
    /// Bad or truncated frames tolerated before a reset.
    pub frame_retries: u32,
    /// Retransmissions of an idempotent query after a timeout.
    pub reply_retries: u32,
    /// Device checks after power-up.
    pub device_check_attempts: u32,
    /// Size of each channel's input and output buffer.
    pub buffer_size: usize,
    /// Where [`Settings`] live. `None` keeps settings in memory only.
    pub settings_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_quantum: Duration::from_millis(100),
            command_poll: Duration::from_millis(50),
            switch_timeout: Duration::from_millis(500),
            reply_byte_timeout: Duration::from_millis(250),
            check_timeout: Duration::from_millis(500),
            short_timeout: Duration::from_millis(2000),
            long_timeout: Duration::from_millis(30000),
            reset_wait: Duration::from_millis(5000),
            close_delay: Duration::from_millis(100),
            close_delay_port: Duration::from_millis(500),
            flush_timeout: Duration::from_millis(500),
            quiescence: Duration::from_millis(50),
            channel_flush_wait: Duration::from_millis(20),
            reset_pulse: Duration::from_millis(100),
            connect_settle: Duration::from_millis(300),
            close_flush: Duration::from_millis(1000),
            close_eof: Duration::from_millis(500),
            close_release: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            reset_attempts: 2,
            frame_retries: 1,
            reply_retries: 1,
            device_check_attempts: 5,
            buffer_size: brickcomm_conn::DEFAULT_BUFFER_SIZE,
            settings_path: None,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| BtError::Settings(format!("{}: {e}", path.display())))
    }

    /// Buffer sizing and close timing for each channel.
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            capacity: self.buffer_size,
            close_flush: self.close_flush,
            close_eof: self.close_eof,
            close_release: self.close_release,
            ..BufferConfig::default()
        }
    }

    /// Delay before closing `handle`.
    pub(crate) fn close_delay_for(&self, handle: u8) -> Duration {
        if handle == 3 {
            self.close_delay_port
        } else {
            self.close_delay
        }
    }
}

/// Persisted user settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// PIN presented when the chip asks to pair.
    pub bluetooth_pin: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bluetooth_pin: DEFAULT_PIN.to_string(),
        }
    }
}

impl Settings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let settings: Self =
            serde_json::from_str(&text).map_err(|e| BtError::Settings(format!("{}: {e}", path.display())))?;
        validate_pin(&settings.bluetooth_pin)?;
        Ok(settings)
    }

    /// Write settings to `path` as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self).map_err(|e| BtError::Settings(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field(
                "bluetooth_pin",
                &format_args!("<redacted:{} bytes>", self.bluetooth_pin.len()),
            )
            .finish()
    }
}

pub(crate) fn validate_pin(pin: &str) -> Result<()> {
    if pin.is_empty() || pin.len() > MAX_PIN_LEN {
        return Err(BtError::InvalidPin);
    }
    Ok(())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "brickcomm-{tag}-{}-{}.json",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[test]
    fn defaults_match_reference_timings() {
        let config = EngineConfig::default();
        assert_eq!(config.io_quantum, Duration::from_millis(100));
        assert_eq!(config.long_timeout, Duration::from_secs(30));
        assert_eq!(config.close_delay_for(3), Duration::from_millis(500));
        assert_eq!(config.close_delay_for(0), Duration::from_millis(100));
        assert_eq!(config.reset_attempts, 2);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"io_quantum": 20, "reply_retries": 3}"#).expect("config should parse");
        assert_eq!(config.io_quantum, Duration::from_millis(20));
        assert_eq!(config.reply_retries, 3);
        assert_eq!(config.short_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(EngineConfig::default()).expect("config should serialize");
        assert_eq!(json["switch_timeout"], 500);
    }

    #[test]
    fn missing_settings_file_gives_defaults() {
        let settings = Settings::load(temp_path("missing")).expect("missing file is fine");
        assert_eq!(settings.bluetooth_pin, "1234");
    }

    #[test]
    fn settings_roundtrip_through_file() {
        let path = temp_path("settings");
        let settings = Settings {
            bluetooth_pin: "0000".to_string(),
        };
        settings.save(&path).expect("settings should save");
        assert_eq!(Settings::load(&path).expect("settings should load"), settings);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn oversized_pin_is_rejected() {
        let path = temp_path("bad-pin");
        std::fs::write(&path, r#"{"bluetooth_pin": "12345678901234567"}"#).expect("write");
        assert!(matches!(Settings::load(&path), Err(BtError::InvalidPin)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn debug_redacts_pin() {
        let text = format!("{:?}", Settings::default());
        assert!(!text.contains("1234"));
        assert!(text.contains("<redacted:4 bytes>"));
    }
}
