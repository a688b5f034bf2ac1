use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod info;
pub mod inquire;
pub mod pin;
pub mod session;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the local radio's identity and state.
    Info(InfoArgs),
    /// Discover devices in range.
    Inquire(InquireArgs),
    /// Connect to a remote, send text and read the echo back.
    Echo(EchoArgs),
    /// Show or change the pairing PIN.
    Pin(PinArgs),
    /// Show version information.
    Version(VersionArgs),
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Context {
    pub format: OutputFormat,
    /// Engine config file (JSON).
    pub config: Option<PathBuf>,
}

pub fn run(command: Command, ctx: &Context) -> CliResult<i32> {
    match command {
        Command::Info(args) => info::run(args, ctx),
        Command::Inquire(args) => inquire::run(args, ctx),
        Command::Echo(args) => echo::run(args, ctx),
        Command::Pin(args) => pin::run(args, ctx),
        Command::Version(args) => version::run(args, ctx.format),
    }
}

#[derive(Args, Debug, Default)]
pub struct InfoArgs {
    /// Also list the chip's known devices.
    #[arg(long)]
    pub known: bool,
}

#[derive(Args, Debug)]
pub struct InquireArgs {
    /// Stop after this many devices (0 for no limit).
    #[arg(long, default_value = "0")]
    pub max: u8,
    /// Inquiry length in 1.28 s units.
    #[arg(long, default_value = "4")]
    pub units: u8,
    /// Only report devices of this class (0 for any).
    #[arg(long, default_value = "0", value_parser = parse_class)]
    pub class: u32,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Remote address (e.g. 00:16:53:0A:0B:0C) or known-device name.
    pub target: String,
    /// Text to send.
    pub text: String,
    /// PIN to present if the remote asks to pair.
    #[arg(long)]
    pub pin: Option<String>,
    /// Send unframed bytes instead of a packet.
    #[arg(long)]
    pub raw: bool,
    /// How long to wait for the echo (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct PinArgs {
    /// Store a new PIN in the settings file.
    #[arg(long, value_name = "PIN")]
    pub set: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Class of device as decimal or `0x` hex.
fn parse_class(input: &str) -> Result<u32, String> {
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|_| format!("invalid class of device: {input}"))
}

pub(crate) fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_seconds() {
        assert_eq!(parse_timeout("5s").expect("5s"), Duration::from_secs(5));
        assert_eq!(parse_timeout("2").expect("2"), Duration::from_secs(2));
    }

    #[test]
    fn parse_timeout_millis() {
        assert_eq!(parse_timeout("150ms").expect("150ms"), Duration::from_millis(150));
    }

    #[test]
    fn parse_timeout_invalid() {
        assert!(parse_timeout("0s").is_err());
        assert!(parse_timeout("bad").is_err());
        assert!(parse_timeout(" ").is_err());
    }

    #[test]
    fn parse_class_accepts_hex_and_decimal() {
        assert_eq!(parse_class("0x080804"), Ok(0x0008_0804));
        assert_eq!(parse_class("12"), Ok(12));
        assert!(parse_class("0xzz").is_err());
    }
}
