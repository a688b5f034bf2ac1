mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;

use crate::cmd::{Command, Context};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "brickcomm",
    version,
    about = "NXT Bluetooth engine diagnostics against a simulated radio"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Engine config file (JSON). Missing fields take their defaults.
    #[arg(long, value_name = "PATH", env = "BRICKCOMM_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let ctx = Context {
        format: cli.format.unwrap_or_else(OutputFormat::default_for_stdout),
        config: cli.config,
    };
    let result = cmd::run(cli.command, &ctx);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_echo_subcommand() {
        let cli = Cli::try_parse_from([
            "brickcomm",
            "echo",
            "00:16:53:0A:0B:0C",
            "hello",
            "--pin",
            "0000",
        ])
        .expect("echo args should parse");

        match cli.command {
            Command::Echo(args) => {
                assert_eq!(args.target, "00:16:53:0A:0B:0C");
                assert_eq!(args.pin.as_deref(), Some("0000"));
                assert!(!args.raw);
            }
            other => panic!("expected echo, got {other:?}"),
        }
    }

    #[test]
    fn echo_requires_text() {
        let err = Cli::try_parse_from(["brickcomm", "echo", "rover"])
            .expect_err("missing text should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "brickcomm",
            "inquire",
            "--class",
            "0x080804",
            "--format",
            "json",
            "--config",
            "/tmp/engine.json",
        ])
        .expect("inquire args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/engine.json")));
        assert!(matches!(cli.command, Command::Inquire(ref a) if a.class == 0x0008_0804));
    }

    #[test]
    fn parses_pin_set() {
        let cli = Cli::try_parse_from(["brickcomm", "pin", "--set", "4321"])
            .expect("pin args should parse");
        assert!(matches!(cli.command, Command::Pin(ref a) if a.set.as_deref() == Some("4321")));
    }
}
