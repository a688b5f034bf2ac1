use std::fmt;
use std::io;

use brickcomm_bt::{BtError, ConnError};
use brickcomm_frame::FrameError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const LINK_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => FAILURE,
        io::ErrorKind::InvalidData => DATA_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::TooLarge { .. } => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(LINK_ERROR, format!("{context}: {other}")),
    }
}

pub fn conn_error(context: &str, err: ConnError) -> CliError {
    match err {
        ConnError::DataLost => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn bt_error(context: &str, err: BtError) -> CliError {
    match err {
        BtError::Timeout => CliError::new(TIMEOUT, format!("{context}: {err}")),
        BtError::Reset | BtError::Link(_) | BtError::UnexpectedReply(_) => {
            CliError::new(LINK_ERROR, format!("{context}: {err}"))
        }
        BtError::Frame(err) => frame_error(context, err),
        BtError::Conn(err) => conn_error(context, err),
        BtError::Io(err) => io_error(context, err),
        BtError::InvalidAddress(_)
        | BtError::InvalidName(_)
        | BtError::InvalidPin
        | BtError::InvalidHandle(_)
        | BtError::UnknownDevice(_) => CliError::new(USAGE, format!("{context}: {err}")),
        BtError::Settings(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        BtError::ShutDown => CliError::new(INTERNAL, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        assert_eq!(bt_error("query", BtError::Timeout).code, TIMEOUT);
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(bt_error("query", BtError::Io(err)).code, TIMEOUT);
    }

    #[test]
    fn link_and_frame_faults_map_to_3() {
        assert_eq!(bt_error("query", BtError::Reset).code, LINK_ERROR);
        let bad = FrameError::Checksum {
            expected: 1,
            actual: 2,
        };
        assert_eq!(bt_error("query", BtError::Frame(bad)).code, LINK_ERROR);
    }

    #[test]
    fn bad_input_maps_to_usage() {
        assert_eq!(bt_error("connect", BtError::InvalidPin).code, USAGE);
        let err = BtError::UnknownDevice("nobody".to_string());
        let cli = bt_error("connect", err);
        assert_eq!(cli.code, USAGE);
        assert!(cli.message.starts_with("connect: "));
    }

    #[test]
    fn lost_data_is_invalid_data() {
        assert_eq!(bt_error("read", BtError::Conn(ConnError::DataLost)).code, DATA_INVALID);
        assert_eq!(bt_error("read", BtError::Conn(ConnError::Eof)).code, FAILURE);
    }

    #[test]
    fn rejected_commands_are_failures() {
        let err = BtError::Rejected {
            opcode: 0x0b,
            status: 0,
        };
        assert_eq!(bt_error("connect", err).code, FAILURE);
    }
}
