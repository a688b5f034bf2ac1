use brickcomm_conn::ConnError;
use brickcomm_frame::FrameError;
use brickcomm_link::LinkError;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum BtError {
    /// The chip did not answer before the command deadline.
    #[error("command timed out")]
    Timeout,

    /// A link reset intervened while the command was outstanding.
    #[error("command aborted by link reset")]
    Reset,

    /// The radio is powered off.
    #[error("bluetooth is powered off")]
    PoweredOff,

    /// The engine has been shut down.
    #[error("engine shut down")]
    ShutDown,

    /// Text that is not a Bluetooth address.
    #[error("invalid bluetooth address: {0:?}")]
    InvalidAddress(String),

    /// A friendly name that does not fit the chip's name field.
    #[error("invalid friendly name: {0:?}")]
    InvalidName(String),

    /// A PIN that is empty or longer than 16 bytes.
    #[error("invalid pin (must be 1-16 bytes)")]
    InvalidPin,

    /// The chip handed back, or the caller named, a handle outside 0..4.
    #[error("invalid connection handle {0}")]
    InvalidHandle(u8),

    /// The channel for a handle is still in use.
    #[error("no free channel for handle")]
    NoFreeChannel,

    /// A friendly name that matches no known device.
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    /// The chip answered but reported failure.
    #[error("command {opcode:#04x} rejected with status {status:#04x}")]
    Rejected { opcode: u8, status: u8 },

    /// The operation conflicts with one already in progress.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// The remote dropped the link while it was being set up.
    #[error("connection closed during setup")]
    SetupAborted,

    /// The chip sent a reply the command does not expect.
    #[error("unexpected reply opcode {0:#04x}")]
    UnexpectedReply(u8),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Hardware link error.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Connection I/O error.
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    /// The settings file could not be read or parsed.
    #[error("settings error: {0}")]
    Settings(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BtError>;
