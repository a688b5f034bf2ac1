/// Errors that can occur on the hardware link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// An I/O error occurred on the underlying serial device.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The chip is held in reset and cannot transfer bytes.
    #[error("chip is powered down")]
    PoweredDown,

    /// The far side of the link has gone away.
    #[error("link detached")]
    Detached,
}

pub type Result<T> = std::result::Result<T, LinkError>;
