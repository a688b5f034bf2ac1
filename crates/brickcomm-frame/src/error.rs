use brickcomm_link::LinkError;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length byte cannot describe a valid frame.
    #[error("invalid frame length {0} (min 3)")]
    BadLength(u8),

    /// The trailing checksum does not match the frame contents.
    #[error("checksum mismatch (expected {expected:#06x}, got {actual:#06x})")]
    Checksum { expected: u16, actual: u16 },

    /// The link stopped delivering bytes part way through a frame.
    #[error("truncated frame ({received} of {expected} bytes)")]
    Truncated { expected: usize, received: usize },

    /// The parameters do not fit in a single frame.
    #[error("parameters too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },

    /// The link would not accept the frame before the deadline.
    #[error("link stalled while writing frame")]
    Stalled,

    /// An error from the hardware link.
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, FrameError>;
