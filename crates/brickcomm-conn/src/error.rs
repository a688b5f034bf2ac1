use std::io;

/// Failures reported by connection I/O.
///
/// Each variant carries the classic integer code through [`ConnError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    /// The peer signalled end of stream (soft EOF or remote close).
    #[error("end of stream")]
    Eof,

    /// Input was discarded by the transport. Reported once.
    #[error("data lost")]
    DataLost,

    /// The connection is not open.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed while the operation was in progress.
    #[error("connection closed")]
    Closed,
}

impl ConnError {
    /// Integer code: -1 EOF/closed, -2 data lost, -3 not connected.
    pub fn code(self) -> i32 {
        match self {
            ConnError::Eof | ConnError::Closed => -1,
            ConnError::DataLost => -2,
            ConnError::NotConnected => -3,
        }
    }
}

impl From<ConnError> for io::Error {
    fn from(err: ConnError) -> Self {
        let kind = match err {
            ConnError::Eof => io::ErrorKind::UnexpectedEof,
            ConnError::DataLost => io::ErrorKind::InvalidData,
            ConnError::NotConnected => io::ErrorKind::NotConnected,
            ConnError::Closed => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, ConnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_return_vocabulary() {
        assert_eq!(ConnError::Eof.code(), -1);
        assert_eq!(ConnError::Closed.code(), -1);
        assert_eq!(ConnError::DataLost.code(), -2);
        assert_eq!(ConnError::NotConnected.code(), -3);
    }

    #[test]
    fn converts_to_io_error() {
        let err: io::Error = ConnError::NotConnected.into();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let err: io::Error = ConnError::DataLost.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
