/// Header size used by packet-framed modes.
pub const PACKET_HEADER: usize = 2;

/// Framing applied to connection payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IoMode {
    /// Each write is one packet with a 2-byte little-endian length header.
    #[default]
    Packet,
    /// LEGO communication protocol framing (same header as `Packet`).
    Lcp,
    /// No header, bytes pass through untouched.
    Raw,
}

impl IoMode {
    /// Length-header bytes prepended to each packet.
    pub fn header_size(self) -> usize {
        match self {
            IoMode::Packet | IoMode::Lcp => PACKET_HEADER,
            IoMode::Raw => 0,
        }
    }
}

/// Lifecycle state of a connection.
///
/// Variants are declared in lifecycle order so comparisons read naturally:
/// everything from `Connected` up accepts I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnState {
    /// Slot is free; no buffers are held.
    Idle,
    /// Link is gone; buffered input may still be drained.
    Disconnected,
    /// A local close is in progress.
    Disconnecting,
    Connected,
    /// Input was discarded; the next read or write reports it.
    DataLost,
    /// The peer sent a soft EOF packet.
    Eof,
}

impl ConnState {
    /// True if the connection accepts reads and writes.
    pub fn is_open(self) -> bool {
        self >= ConnState::Connected
    }

    /// True while the transport still owns the link for this connection.
    pub fn is_live(self) -> bool {
        self >= ConnState::Disconnecting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(IoMode::Packet.header_size(), 2);
        assert_eq!(IoMode::Lcp.header_size(), 2);
        assert_eq!(IoMode::Raw.header_size(), 0);
    }

    #[test]
    fn state_ordering() {
        assert!(!ConnState::Idle.is_live());
        assert!(!ConnState::Disconnected.is_live());
        assert!(ConnState::Disconnecting.is_live());
        assert!(!ConnState::Disconnecting.is_open());
        assert!(ConnState::Connected.is_open());
        assert!(ConnState::DataLost.is_open());
        assert!(ConnState::Eof.is_open());
    }
}
