use std::time::{Duration, Instant};

use brickcomm_link::{HardwareLink, LinkEvents};
use bytes::BytesMut;
use tracing::trace;

use crate::codec::{decode_frame, Frame, MAX_FRAME_SIZE};
use crate::error::{FrameError, Result};

/// Default time allowed for the rest of a frame once its first byte is seen.
pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_millis(250);

/// Pulls complete reply frames off a [`HardwareLink`].
///
/// Handles partial reads internally. The reader never takes more bytes from
/// the link than the frame in progress needs, so bytes that follow a reply
/// (for example stream data after a mode switch) are left on the link.
pub struct ReplyReader {
    buf: BytesMut,
    byte_timeout: Duration,
}

impl ReplyReader {
    /// Create a reader with [`DEFAULT_BYTE_TIMEOUT`].
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_BYTE_TIMEOUT)
    }

    /// Create a reader with an explicit per-frame completion timeout.
    pub fn with_timeout(byte_timeout: Duration) -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
            byte_timeout,
        }
    }

    /// Poll for the next reply.
    ///
    /// Returns `Ok(None)` when the link has nothing pending. Once the first
    /// byte of a frame is available, waits up to the byte timeout for the
    /// rest and reports [`FrameError::Truncated`] if it never arrives.
    pub fn read_reply<L: HardwareLink + ?Sized>(&mut self, link: &mut L) -> Result<Option<Frame>> {
        let deadline = Instant::now() + self.byte_timeout;
        let mut chunk = [0u8; MAX_FRAME_SIZE];
        loop {
            if let Some(frame) = decode_frame(&mut self.buf)? {
                trace!(opcode = frame.opcode, len = frame.params.len(), "reply received");
                return Ok(Some(frame));
            }

            let want = match self.buf.first() {
                None => 1,
                Some(&len) => 1 + len as usize - self.buf.len(),
            };
            let read = link.read(&mut chunk[..want])?;
            if read > 0 {
                self.buf.extend_from_slice(&chunk[..read]);
                continue;
            }

            if self.buf.is_empty() {
                return Ok(None);
            }

            let now = Instant::now();
            if now >= deadline {
                let expected = 1 + self.buf[0] as usize;
                let received = self.buf.len();
                self.buf.clear();
                return Err(FrameError::Truncated { expected, received });
            }
            link.wait(LinkEvents::READABLE, deadline - now);
        }
    }

    /// Drop any partially received frame.
    pub fn discard(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes of an incomplete frame held by the reader.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Per-frame completion timeout.
    pub fn byte_timeout(&self) -> Duration {
        self.byte_timeout
    }
}

impl Default for ReplyReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use brickcomm_link::ChipMode;

    use super::*;
    use crate::codec::encode_reply;
    use crate::opcode;

    /// Delivers scripted bytes, at most `chunk` per read call.
    struct ScriptedLink {
        rx: VecDeque<u8>,
        chunk: usize,
        reads: usize,
    }

    impl ScriptedLink {
        fn new(bytes: &[u8], chunk: usize) -> Self {
            Self {
                rx: bytes.iter().copied().collect(),
                chunk,
                reads: 0,
            }
        }
    }

    impl HardwareLink for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> brickcomm_link::Result<usize> {
            Ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> brickcomm_link::Result<usize> {
            self.reads += 1;
            let n = buf.len().min(self.chunk).min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn status(&mut self) -> LinkEvents {
            if self.rx.is_empty() {
                LinkEvents::CMD_MODE
            } else {
                LinkEvents::CMD_MODE | LinkEvents::READABLE
            }
        }

        fn set_mode_line(&mut self, _mode: ChipMode) {}

        fn set_reset_line(&mut self, _high: bool) {}
    }

    fn wire(op: u8, params: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_reply(op, params, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn read_nothing_pending() {
        let mut link = ScriptedLink::new(&[], 64);
        let mut reader = ReplyReader::new();
        assert!(reader.read_reply(&mut link).unwrap().is_none());
    }

    #[test]
    fn read_byte_by_byte() {
        let bytes = wire(opcode::GET_VERSION_RESULT, &[1, 2]);
        let mut link = ScriptedLink::new(&bytes, 1);
        let mut reader = ReplyReader::new();

        let frame = reader.read_reply(&mut link).unwrap().unwrap();
        assert_eq!(frame.opcode, opcode::GET_VERSION_RESULT);
        assert_eq!(frame.params.as_ref(), &[1, 2]);
        assert_eq!(link.reads, bytes.len());
    }

    #[test]
    fn read_leaves_following_bytes_on_link() {
        let mut bytes = wire(opcode::OPERATING_MODE_RESULT, &[1]);
        bytes.extend_from_slice(b"stream");
        let mut link = ScriptedLink::new(&bytes, 64);
        let mut reader = ReplyReader::new();

        let frame = reader.read_reply(&mut link).unwrap().unwrap();
        assert_eq!(frame.param(0), 1);
        assert_eq!(link.rx.len(), 6);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn read_consecutive_replies() {
        let mut bytes = wire(opcode::INQUIRY_RUNNING, &[]);
        bytes.extend(wire(opcode::INQUIRY_STOPPED, &[]));
        let mut link = ScriptedLink::new(&bytes, 64);
        let mut reader = ReplyReader::new();

        let f1 = reader.read_reply(&mut link).unwrap().unwrap();
        let f2 = reader.read_reply(&mut link).unwrap().unwrap();
        assert_eq!(f1.opcode, opcode::INQUIRY_RUNNING);
        assert_eq!(f2.opcode, opcode::INQUIRY_STOPPED);
        assert!(reader.read_reply(&mut link).unwrap().is_none());
    }

    #[test]
    fn read_truncated_frame_times_out() {
        let bytes = wire(opcode::GET_LOCAL_ADDR_RESULT, &[0, 1, 2, 3, 4, 5, 0]);
        let mut link = ScriptedLink::new(&bytes[..4], 64);
        let mut reader = ReplyReader::with_timeout(Duration::from_millis(20));

        let start = Instant::now();
        let result = reader.read_reply(&mut link);
        assert!(matches!(
            result,
            Err(FrameError::Truncated {
                expected: 11,
                received: 4
            })
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn read_checksum_failure() {
        let mut bytes = wire(opcode::LINK_QUALITY_RESULT, &[200]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        let mut link = ScriptedLink::new(&bytes, 64);
        let mut reader = ReplyReader::new();

        let result = reader.read_reply(&mut link);
        assert!(matches!(result, Err(FrameError::Checksum { .. })));
    }
}
