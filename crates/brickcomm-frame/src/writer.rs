use std::time::{Duration, Instant};

use brickcomm_link::{HardwareLink, LinkEvents};

use crate::error::{FrameError, Result};

/// Write an encoded frame to the link.
///
/// Retries partial writes until the whole frame is accepted, waiting for
/// [`LinkEvents::WRITABLE`] in between. Gives up with
/// [`FrameError::Stalled`] if the link takes no bytes for `timeout`.
pub fn write_frame<L: HardwareLink + ?Sized>(link: &mut L, wire: &[u8], timeout: Duration) -> Result<()> {
    let mut written = 0;
    let mut deadline = Instant::now() + timeout;
    while written < wire.len() {
        let n = link.write(&wire[written..])?;
        if n > 0 {
            written += n;
            deadline = Instant::now() + timeout;
            continue;
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(FrameError::Stalled);
        }
        link.wait(LinkEvents::WRITABLE, deadline - now);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use brickcomm_link::ChipMode;

    use super::*;

    /// Accepts at most `limit` bytes per call and stops after `budget` bytes.
    struct ThrottledLink {
        limit: usize,
        budget: usize,
        sent: Vec<u8>,
    }

    impl HardwareLink for ThrottledLink {
        fn write(&mut self, buf: &[u8]) -> brickcomm_link::Result<usize> {
            let n = buf.len().min(self.limit).min(self.budget);
            self.budget -= n;
            self.sent.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn read(&mut self, _buf: &mut [u8]) -> brickcomm_link::Result<usize> {
            Ok(0)
        }

        fn status(&mut self) -> LinkEvents {
            if self.budget > 0 {
                LinkEvents::WRITABLE
            } else {
                LinkEvents::NONE
            }
        }

        fn set_mode_line(&mut self, _mode: ChipMode) {}

        fn set_reset_line(&mut self, _high: bool) {}
    }

    #[test]
    fn write_handles_partial_writes() {
        let mut link = ThrottledLink {
            limit: 2,
            budget: usize::MAX,
            sent: Vec::new(),
        };
        write_frame(&mut link, &[1, 2, 3, 4, 5], Duration::from_millis(50)).unwrap();
        assert_eq!(link.sent, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn write_reports_stall() {
        let mut link = ThrottledLink {
            limit: 8,
            budget: 3,
            sent: Vec::new(),
        };
        let result = write_frame(&mut link, &[1, 2, 3, 4, 5], Duration::from_millis(10));
        assert!(matches!(result, Err(FrameError::Stalled)));
        assert_eq!(link.sent, vec![1, 2, 3]);
    }
}
