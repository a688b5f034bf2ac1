use std::time::{Duration, Instant};

use crate::error::Result;
use crate::events::LinkEvents;

/// Granularity used when polling link status.
pub const POLL_SLICE: Duration = Duration::from_millis(1);

/// Which protocol the serial link is carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipMode {
    /// Administrative command/reply frames.
    Command,
    /// Raw payload bytes for one open stream.
    Stream,
}

impl ChipMode {
    /// The status bit a link reports while in this mode.
    pub fn status_bit(self) -> LinkEvents {
        match self {
            ChipMode::Command => LinkEvents::CMD_MODE,
            ChipMode::Stream => LinkEvents::STREAM_MODE,
        }
    }
}

/// Primitive access to the radio chip.
///
/// Implementations are driven from a single thread (the link arbiter), so
/// every method takes `&mut self` and no internal locking is expected.
/// `read` and `write` never block: they move whatever the device can take
/// or has available and return the count.
pub trait HardwareLink: Send {
    /// Queue bytes for transmission. Returns the number accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read bytes already received. Returns 0 when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Current hardware status bits (see [`LinkEvents::HARDWARE`]).
    fn status(&mut self) -> LinkEvents;

    /// Drive the ARM-side mode line.
    fn set_mode_line(&mut self, mode: ChipMode);

    /// Drive the chip reset line. Low holds the chip in reset.
    fn set_reset_line(&mut self, high: bool);

    /// Short label used in log output.
    fn name(&self) -> &'static str {
        "link"
    }

    /// The mode the chip itself reports, if any.
    fn chip_mode(&mut self) -> Option<ChipMode> {
        let status = self.status();
        if status.contains(LinkEvents::CMD_MODE) {
            Some(ChipMode::Command)
        } else if status.contains(LinkEvents::STREAM_MODE) {
            Some(ChipMode::Stream)
        } else {
            None
        }
    }

    /// Block until any bit of `interest` is reported or `timeout` elapses.
    ///
    /// Returns the matching bits, or [`LinkEvents::NONE`] on timeout. The
    /// default implementation polls [`status`](Self::status) every
    /// [`POLL_SLICE`].
    fn wait(&mut self, interest: LinkEvents, timeout: Duration) -> LinkEvents {
        let deadline = Instant::now() + timeout;
        loop {
            let hit = self.status() & interest;
            if !hit.is_empty() {
                return hit;
            }
            let now = Instant::now();
            if now >= deadline {
                return LinkEvents::NONE;
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}

impl<L: HardwareLink + ?Sized> HardwareLink for Box<L> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn status(&mut self) -> LinkEvents {
        (**self).status()
    }

    fn set_mode_line(&mut self, mode: ChipMode) {
        (**self).set_mode_line(mode)
    }

    fn set_reset_line(&mut self, high: bool) {
        (**self).set_reset_line(high)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn chip_mode(&mut self) -> Option<ChipMode> {
        (**self).chip_mode()
    }

    fn wait(&mut self, interest: LinkEvents, timeout: Duration) -> LinkEvents {
        (**self).wait(interest, timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// A link whose status turns readable after a fixed number of polls.
    struct CountdownLink {
        polls_left: u32,
        rx: VecDeque<u8>,
        mode: ChipMode,
    }

    impl HardwareLink for CountdownLink {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn status(&mut self) -> LinkEvents {
            let mut status = self.mode.status_bit() | LinkEvents::WRITABLE;
            if self.polls_left == 0 {
                status |= LinkEvents::READABLE;
            } else {
                self.polls_left -= 1;
            }
            status
        }

        fn set_mode_line(&mut self, mode: ChipMode) {
            self.mode = mode;
        }

        fn set_reset_line(&mut self, _high: bool) {}
    }

    #[test]
    fn default_wait_returns_matching_bits() {
        let mut link = CountdownLink {
            polls_left: 3,
            rx: VecDeque::from(vec![1, 2]),
            mode: ChipMode::Command,
        };
        let hit = link.wait(LinkEvents::READABLE, Duration::from_secs(1));
        assert_eq!(hit, LinkEvents::READABLE);
    }

    #[test]
    fn default_wait_times_out_with_none() {
        let mut link = CountdownLink {
            polls_left: u32::MAX,
            rx: VecDeque::new(),
            mode: ChipMode::Command,
        };
        let start = Instant::now();
        let hit = link.wait(LinkEvents::READABLE, Duration::from_millis(20));
        assert!(hit.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn chip_mode_follows_status_bits() {
        let mut link: Box<dyn HardwareLink> = Box::new(CountdownLink {
            polls_left: 0,
            rx: VecDeque::new(),
            mode: ChipMode::Command,
        });
        assert_eq!(link.chip_mode(), Some(ChipMode::Command));
        link.set_mode_line(ChipMode::Stream);
        assert_eq!(link.chip_mode(), Some(ChipMode::Stream));
    }
}
