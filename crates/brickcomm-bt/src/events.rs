use std::time::{Duration, Instant};

use brickcomm_link::{HardwareLink, LinkEvents, POLL_SLICE};
use parking_lot::{Condvar, Mutex};

/// Software events raised by application threads for the arbiter.
///
/// Hardware bits come from the link itself; the software half
/// ([`LinkEvents::SOFTWARE`]) is latched here until the arbiter consumes it.
#[derive(Debug)]
pub(crate) struct EventSignal {
    pending: Mutex<LinkEvents>,
    cond: Condvar,
}

impl EventSignal {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(LinkEvents::NONE),
            cond: Condvar::new(),
        }
    }

    /// Latch `events` and wake the arbiter if it is waiting.
    pub fn notify(&self, events: LinkEvents) {
        let mut pending = self.pending.lock();
        pending.insert(events & LinkEvents::SOFTWARE);
        self.cond.notify_all();
    }

    /// Wait for any of `interest`, hardware or software, up to `timeout`.
    ///
    /// Returns the bits that fired (software bits are consumed), or
    /// [`LinkEvents::NONE`] on timeout. Hardware status is polled every
    /// [`POLL_SLICE`].
    pub fn wait<L: HardwareLink + ?Sized>(&self, link: &mut L, interest: LinkEvents, timeout: Duration) -> LinkEvents {
        let deadline = Instant::now() + timeout;
        let soft = interest & LinkEvents::SOFTWARE;
        let hard = interest & LinkEvents::HARDWARE;
        loop {
            let mut fired = if hard.is_empty() {
                LinkEvents::NONE
            } else {
                link.status() & hard
            };
            {
                let mut pending = self.pending.lock();
                let hit = *pending & soft;
                pending.remove(hit);
                fired.insert(hit);
                if fired.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return LinkEvents::NONE;
                    }
                    self.cond.wait_for(&mut pending, POLL_SLICE.min(deadline - now));
                    continue;
                }
            }
            return fired;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use brickcomm_link::ChipMode;

    use super::*;

    struct QuietLink;

    impl HardwareLink for QuietLink {
        fn write(&mut self, buf: &[u8]) -> brickcomm_link::Result<usize> {
            Ok(buf.len())
        }

        fn read(&mut self, _buf: &mut [u8]) -> brickcomm_link::Result<usize> {
            Ok(0)
        }

        fn status(&mut self) -> LinkEvents {
            LinkEvents::CMD_MODE | LinkEvents::WRITABLE
        }

        fn set_mode_line(&mut self, _mode: ChipMode) {}

        fn set_reset_line(&mut self, _high: bool) {}
    }

    #[test]
    fn software_bits_are_consumed() {
        let signal = EventSignal::new();
        signal.notify(LinkEvents::NEW_CMD | LinkEvents::NEW_DATA);
        let fired = signal.wait(&mut QuietLink, LinkEvents::NEW_CMD, Duration::from_millis(10));
        assert_eq!(fired, LinkEvents::NEW_CMD);
        let again = signal.wait(&mut QuietLink, LinkEvents::NEW_CMD, Duration::from_millis(5));
        assert!(again.is_empty());
        let data = signal.wait(&mut QuietLink, LinkEvents::NEW_DATA, Duration::from_millis(5));
        assert_eq!(data, LinkEvents::NEW_DATA);
    }

    #[test]
    fn hardware_bits_merge_with_software() {
        let signal = EventSignal::new();
        signal.notify(LinkEvents::NEW_SPACE);
        let fired = signal.wait(
            &mut QuietLink,
            LinkEvents::CMD_MODE | LinkEvents::NEW_SPACE,
            Duration::from_millis(10),
        );
        assert_eq!(fired, LinkEvents::CMD_MODE | LinkEvents::NEW_SPACE);
    }

    #[test]
    fn notify_from_another_thread_wakes_waiter() {
        let signal = Arc::new(EventSignal::new());
        let remote = Arc::clone(&signal);
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.notify(LinkEvents::NEW_CMD);
        });
        let fired = signal.wait(&mut QuietLink, LinkEvents::NEW_CMD | LinkEvents::READABLE, Duration::from_secs(2));
        assert_eq!(fired, LinkEvents::NEW_CMD);
        notifier.join().expect("notifier thread should finish");
    }

    #[test]
    fn times_out_with_none() {
        let signal = EventSignal::new();
        let fired = signal.wait(&mut QuietLink, LinkEvents::READABLE, Duration::from_millis(5));
        assert!(fired.is_empty());
    }
}
