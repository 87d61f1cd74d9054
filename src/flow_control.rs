use thiserror::Error;

/// Largest legal window size (2^31 - 1).
pub const MAX_WINDOW_SIZE: i32 = i32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window overflow: {current} + {delta} exceeds {}", MAX_WINDOW_SIZE)]
    Overflow { current: i32, delta: i32 },
    #[error("window underflow: cannot take {delta} from {current}")]
    Underflow { current: i32, delta: i32 },
    #[error("invalid window delta {0}")]
    InvalidDelta(i32),
}

/// Signed flow-control credit for one direction of a stream or session.
///
/// The value only goes negative through [`adjust`](Self::adjust), when the
/// peer lowers its initial window below what is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlWindow {
    size: i32,
}

impl FlowControlWindow {
    pub fn new(initial: i32) -> Self {
        Self { size: initial }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn is_exhausted(&self) -> bool {
        self.size <= 0
    }

    pub fn increase(&mut self, delta: i32) -> Result<i32, WindowError> {
        if delta < 1 {
            return Err(WindowError::InvalidDelta(delta));
        }
        if self.size > MAX_WINDOW_SIZE - delta {
            return Err(WindowError::Overflow {
                current: self.size,
                delta,
            });
        }
        self.size += delta;
        Ok(self.size)
    }

    pub fn decrease(&mut self, delta: i32) -> Result<i32, WindowError> {
        if delta < 1 {
            return Err(WindowError::InvalidDelta(delta));
        }
        if delta > self.size {
            return Err(WindowError::Underflow {
                current: self.size,
                delta,
            });
        }
        self.size -= delta;
        Ok(self.size)
    }

    /// Send-side consumption. Callers size their frames from the current
    /// window, so running past it is a bug.
    pub fn consume(&mut self, delta: i32) {
        debug_assert!(delta >= 1 && delta <= self.size, "send window overrun");
        self.size -= delta;
    }

    /// Applies a signed delta from an initial-window-size change.
    pub fn adjust(&mut self, delta: i32) -> Result<i32, WindowError> {
        match self.size.checked_add(delta) {
            Some(size) => {
                self.size = size;
                Ok(size)
            }
            None => Err(WindowError::Overflow {
                current: self.size,
                delta,
            }),
        }
    }
}

/// Receive-side window plus the bytes consumed by the reader but not yet
/// acknowledged to the peer with WINDOW_UPDATE. The peer's view of the
/// window is `size - unacked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    window: FlowControlWindow,
    unacked: i32,
    max: i32,
}

impl RecvWindow {
    pub fn new(initial: i32, max: i32) -> Self {
        Self {
            window: FlowControlWindow::new(initial),
            unacked: 0,
            max,
        }
    }

    pub fn size(&self) -> i32 {
        self.window.size()
    }

    pub fn unacked(&self) -> i32 {
        self.unacked
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn set_max(&mut self, max: i32) {
        self.max = max;
    }

    /// Peer sent `delta` bytes. Exceeding the credit still outstanding is a
    /// flow-control violation by the peer.
    pub fn on_received(&mut self, delta: i32) -> Result<(), WindowError> {
        if delta > self.window.size() - self.unacked {
            return Err(WindowError::Underflow {
                current: self.window.size() - self.unacked,
                delta,
            });
        }
        self.window.decrease(delta).map(|_| ())
    }

    /// Reader consumed `delta` bytes. Returns the WINDOW_UPDATE increment to
    /// send once more than half of the maximum is unacknowledged.
    pub fn on_consumed(&mut self, delta: i32) -> Result<Option<i32>, WindowError> {
        if delta < 1 {
            return Err(WindowError::InvalidDelta(delta));
        }
        self.window.increase(delta)?;
        self.unacked += delta;
        if self.unacked > self.max / 2 {
            let increment = self.unacked;
            self.unacked = 0;
            return Ok(Some(increment));
        }
        Ok(None)
    }

    /// Raises the window to `target` at once, as done for the session window
    /// during bootstrap. Returns the increment to advertise.
    pub fn grow_to(&mut self, target: i32) -> Result<Option<i32>, WindowError> {
        let delta = target - self.window.size();
        if delta < 1 {
            return Ok(None);
        }
        self.window.increase(delta)?;
        Ok(Some(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increase_rejects_overflow() {
        let mut window = FlowControlWindow::new(MAX_WINDOW_SIZE - 10);
        assert_eq!(window.increase(10), Ok(MAX_WINDOW_SIZE));
        assert!(matches!(
            window.increase(1),
            Err(WindowError::Overflow { .. })
        ));
        assert_eq!(window.size(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn decrease_rejects_more_than_current() {
        let mut window = FlowControlWindow::new(100);
        assert_eq!(window.decrease(40), Ok(60));
        assert!(matches!(
            window.decrease(61),
            Err(WindowError::Underflow { .. })
        ));
        assert_eq!(window.decrease(60), Ok(0));
        assert!(window.is_exhausted());
    }

    #[test]
    fn non_positive_deltas_are_rejected() {
        let mut window = FlowControlWindow::new(100);
        assert_eq!(window.increase(0), Err(WindowError::InvalidDelta(0)));
        assert_eq!(window.decrease(-1), Err(WindowError::InvalidDelta(-1)));
    }

    #[test]
    fn adjust_may_go_negative() {
        let mut window = FlowControlWindow::new(100);
        window.consume(100);
        assert_eq!(window.adjust(-65_535), Ok(-65_535));
        assert!(window.is_exhausted());
        assert_eq!(window.adjust(65_635), Ok(100));
    }

    #[test]
    fn window_never_exceeds_max_over_mixed_sequence() {
        let mut window = FlowControlWindow::new(65_535);
        let steps: [(bool, i32); 8] = [
            (true, 1 << 30),
            (false, 5),
            (true, 1 << 30),
            (true, i32::MAX),
            (false, 1 << 20),
            (true, 1 << 20),
            (false, i32::MAX),
            (true, 7),
        ];
        for (grow, delta) in steps {
            let before = window.size();
            let result = if grow {
                window.increase(delta)
            } else {
                window.decrease(delta)
            };
            if result.is_err() {
                assert_eq!(window.size(), before);
            }
            assert!(window.size() >= 0);
        }
    }

    #[test]
    fn recv_window_acks_after_half_consumed() {
        let mut recv = RecvWindow::new(1000, 1000);
        recv.on_received(600).unwrap();
        assert_eq!(recv.size(), 400);
        assert_eq!(recv.on_consumed(300).unwrap(), None);
        assert_eq!(recv.on_consumed(300).unwrap(), Some(600));
        assert_eq!(recv.size(), 1000);
        assert_eq!(recv.unacked(), 0);
    }

    #[test]
    fn recv_window_counts_unacked_against_peer() {
        let mut recv = RecvWindow::new(1000, 1000);
        recv.on_received(1000).unwrap();
        assert_eq!(recv.on_consumed(400).unwrap(), None);
        // Consumed but unacknowledged bytes are not credit the peer can use.
        assert!(recv.on_received(1).is_err());
    }

    #[test]
    fn grow_to_returns_increment() {
        let mut recv = RecvWindow::new(65_535, 10 * 1024 * 1024);
        assert_eq!(recv.grow_to(10 * 1024 * 1024).unwrap(), Some(10 * 1024 * 1024 - 65_535));
        assert_eq!(recv.grow_to(65_535).unwrap(), None);
    }
}
