//! Nanosecond monotonic clock shared by the WDRR scheduler's virtual-time
//! arithmetic and the control handler's retransmission watchdog.

use quanta::Clock;

#[derive(Clone)]
pub struct RouterClock {
    clock: Clock,
    epoch: u64,
}

impl RouterClock {
    pub fn new() -> Self {
        let clock = Clock::new();
        let epoch = clock.raw();
        RouterClock { clock, epoch }
    }

    /// Nanoseconds elapsed since this clock was created.
    pub fn now_ns(&self) -> u64 {
        self.clock.delta_as_nanos(self.epoch, self.clock.raw()) as u64
    }
}

impl Default for RouterClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let clock = RouterClock::new();
        let t1 = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = clock.now_ns();
        assert!(t2 >= t1);
    }
}
