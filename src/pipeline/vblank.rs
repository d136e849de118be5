//! Vertical-blank timing estimates

use std::time::{Duration, Instant};

/// Answers "how long until the display's next refresh boundary"
pub trait VblankClock {
    fn time_until_vblank(&mut self) -> Duration;

    /// Called right after a present returned.
    fn observe_present(&mut self, at: Instant);

    fn refresh_interval(&self) -> Duration;
}

/// Estimates the refresh phase from the last observed present
///
/// With a FIFO swapchain a present returns close to a vblank, so the instant
/// it returned anchors the phase. Before the first present the phase is
/// unknown and the clock reports zero, letting the first frame go out at once.
#[derive(Debug, Clone)]
pub struct RefreshClock {
    interval: Duration,
    anchor: Option<Instant>,
}

impl RefreshClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_micros(100)),
            anchor: None,
        }
    }

    pub fn time_until_vblank_at(&self, now: Instant) -> Duration {
        let Some(anchor) = self.anchor else {
            return Duration::ZERO;
        };
        let period = self.interval.as_nanos();
        let into_period = now.saturating_duration_since(anchor).as_nanos() % period;
        Duration::from_nanos((period - into_period) as u64)
    }
}

impl VblankClock for RefreshClock {
    fn time_until_vblank(&mut self) -> Duration {
        self.time_until_vblank_at(Instant::now())
    }

    fn observe_present(&mut self, at: Instant) {
        self.anchor = Some(at);
    }

    fn refresh_interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_phase_submits_immediately() {
        let mut clock = RefreshClock::new(Duration::from_millis(16));
        assert_eq!(clock.time_until_vblank(), Duration::ZERO);
    }

    #[test]
    fn phase_follows_the_last_present() {
        let mut clock = RefreshClock::new(Duration::from_millis(10));
        let present = Instant::now();
        clock.observe_present(present);

        assert_eq!(
            clock.time_until_vblank_at(present + Duration::from_millis(3)),
            Duration::from_millis(7)
        );
        // Wraps into the following period.
        assert_eq!(
            clock.time_until_vblank_at(present + Duration::from_millis(24)),
            Duration::from_millis(6)
        );
    }
}
