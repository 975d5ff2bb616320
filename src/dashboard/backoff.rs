use std::time::Duration;

use crate::settings::DashboardSettings;

const MIN_FLOOR: Duration = Duration::from_millis(1);

/// Delay before the next dashboard poll: back to the floor after a good
/// cycle, doubled (up to the ceiling) after a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl PollBackoff {
    /// A zero floor would never grow, so it is raised to one millisecond.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let floor = floor.max(MIN_FLOOR);
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn from_settings(settings: &DashboardSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.floor_ms),
            Duration::from_millis(settings.ceiling_ms),
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_success(&mut self) -> Duration {
        self.current = self.floor;
        self.current
    }

    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        self.current
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::from_settings(&DashboardSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn doubles_on_failure_and_resets_on_success() {
        let mut backoff = PollBackoff::default();
        assert_eq!(backoff.current(), ms(3_000));

        let delays: Vec<_> = (0..3).map(|_| backoff.on_failure()).collect();
        assert_eq!(delays, vec![ms(6_000), ms(12_000), ms(24_000)]);

        assert_eq!(backoff.on_success(), ms(3_000));
        assert_eq!(backoff.on_failure(), ms(6_000));
    }

    #[test]
    fn never_exceeds_ceiling() {
        let mut backoff = PollBackoff::default();
        for _ in 0..10 {
            backoff.on_failure();
        }
        assert_eq!(backoff.current(), ms(60_000));
    }

    #[test]
    fn ceiling_below_floor_is_raised() {
        let mut backoff = PollBackoff::new(ms(5_000), ms(1_000));
        assert_eq!(backoff.on_failure(), ms(5_000));
    }

    #[test]
    fn zero_floor_still_backs_off() {
        let mut backoff = PollBackoff::new(Duration::ZERO, ms(60_000));
        assert_eq!(backoff.current(), ms(1));
        let delays: Vec<_> = (0..3).map(|_| backoff.on_failure()).collect();
        assert_eq!(delays, vec![ms(2), ms(4), ms(8)]);
        assert_eq!(backoff.on_success(), ms(1));
    }
}
