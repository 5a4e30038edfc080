use std::time::Duration;

use tokio::time::Instant;

/// Hysteresis timer for delayed control decisions.
///
/// Arms when its condition first becomes true and keeps the original arm
/// time on subsequent ticks; disarms without firing when the condition
/// drops. `expire` short-circuits the delay, used when a decision must take
/// effect immediately (e.g. re-enabling after a phase switch).
#[derive(Debug, Default, Clone, Copy)]
pub struct DelayTimer {
    armed: Option<Instant>,
    forced: bool,
}

impl DelayTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self) {
        if self.armed.is_none() {
            self.armed = Some(Instant::now());
        }
    }

    pub fn disarm(&mut self) {
        self.armed = None;
        self.forced = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some() || self.forced
    }

    /// Treat the delay as already elapsed on the next check.
    pub fn expire(&mut self) {
        self.forced = true;
    }

    pub fn elapsed(&self, delay: Duration) -> bool {
        self.forced || self.armed.is_some_and(|at| at.elapsed() >= delay)
    }

    /// Arm or disarm from `condition`; returns true once the delay has
    /// elapsed with the condition continuously held.
    pub fn gate(&mut self, condition: bool, delay: Duration) -> bool {
        if condition {
            self.arm();
            self.elapsed(delay)
        } else {
            self.disarm();
            false
        }
    }

    /// Remaining time until the timer fires, for logging.
    pub fn remaining(&self, delay: Duration) -> Duration {
        if self.forced {
            return Duration::ZERO;
        }
        match self.armed {
            Some(at) => delay.saturating_sub(at.elapsed()),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn fires_after_continuous_condition() {
        let mut timer = DelayTimer::new();
        assert!(!timer.gate(true, DELAY));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!timer.gate(true, DELAY));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(timer.gate(true, DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_gating_does_not_rearm() {
        let mut timer = DelayTimer::new();
        timer.gate(true, DELAY);
        tokio::time::advance(Duration::from_secs(59)).await;
        // ticking again must not move the arm time
        assert!(!timer.gate(true, DELAY));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(timer.gate(true, DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_condition_disarms_without_firing() {
        let mut timer = DelayTimer::new();
        timer.gate(true, DELAY);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!timer.gate(false, DELAY));
        // re-arming starts from scratch
        assert!(!timer.gate(true, DELAY));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!timer.gate(true, DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_short_circuits_delay() {
        let mut timer = DelayTimer::new();
        timer.expire();
        assert!(timer.gate(true, DELAY));
        timer.disarm();
        assert!(!timer.gate(true, DELAY));
    }
}
