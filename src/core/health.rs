use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Liveness marker for the control loop.
///
/// The loop refreshes the marker after each successful cycle; the health
/// probe reports unhealthy once a full cycle plus grace period has passed
/// without a refresh.
#[derive(Debug)]
pub struct Health {
    deadline: Duration,
    updated: Mutex<Option<Instant>>,
}

const GRACE: Duration = Duration::from_secs(60);

impl Health {
    pub fn new(interval: Duration) -> Self {
        Self {
            deadline: interval + GRACE,
            updated: Mutex::new(None),
        }
    }

    pub fn update(&self) {
        *self.updated.lock() = Some(Instant::now());
    }

    pub fn healthy(&self) -> bool {
        self.updated
            .lock()
            .is_some_and(|at| at.elapsed() <= self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unhealthy_until_first_update() {
        let health = Health::new(Duration::from_secs(30));
        assert!(!health.healthy());

        health.update();
        assert!(health.healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn goes_stale_past_deadline() {
        let health = Health::new(Duration::from_secs(30));
        health.update();

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(health.healthy());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!health.healthy());

        health.update();
        assert!(health.healthy());
    }
}
