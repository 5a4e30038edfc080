use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Accumulates charged energy split into self-consumed and grid-supplied
/// shares. Deltas are computed between calls from the momentary power mix.
#[derive(Debug)]
pub struct Savings {
    started: DateTime<Utc>,
    updated: Instant,
    charged_total_wh: f64,
    charged_self_wh: f64,
}

impl Default for Savings {
    fn default() -> Self {
        Self::new()
    }
}

impl Savings {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            updated: Instant::now(),
            charged_total_wh: 0.0,
            charged_self_wh: 0.0,
        }
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn charged_total_wh(&self) -> f64 {
        self.charged_total_wh
    }

    pub fn charged_self_wh(&self) -> f64 {
        self.charged_self_wh
    }

    pub fn self_consumption_percent(&self) -> f64 {
        if self.charged_total_wh <= 0.0 {
            return 0.0;
        }
        100.0 * self.charged_self_wh / self.charged_total_wh
    }

    /// Share of charging covered by local generation for the given mix.
    /// Exporting (grid power negative) means charging is fully self-supplied.
    fn self_share(grid_power: f64, pv_power: f64) -> f64 {
        if grid_power < 0.0 {
            return 1.0;
        }
        let supply = pv_power.max(0.0) + grid_power;
        if supply <= 0.0 {
            return 0.0;
        }
        (pv_power.max(0.0) / supply).clamp(0.0, 1.0)
    }

    /// Accumulate the energy charged since the previous call. Returns the
    /// pair (delta charged, delta self-consumed) in Wh.
    pub fn update(&mut self, grid_power: f64, pv_power: f64, charge_power: f64) -> (f64, f64) {
        let elapsed = self.updated.elapsed();
        self.updated = Instant::now();

        if charge_power <= 0.0 {
            return (0.0, 0.0);
        }

        let delta_wh = charge_power * elapsed.as_secs_f64() / 3600.0;
        let delta_self_wh = delta_wh * Self::self_share(grid_power, pv_power);

        self.charged_total_wh += delta_wh;
        self.charged_self_wh += delta_self_wh;

        (delta_wh, delta_self_wh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn exporting_site_counts_as_fully_self_consumed() {
        let mut savings = Savings::new();
        tokio::time::advance(Duration::from_secs(3600)).await;

        let (charged, self_consumed) = savings.update(-2000.0, 5000.0, 4000.0);
        assert!((charged - 4000.0).abs() < 1e-6);
        assert!((self_consumed - 4000.0).abs() < 1e-6);
        assert!((savings.self_consumption_percent() - 100.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn importing_site_apportions_by_pv_share() {
        let mut savings = Savings::new();
        tokio::time::advance(Duration::from_secs(1800)).await;

        // 3 kW pv, 1 kW import: 75% self-consumption
        let (charged, self_consumed) = savings.update(1000.0, 3000.0, 2000.0);
        assert!((charged - 1000.0).abs() < 1e-6);
        assert!((self_consumed - 750.0).abs() < 1e-6);
        assert!((savings.self_consumption_percent() - 75.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_loadpoints_accumulate_nothing() {
        let mut savings = Savings::new();
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(savings.update(500.0, 0.0, 0.0), (0.0, 0.0));
        assert_eq!(savings.charged_total_wh(), 0.0);
    }
}
