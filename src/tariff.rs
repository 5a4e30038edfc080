use async_trait::async_trait;
use chrono::{Timelike, Utc};

use crate::config::TariffConfig;
use crate::device::DeviceResult;

/// Narrow tariff contract consumed by the control loop. A provider failure
/// collapses to "not cheap" at the call site.
#[async_trait]
pub trait Tariff: Send + Sync {
    async fn is_cheap(&self) -> DeviceResult<bool>;

    fn currency(&self) -> String {
        "EUR".to_string()
    }
}

/// Fixed daily cheap window, e.g. 22:00-06:00. Stands in for a dynamic
/// price provider.
#[derive(Debug, Clone)]
pub struct FixedTariff {
    cheap_from_hour: u32,
    cheap_to_hour: u32,
    currency: String,
}

impl FixedTariff {
    pub fn new(cfg: &TariffConfig) -> Self {
        Self {
            cheap_from_hour: cfg.cheap_from_hour,
            cheap_to_hour: cfg.cheap_to_hour,
            currency: cfg.currency.clone(),
        }
    }

    fn contains(&self, hour: u32) -> bool {
        if self.cheap_from_hour == self.cheap_to_hour {
            return false;
        }
        if self.cheap_from_hour < self.cheap_to_hour {
            (self.cheap_from_hour..self.cheap_to_hour).contains(&hour)
        } else {
            // window wraps midnight
            hour >= self.cheap_from_hour || hour < self.cheap_to_hour
        }
    }
}

#[async_trait]
impl Tariff for FixedTariff {
    async fn is_cheap(&self) -> DeviceResult<bool> {
        Ok(self.contains(Utc::now().hour()))
    }

    fn currency(&self) -> String {
        self.currency.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tariff(from: u32, to: u32) -> FixedTariff {
        FixedTariff {
            cheap_from_hour: from,
            cheap_to_hour: to,
            currency: "EUR".to_string(),
        }
    }

    #[test]
    fn plain_window() {
        let t = tariff(1, 5);
        assert!(!t.contains(0));
        assert!(t.contains(1));
        assert!(t.contains(4));
        assert!(!t.contains(5));
    }

    #[test]
    fn wrapping_window() {
        let t = tariff(22, 6);
        assert!(t.contains(23));
        assert!(t.contains(0));
        assert!(t.contains(5));
        assert!(!t.contains(6));
        assert!(!t.contains(12));
    }

    #[test]
    fn empty_window_is_never_cheap() {
        let t = tariff(8, 8);
        for hour in 0..24 {
            assert!(!t.contains(hour));
        }
    }
}
