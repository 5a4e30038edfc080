use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::meter::Meter;
use super::{DeviceResult, Identifier, Resurrector};

/// IEC 61851 charge point status.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum ChargeStatus {
    /// No vehicle present.
    #[default]
    A,
    /// Vehicle connected, not charging.
    B,
    /// Charging.
    C,
    /// Charging with ventilation.
    D,
    /// Error.
    E,
    /// Fault.
    F,
}

impl ChargeStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, ChargeStatus::B | ChargeStatus::C | ChargeStatus::D)
    }

    pub fn is_charging(self) -> bool {
        matches!(self, ChargeStatus::C | ChargeStatus::D)
    }

    pub fn is_fault(self) -> bool {
        matches!(self, ChargeStatus::E | ChargeStatus::F)
    }
}

/// Charger base capability: status, enable state and current limit.
///
/// Optional capabilities are advertised through the accessor methods;
/// probing is pure and never performs device I/O.
#[async_trait]
pub trait Charger: Send + Sync {
    async fn status(&self) -> DeviceResult<ChargeStatus>;

    async fn enabled(&self) -> DeviceResult<bool>;

    async fn enable(&self, enable: bool) -> DeviceResult<()>;

    /// Set the maximum charge current in whole amperes.
    async fn max_current(&self, current: i64) -> DeviceResult<()>;

    /// Fractional current resolution, if supported.
    fn millis(&self) -> Option<&dyn CurrentMillis> {
        None
    }

    /// Session energy counter, if the charger keeps one.
    fn charge_rater(&self) -> Option<&dyn ChargeRater> {
        None
    }

    /// 1p/3p switching, if the hardware has a contactor for it.
    fn phase_switcher(&self) -> Option<&dyn PhaseSwitcher> {
        None
    }

    /// Built-in power measurement, if present.
    fn meter(&self) -> Option<&dyn Meter> {
        None
    }

    fn identifier(&self) -> Option<&dyn Identifier> {
        None
    }

    fn resurrector(&self) -> Option<&dyn Resurrector> {
        None
    }
}

#[async_trait]
pub trait CurrentMillis: Send + Sync {
    /// Set the maximum charge current with sub-ampere resolution.
    async fn max_current_millis(&self, current: f64) -> DeviceResult<()>;
}

#[async_trait]
pub trait ChargeRater: Send + Sync {
    /// Energy delivered during the current session in Wh.
    async fn charged_energy(&self) -> DeviceResult<f64>;
}

#[async_trait]
pub trait PhaseSwitcher: Send + Sync {
    /// Switch between 1- and 3-phase charging. Valid arguments are 1 and 3.
    async fn phases_1p3p(&self, phases: u8) -> DeviceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_predicates() {
        assert!(!ChargeStatus::A.is_connected());
        assert!(ChargeStatus::B.is_connected());
        assert!(ChargeStatus::C.is_charging());
        assert!(ChargeStatus::D.is_charging());
        assert!(!ChargeStatus::B.is_charging());
        assert!(ChargeStatus::E.is_fault());
        assert!(ChargeStatus::F.is_fault());
    }

    #[test]
    fn status_round_trips_as_string() {
        use std::str::FromStr;
        assert_eq!(ChargeStatus::C.to_string(), "C");
        assert_eq!(ChargeStatus::from_str("B").unwrap(), ChargeStatus::B);
        assert!(ChargeStatus::from_str("G").is_err());
    }
}
