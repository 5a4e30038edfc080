use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::charger::ChargeStatus;
use super::{DeviceResult, Identifier, Resurrector};

/// Vehicle base capability: identity and battery capacity.
///
/// Everything else is optional and discovered through the accessor methods.
/// Vehicles are created at startup from configuration and live for the
/// process lifetime; loadpoints acquire and release them via the
/// coordinator.
#[async_trait]
pub trait Vehicle: Send + Sync {
    fn title(&self) -> String;

    /// Usable battery capacity in kWh.
    fn capacity_kwh(&self) -> f64;

    fn soc(&self) -> Option<&dyn VehicleSoc> {
        None
    }

    fn range(&self) -> Option<&dyn VehicleRange> {
        None
    }

    fn finish_timer(&self) -> Option<&dyn FinishTimer> {
        None
    }

    /// Charge state as seen from the vehicle side, used for detection.
    fn charge_state(&self) -> Option<&dyn ChargeState> {
        None
    }

    fn climater(&self) -> Option<&dyn Climater> {
        None
    }

    fn resurrector(&self) -> Option<&dyn Resurrector> {
        None
    }

    fn identifier(&self) -> Option<&dyn Identifier> {
        None
    }
}

#[async_trait]
pub trait VehicleSoc: Send + Sync {
    /// State of charge in percent (0-100).
    async fn soc(&self) -> DeviceResult<f64>;
}

#[async_trait]
pub trait VehicleRange: Send + Sync {
    /// Remaining range in km.
    async fn range_km(&self) -> DeviceResult<i64>;
}

#[async_trait]
pub trait FinishTimer: Send + Sync {
    /// Estimated end of charge.
    async fn finish_time(&self) -> DeviceResult<DateTime<Utc>>;
}

#[async_trait]
pub trait ChargeState: Send + Sync {
    async fn status(&self) -> DeviceResult<ChargeStatus>;
}

#[async_trait]
pub trait Climater: Send + Sync {
    async fn climate_active(&self) -> DeviceResult<bool>;
}
