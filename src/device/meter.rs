use async_trait::async_trait;

use super::DeviceResult;

/// Meter base capability. All meters can report instantaneous power.
///
/// Optional capabilities are discovered through the accessor methods which
/// are pure predicates: probing never contacts the device. Invoking an
/// optional capability without probing first is a programming error.
#[async_trait]
pub trait Meter: Send + Sync {
    /// Instantaneous power in W. Sign convention depends on the role:
    /// grid positive = import, battery positive = discharge, PV positive =
    /// generation.
    async fn current_power(&self) -> DeviceResult<f64>;

    /// Per-phase currents, if the meter measures them.
    fn phase_currents(&self) -> Option<&dyn PhaseCurrents> {
        None
    }

    /// Lifetime energy counter, if the meter has one.
    fn energy(&self) -> Option<&dyn EnergyMeter> {
        None
    }

    /// State of charge, for battery meters backed by a storage system.
    fn battery(&self) -> Option<&dyn BatterySoc> {
        None
    }
}

#[async_trait]
pub trait PhaseCurrents: Send + Sync {
    /// Currents of L1, L2, L3 in A.
    async fn currents(&self) -> DeviceResult<(f64, f64, f64)>;
}

#[async_trait]
pub trait EnergyMeter: Send + Sync {
    /// Total energy in Wh.
    async fn total_energy(&self) -> DeviceResult<f64>;
}

#[async_trait]
pub trait BatterySoc: Send + Sync {
    /// State of charge in percent (0-100).
    async fn soc(&self) -> DeviceResult<f64>;
}
