//! Builds devices from configuration references and assembles the site.
//!
//! Real device drivers live outside this crate and enter through the
//! capability traits; the factory only knows how to build the simulated
//! device family.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
#[cfg(not(feature = "db"))]
use tracing::warn;

use crate::config::{
    ChargerDeviceConfig, Config, DeviceKind, MeterDeviceConfig, VehicleDeviceConfig,
};
use crate::core::publish::{Param, Publisher};
use crate::core::session::{MemoryStore, SessionStore};
use crate::core::site::{LoadpointSpec, Site, SiteDevices};
use crate::device::simulated::{SimCharger, SimMeter, SimVehicle};
use crate::device::{ChargeStatus, Charger, Meter, Vehicle};
use crate::tariff::{FixedTariff, Tariff};

fn build_meter(cfg: &MeterDeviceConfig) -> Arc<dyn Meter> {
    match cfg.kind {
        DeviceKind::Sim => {
            let mut meter = SimMeter::new(cfg.power);
            if let Some(soc) = cfg.soc {
                meter = meter.with_soc(soc);
            }
            if cfg.currents {
                meter = meter.with_currents(0.0, 0.0, 0.0);
            }
            if cfg.energy {
                meter = meter.with_energy(0.0);
            }
            if cfg.jitter > 0.0 {
                meter = meter.with_jitter(cfg.jitter);
            }
            Arc::new(meter)
        }
    }
}

fn build_charger(cfg: &ChargerDeviceConfig) -> Arc<dyn Charger> {
    match cfg.kind {
        DeviceKind::Sim => {
            let mut charger = SimCharger::new().with_auto_charge();
            if cfg.millis {
                charger = charger.with_millis();
            }
            if cfg.phase_switcher {
                charger = charger.with_phase_switcher(3);
            }
            if cfg.rater {
                charger = charger.with_rater();
            }
            if cfg.meter {
                charger = charger.with_meter();
            }
            if cfg.wakeup {
                charger = charger.with_resurrector();
            }
            if let Some(identity) = &cfg.identity {
                charger = charger.with_identity(identity.clone());
            }
            Arc::new(charger)
        }
    }
}

fn build_vehicle(cfg: &VehicleDeviceConfig) -> Result<Arc<dyn Vehicle>> {
    match cfg.kind {
        DeviceKind::Sim => {
            let mut vehicle = SimVehicle::new(cfg.name.clone(), cfg.capacity_kwh);
            if let Some(soc) = cfg.soc {
                vehicle = vehicle.with_soc(soc);
            }
            if let Some(status) = &cfg.status {
                let status = ChargeStatus::from_str(status)
                    .map_err(|_| anyhow::anyhow!("invalid vehicle status '{status}'"))?;
                vehicle = vehicle.with_status(status);
            }
            if let Some(km) = cfg.range_km {
                vehicle = vehicle.with_range(km);
            }
            if cfg.climater {
                vehicle = vehicle.with_climater();
            }
            if cfg.wakeup {
                vehicle = vehicle.with_resurrector();
            }
            if let Some(identity) = &cfg.identity {
                vehicle = vehicle.with_identity(identity.clone());
            }
            Ok(Arc::new(vehicle))
        }
    }
}

/// Resolve all configured devices and wire the site together.
pub async fn assemble_site(cfg: &Config) -> Result<(Arc<Site>, mpsc::UnboundedReceiver<Param>)> {
    let mut meters: HashMap<String, Arc<dyn Meter>> = HashMap::new();
    for meter_cfg in &cfg.meters {
        if meters
            .insert(meter_cfg.name.clone(), build_meter(meter_cfg))
            .is_some()
        {
            bail!("duplicate meter '{}'", meter_cfg.name);
        }
    }

    let mut chargers: HashMap<String, Arc<dyn Charger>> = HashMap::new();
    for charger_cfg in &cfg.chargers {
        if chargers
            .insert(charger_cfg.name.clone(), build_charger(charger_cfg))
            .is_some()
        {
            bail!("duplicate charger '{}'", charger_cfg.name);
        }
    }

    let mut vehicles_by_name: HashMap<String, Arc<dyn Vehicle>> = HashMap::new();
    let mut vehicles: Vec<Arc<dyn Vehicle>> = Vec::new();
    for vehicle_cfg in &cfg.vehicles {
        let vehicle = build_vehicle(vehicle_cfg)?;
        if vehicles_by_name
            .insert(vehicle_cfg.name.clone(), vehicle.clone())
            .is_some()
        {
            bail!("duplicate vehicle '{}'", vehicle_cfg.name);
        }
        vehicles.push(vehicle);
    }

    let meter_ref = |name: &str| -> Result<Arc<dyn Meter>> {
        meters
            .get(name)
            .cloned()
            .with_context(|| format!("unknown meter '{name}'"))
    };

    let grid_meter = match &cfg.site.meters.grid {
        Some(name) => Some(meter_ref(name)?),
        None => None,
    };
    let pv_meters = cfg
        .site
        .meters
        .pv_refs()
        .iter()
        .map(|name| meter_ref(name))
        .collect::<Result<Vec<_>>>()?;
    let battery_meters = cfg
        .site
        .meters
        .battery_refs()
        .iter()
        .map(|name| meter_ref(name))
        .collect::<Result<Vec<_>>>()?;

    let tariff: Option<Arc<dyn Tariff>> = cfg
        .tariff
        .as_ref()
        .map(|t| Arc::new(FixedTariff::new(t)) as Arc<dyn Tariff>);

    let mut specs = Vec::new();
    for lp_cfg in &cfg.loadpoints {
        let charger = chargers
            .get(&lp_cfg.charger)
            .cloned()
            .with_context(|| format!("unknown charger '{}'", lp_cfg.charger))?;
        let charge_meter = match &lp_cfg.meter {
            Some(name) => Some(meter_ref(name)?),
            None => None,
        };
        let default_vehicle = match &lp_cfg.vehicle {
            Some(name) => Some(
                vehicles_by_name
                    .get(name)
                    .cloned()
                    .with_context(|| format!("unknown vehicle '{name}'"))?,
            ),
            None => None,
        };
        specs.push(LoadpointSpec {
            config: lp_cfg.clone(),
            charger,
            charge_meter,
            default_vehicle,
        });
    }

    let session_store: Option<Arc<dyn SessionStore>> = match &cfg.database {
        Some(db) => {
            #[cfg(feature = "db")]
            {
                let store = crate::core::session::SqliteStore::connect(&db.path).await?;
                Some(Arc::new(store))
            }
            #[cfg(not(feature = "db"))]
            {
                warn!(path = %db.path, "database configured but db feature disabled, using memory store");
                Some(Arc::new(MemoryStore::new()))
            }
        }
        None => Some(Arc::new(MemoryStore::new())),
    };

    let (publisher, ui_rx) = Publisher::new();

    let site = Site::new(
        &cfg.site,
        cfg.controller.interval(),
        cfg.controller.retry_policy(),
        SiteDevices {
            grid_meter,
            pv_meters,
            battery_meters,
            tariff,
        },
        specs,
        vehicles,
        session_store,
        publisher,
    )?;

    Ok((site, ui_rx))
}
