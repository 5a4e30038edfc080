use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LoadpointConfig, SiteConfig};
use crate::core::coordinator::{Coordinator, CoordinatorAdapter};
use crate::core::health::Health;
use crate::core::loadpoint::{Loadpoint, LoadpointContext};
use crate::core::publish::Publisher;
use crate::core::savings::Savings;
use crate::core::session::SessionStore;
use crate::device::{retry, Charger, Meter, RetryPolicy, Vehicle};
use crate::tariff::Tariff;

/// Less than this counts as charger standby rather than charging.
const STANDBY_POWER: f64 = 10.0;

/// PV readings below this raise a sign warning before being clamped.
const PV_NEGATIVE_THRESHOLD: f64 = -500.0;

#[derive(Debug, Clone, Copy, Serialize)]
struct MeterMeasurement {
    power: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct BatteryMeasurement {
    power: f64,
    soc: f64,
}

/// Cached site readings, refreshed once per tick. The lock is only held for
/// aggregation and the surplus calculation, never across a device call.
#[derive(Debug, Default, Clone, Copy)]
struct SiteState {
    grid_power: f64,
    pv_power: f64,
    battery_power: f64,
    battery_soc: f64,
    battery_buffered: bool,
}

/// Devices resolved from configuration references.
pub struct SiteDevices {
    pub grid_meter: Option<Arc<dyn Meter>>,
    pub pv_meters: Vec<Arc<dyn Meter>>,
    pub battery_meters: Vec<Arc<dyn Meter>>,
    pub tariff: Option<Arc<dyn Tariff>>,
}

/// One loadpoint to be assembled into the site.
pub struct LoadpointSpec {
    pub config: LoadpointConfig,
    pub charger: Arc<dyn Charger>,
    pub charge_meter: Option<Arc<dyn Meter>>,
    pub default_vehicle: Option<Arc<dyn Vehicle>>,
}

/// The installation: one grid connection, optional PV and battery meters,
/// one or more loadpoints and the shared vehicle pool.
pub struct Site {
    title: String,
    voltage: f64,
    residual_power: f64,
    priority_soc: f64,
    buffer_soc: f64,
    max_grid_supply_while_battery_charging: f64,

    grid_meter: Option<Arc<dyn Meter>>,
    pv_meters: Vec<Arc<dyn Meter>>,
    battery_meters: Vec<Arc<dyn Meter>>,
    tariff: Option<Arc<dyn Tariff>>,

    loadpoints: Vec<Arc<Loadpoint>>,
    coordinator: Arc<Coordinator>,
    savings: Mutex<Savings>,
    health: Arc<Health>,
    state: Mutex<SiteState>,
    publisher: Publisher,
    retry: RetryPolicy,

    lp_update_rx: tokio::sync::Mutex<Option<mpsc::Receiver<usize>>>,
}

impl Site {
    /// Assemble the site from configuration, resolved devices and loadpoint
    /// specs. Fails when neither grid nor PV meters are configured.
    pub fn new(
        cfg: &SiteConfig,
        interval: Duration,
        retry_policy: RetryPolicy,
        devices: SiteDevices,
        loadpoint_specs: Vec<LoadpointSpec>,
        vehicles: Vec<Arc<dyn Vehicle>>,
        session_store: Option<Arc<dyn SessionStore>>,
        publisher: Publisher,
    ) -> Result<Arc<Self>> {
        if devices.grid_meter.is_none() && devices.pv_meters.is_empty() {
            bail!("missing either grid or pv meter");
        }
        if loadpoint_specs.is_empty() {
            bail!("at least one loadpoint must be configured");
        }

        let coordinator = Arc::new(Coordinator::new(vehicles));
        // capacity 1: one pending out-of-cycle event, further ones coalesce
        let (update_tx, update_rx) = mpsc::channel(1);

        let loadpoints = loadpoint_specs
            .into_iter()
            .enumerate()
            .map(|(id, spec)| {
                Arc::new(Loadpoint::new(
                    &spec.config,
                    LoadpointContext {
                        id,
                        voltage: cfg.voltage,
                        charger: spec.charger,
                        charge_meter: spec.charge_meter,
                        default_vehicle: spec.default_vehicle,
                        coordinator: CoordinatorAdapter::new(id, coordinator.clone()),
                        publisher: publisher.for_loadpoint(id),
                        update_tx: update_tx.clone(),
                        session_store: session_store.clone(),
                        retry: retry_policy,
                    },
                ))
            })
            .collect();

        Ok(Arc::new(Self {
            title: cfg.title.clone(),
            voltage: cfg.voltage,
            residual_power: cfg.residual_power,
            priority_soc: cfg.priority_soc,
            buffer_soc: cfg.buffer_soc,
            max_grid_supply_while_battery_charging: cfg.max_grid_supply_while_battery_charging,
            grid_meter: devices.grid_meter,
            pv_meters: devices.pv_meters,
            battery_meters: devices.battery_meters,
            tariff: devices.tariff,
            loadpoints,
            coordinator,
            savings: Mutex::new(Savings::new()),
            health: Arc::new(Health::new(interval)),
            state: Mutex::new(SiteState::default()),
            publisher,
            retry: retry_policy,
            lp_update_rx: tokio::sync::Mutex::new(Some(update_rx)),
        }))
    }

    pub fn health(&self) -> Arc<Health> {
        self.health.clone()
    }

    pub fn loadpoints(&self) -> &[Arc<Loadpoint>] {
        &self.loadpoints
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    /// Log the configured device capability matrix.
    pub fn dump_config(&self) {
        info!(title = %self.title, "site config:");
        info!(
            grid = self.grid_meter.is_some(),
            pv = self.pv_meters.len(),
            battery = self.battery_meters.len(),
            "  meters:"
        );
        if let Some(grid) = &self.grid_meter {
            info!(
                currents = grid.phase_currents().is_some(),
                energy = grid.energy().is_some(),
                "    grid:"
            );
        }
        for (i, battery) in self.battery_meters.iter().enumerate() {
            info!(battery = i + 1, soc = battery.battery().is_some(), "    battery:");
        }

        let vehicles = self.coordinator.vehicles();
        let undetectable = vehicles
            .iter()
            .filter(|v| v.charge_state().is_none())
            .count();
        if vehicles.len() > 1 && undetectable > 0 {
            for vehicle in vehicles.iter().filter(|v| v.charge_state().is_none()) {
                warn!(
                    vehicle = %vehicle.title(),
                    "vehicle does not support automatic detection"
                );
            }
        }
        for (i, vehicle) in vehicles.iter().enumerate() {
            info!(
                vehicle = i + 1,
                title = %vehicle.title(),
                soc = vehicle.soc().is_some(),
                range = vehicle.range().is_some(),
                status = vehicle.charge_state().is_some(),
                climate = vehicle.climater().is_some(),
                wakeup = vehicle.resurrector().is_some(),
                "  vehicle:"
            );
        }
    }

    /// Publish the static site properties once at startup.
    fn prepare(&self) {
        self.publisher.publish("siteTitle", &self.title);
        self.publisher
            .publish("gridConfigured", self.grid_meter.is_some());
        self.publisher
            .publish("pvConfigured", !self.pv_meters.is_empty());
        self.publisher
            .publish("batteryConfigured", !self.battery_meters.is_empty());
        self.publisher.publish("bufferSoc", self.buffer_soc);
        self.publisher.publish("prioritySoc", self.priority_soc);
        self.publisher.publish("residualPower", self.residual_power);
        self.publisher.publish(
            "currency",
            self.tariff
                .as_ref()
                .map(|t| t.currency())
                .unwrap_or_else(|| "EUR".to_string()),
        );
        self.publisher
            .publish("savingsSince", self.savings.lock().since().timestamp());

        let titles: Vec<String> = self
            .coordinator
            .vehicles()
            .iter()
            .map(|v| v.title())
            .collect();
        self.publisher.publish("vehicles", titles);
    }

    /// Poll all site meters. PV and battery failures are logged and drop out
    /// of the aggregate for this cycle; only a grid meter failure propagates.
    async fn update_meters(&self) -> Result<()> {
        if !self.pv_meters.is_empty() {
            let readings = join_all(
                self.pv_meters
                    .iter()
                    .map(|meter| retry(&self.retry, || meter.current_power())),
            )
            .await;

            let mut pv_power = 0.0;
            let mut measurements = Vec::with_capacity(readings.len());
            for (i, reading) in readings.into_iter().enumerate() {
                match reading {
                    Ok(power) => {
                        // negative readings represent self-consumption
                        pv_power += power.max(0.0);
                        if power < PV_NEGATIVE_THRESHOLD {
                            warn!(
                                pv = i + 1,
                                power,
                                "pv power is negative - check configuration if sign is correct"
                            );
                        }
                        measurements.push(MeterMeasurement { power });
                    }
                    Err(err) => {
                        error!(pv = i + 1, error = %err, "pv meter");
                        measurements.push(MeterMeasurement { power: 0.0 });
                    }
                }
            }

            self.state.lock().pv_power = pv_power;
            debug!(power = pv_power, "pv power");
            self.publisher.publish("pvPower", pv_power);
            self.publisher.publish("pv", measurements);
        }

        if !self.battery_meters.is_empty() {
            let readings = join_all(self.battery_meters.iter().map(|meter| async move {
                let power = retry(&self.retry, || meter.current_power()).await;
                let soc = match meter.battery() {
                    Some(battery) => Some(battery.soc().await),
                    None => None,
                };
                (power, soc)
            }))
            .await;

            let mut battery_power = 0.0;
            let mut socs = Vec::new();
            let mut measurements = Vec::with_capacity(readings.len());
            for (i, (power, soc)) in readings.into_iter().enumerate() {
                let mut measurement = BatteryMeasurement { power: 0.0, soc: 0.0 };
                match power {
                    Ok(power) => {
                        battery_power += power;
                        measurement.power = power;
                        debug!(battery = i + 1, power, "battery power");
                    }
                    Err(err) => error!(battery = i + 1, error = %err, "battery meter"),
                }
                match soc {
                    Some(Ok(soc)) => {
                        socs.push(soc);
                        measurement.soc = soc;
                        debug!(battery = i + 1, soc, "battery soc");
                    }
                    Some(Err(err)) => error!(battery = i + 1, error = %err, "battery soc"),
                    None => {}
                }
                measurements.push(measurement);
            }

            // plain mean over meters exposing soc, capacity is not weighted
            let battery_soc = if socs.is_empty() {
                self.state.lock().battery_soc
            } else {
                socs.iter().sum::<f64>() / socs.len() as f64
            };

            {
                let mut state = self.state.lock();
                state.battery_power = battery_power;
                state.battery_soc = battery_soc;
            }
            debug!(power = battery_power, soc = battery_soc, "battery");
            self.publisher.publish("batteryPower", battery_power);
            self.publisher.publish("batterySoC", battery_soc.round());
            self.publisher.publish("battery", measurements);
        }

        if let Some(grid) = &self.grid_meter {
            let grid_power = retry(&self.retry, || grid.current_power())
                .await
                .context("grid meter")?;
            self.state.lock().grid_power = grid_power;
            debug!(power = grid_power, "grid power");
            self.publisher.publish("gridPower", grid_power);

            // errors beyond this point do not affect control
            if let Some(phase_meter) = grid.phase_currents() {
                match phase_meter.currents().await {
                    Ok((l1, l2, l3)) => {
                        debug!(l1, l2, l3, "grid currents");
                        self.publisher.publish("gridCurrents", [l1, l2, l3]);
                    }
                    Err(err) => error!(error = %err, "grid meter currents"),
                }
            }
            if let Some(energy_meter) = grid.energy() {
                match energy_meter.total_energy().await {
                    Ok(energy) => self.publisher.publish("gridEnergy", energy),
                    Err(err) => error!(error = %err, "grid meter energy"),
                }
            }
        }

        Ok(())
    }

    /// Derive the signed site power from the cached readings. Negative
    /// values mean surplus is available; positive values mean import beyond
    /// the residual margin.
    fn compute_site_power(&self, total_charge_power: f64) -> f64 {
        let mut state = self.state.lock();

        // estimation fallbacks for missing meters
        if self.grid_meter.is_none() {
            state.grid_power = total_charge_power - state.pv_power;
        }
        if self.pv_meters.is_empty() {
            state.pv_power =
                (total_charge_power - state.grid_power + self.residual_power).max(0.0);
            debug!(power = state.pv_power, "pv power (estimated)");
        }

        let mut battery_power = state.battery_power;
        if !self.battery_meters.is_empty() {
            // batteries below the priority threshold keep their charge
            if state.battery_soc < self.priority_soc && battery_power < 0.0 {
                debug!(
                    soc = state.battery_soc,
                    "giving priority to battery charging"
                );
                battery_power = 0.0;
            }

            state.battery_buffered = battery_power > 0.0
                && self.buffer_soc > 0.0
                && state.battery_soc > self.buffer_soc;
        }

        // a hybrid inverter charging its battery from DC while the house
        // imports beyond the cap is not a divertable surplus
        if self.max_grid_supply_while_battery_charging > 0.0
            && state.grid_power > self.max_grid_supply_while_battery_charging
            && battery_power < 0.0
        {
            debug!(
                grid = state.grid_power,
                "ignoring battery charging at high grid supply"
            );
            battery_power = 0.0;
        }

        state.grid_power + battery_power - self.residual_power
    }

    /// Refresh all meters, then derive the site power. Grid meter failure
    /// propagates and suppresses control for this cycle.
    async fn site_power(&self, total_charge_power: f64) -> Result<f64> {
        self.update_meters().await?;
        let site_power = self.compute_site_power(total_charge_power);
        debug!(power = site_power, "site power");
        Ok(site_power)
    }

    /// One control cycle for the given loadpoint. Ticked cycles refresh the
    /// meters; out-of-cycle events reuse the cached readings.
    async fn update(&self, lp: &Arc<Loadpoint>, refresh_meters: bool) {
        debug!("----");

        let cheap = match &self.tariff {
            Some(tariff) => tariff.is_cheap().await.unwrap_or(false),
            None => false,
        };

        let mut total_charge_power = 0.0;
        for loadpoint in &self.loadpoints {
            total_charge_power += loadpoint.refresh_charge_power().await;
        }

        let site_power = if refresh_meters {
            match self.site_power(total_charge_power).await {
                Ok(power) => Some(power),
                Err(err) => {
                    error!(error = %err, "site power unavailable");
                    None
                }
            }
        } else {
            Some(self.compute_site_power(total_charge_power))
        };

        if let Some(site_power) = site_power {
            self.publisher.publish("sitePower", site_power);

            let battery_buffered = self.state.lock().battery_buffered;
            lp.update(site_power, cheap, battery_buffered).await;

            let home_power = {
                let state = self.state.lock();
                (state.grid_power + state.pv_power.max(0.0) + state.battery_power
                    - total_charge_power)
                    .max(0.0)
            };
            self.publisher.publish("homePower", home_power);

            self.health.update();
        }

        // update savings from the current mix
        let (grid_power, pv_power) = {
            let state = self.state.lock();
            (state.grid_power, state.pv_power)
        };
        let (delta_charged, delta_self) = {
            let mut savings = self.savings.lock();
            let deltas = savings.update(grid_power, pv_power, total_charge_power);
            if total_charge_power > STANDBY_POWER {
                self.publisher
                    .publish("savingsTotalCharged", savings.charged_total_wh());
                self.publisher
                    .publish("savingsSelfConsumptionCharged", savings.charged_self_wh());
                self.publisher.publish(
                    "savingsSelfConsumptionPercent",
                    savings.self_consumption_percent(),
                );
            }
            deltas
        };
        if total_charge_power > STANDBY_POWER {
            debug!(
                charged_wh = delta_charged,
                self_wh = delta_self,
                "charge progress"
            );
        }
    }

    /// Main control loop. Reacts to the tick interval and to out-of-cycle
    /// loadpoint events until the stop token fires. In-flight device calls
    /// complete; no further cycles run afterwards.
    pub async fn run(self: Arc<Self>, stop: CancellationToken, interval: Duration) {
        let mut update_rx = self
            .lp_update_rx
            .lock()
            .await
            .take()
            .expect("site loop started twice");

        self.prepare();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cursor = 0usize;

        info!(interval_s = interval.as_secs(), "control loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let lp = self.loadpoints[cursor % self.loadpoints.len()].clone();
                    cursor = cursor.wrapping_add(1);
                    self.update(&lp, true).await;
                }
                event = update_rx.recv() => {
                    match event {
                        Some(id) => {
                            let lp = self.loadpoints[id].clone();
                            self.update(&lp, false).await;
                        }
                        None => return,
                    }
                }
                _ = stop.cancelled() => {
                    info!("control loop stopped");
                    return;
                }
            }
        }
    }

    /// Close open sessions on all loadpoints. Invoked on shutdown.
    pub async fn shutdown(&self) {
        for lp in &self.loadpoints {
            lp.stop_session().await;
        }
    }
}
