use std::sync::Arc;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LoadpointConfig;
use crate::core::coordinator::CoordinatorAdapter;
use crate::core::publish::Publisher;
use crate::core::session::{Session, SessionStore};
use crate::core::timer::DelayTimer;
use crate::device::{
    retry, ChargeStatus, Charger, DeviceError, Meter, RetryPolicy, Vehicle,
};

/// User-selected charge mode.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChargeMode {
    /// Charger disabled.
    #[default]
    Off,
    /// Charge at maximum current regardless of surplus.
    Now,
    /// Always charge at least at minimum current, raise opportunistically.
    MinPv,
    /// Charge from surplus only, with enable/disable hysteresis.
    Pv,
}

/// Which source the open session's energy baseline was captured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum EnergySource {
    ChargeMeter,
    Rater,
    #[default]
    Integrator,
}

/// Integrates charge power over wall time as the last-resort session energy
/// source. Pausing prevents idle gaps from being integrated.
#[derive(Debug, Default)]
struct EnergyIntegrator {
    last: Option<Instant>,
    wh: f64,
}

impl EnergyIntegrator {
    fn restart(&mut self) {
        self.last = Some(Instant::now());
        self.wh = 0.0;
    }

    fn add(&mut self, power_w: f64) {
        let now = Instant::now();
        if let Some(last) = self.last {
            self.wh += power_w.max(0.0) * (now - last).as_secs_f64() / 3600.0;
        }
        self.last = Some(now);
    }

    fn pause(&mut self) {
        self.last = None;
    }

    fn energy_wh(&self) -> f64 {
        self.wh
    }
}

#[derive(Default)]
struct LpState {
    mode: ChargeMode,
    status: ChargeStatus,
    enabled: bool,
    /// Last current successfully written to the charger.
    offered_current: f64,
    /// Current the control law wants; reconciled against the charger every
    /// cycle so a failed write is retried.
    desired_current: f64,
    phases: u8,
    charge_power: f64,
    vehicle: Option<Arc<dyn Vehicle>>,
    vehicle_soc: Option<f64>,
    session: Option<Session>,
    session_source: EnergySource,
    session_energy: EnergyIntegrator,
    pv_timer: DelayTimer,
    phase_timer: DelayTimer,
    wake_timer: DelayTimer,
    status_failures: u32,
    /// Set while a phase switch is in flight so a transient fault status is
    /// not latched.
    phase_switch_guard: bool,
}

/// Runtime wiring of a loadpoint, assembled by the site.
pub struct LoadpointContext {
    pub id: usize,
    pub voltage: f64,
    pub charger: Arc<dyn Charger>,
    pub charge_meter: Option<Arc<dyn Meter>>,
    pub default_vehicle: Option<Arc<dyn Vehicle>>,
    pub coordinator: CoordinatorAdapter,
    pub publisher: Publisher,
    pub update_tx: mpsc::Sender<usize>,
    pub session_store: Option<Arc<dyn SessionStore>>,
    pub retry: RetryPolicy,
}

/// One regulatable charge point.
///
/// The loadpoint mirrors the charger's connection state, runs the
/// mode-dependent control law and keeps session records. All mutation goes
/// through [`Loadpoint::update`] or the explicit setters; the state lock is
/// never held across a device call.
pub struct Loadpoint {
    id: usize,
    title: String,
    voltage: f64,
    min_current: f64,
    max_current: f64,
    min_soc: f64,
    target_soc: f64,
    enable_delay: Duration,
    disable_delay: Duration,
    phase_switch_delay: Duration,
    wake_up_timeout: Duration,

    charger: Arc<dyn Charger>,
    charge_meter: Option<Arc<dyn Meter>>,
    default_vehicle: Option<Arc<dyn Vehicle>>,
    coordinator: CoordinatorAdapter,
    publisher: Publisher,
    update_tx: mpsc::Sender<usize>,
    session_store: Option<Arc<dyn SessionStore>>,
    retry: RetryPolicy,

    state: Mutex<LpState>,
}

impl Loadpoint {
    pub fn new(cfg: &LoadpointConfig, ctx: LoadpointContext) -> Self {
        Self {
            id: ctx.id,
            title: cfg.title.clone(),
            voltage: ctx.voltage,
            min_current: cfg.min_current,
            max_current: cfg.max_current,
            min_soc: cfg.soc.min,
            target_soc: cfg.soc.target,
            enable_delay: Duration::from_secs(cfg.delays.enable_seconds),
            disable_delay: Duration::from_secs(cfg.delays.disable_seconds),
            phase_switch_delay: Duration::from_secs(cfg.delays.phase_switch_seconds),
            wake_up_timeout: Duration::from_secs(cfg.delays.wake_up_seconds),
            charger: ctx.charger,
            charge_meter: ctx.charge_meter,
            default_vehicle: ctx.default_vehicle,
            coordinator: ctx.coordinator,
            publisher: ctx.publisher,
            update_tx: ctx.update_tx,
            session_store: ctx.session_store,
            retry: ctx.retry,
            state: Mutex::new(LpState {
                mode: cfg.mode,
                phases: cfg.phases,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub async fn mode(&self) -> ChargeMode {
        self.state.lock().await.mode
    }

    pub async fn status(&self) -> ChargeStatus {
        self.state.lock().await.status
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Current the control law asked for: 0 or within [min, max].
    pub async fn target_current(&self) -> f64 {
        self.state.lock().await.desired_current
    }

    pub async fn active_phases(&self) -> u8 {
        self.state.lock().await.phases
    }

    pub async fn charge_power(&self) -> f64 {
        self.state.lock().await.charge_power
    }

    pub async fn session_energy_wh(&self) -> f64 {
        self.state.lock().await.session_energy.energy_wh()
    }

    pub async fn vehicle_title(&self) -> Option<String> {
        self.state.lock().await.vehicle.as_ref().map(|v| v.title())
    }

    /// Change the user mode. User-visible, triggers an out-of-cycle update.
    pub async fn set_mode(&self, mode: ChargeMode) {
        let changed = {
            let mut st = self.state.lock().await;
            if st.mode != mode {
                st.mode = mode;
                true
            } else {
                false
            }
        };
        if changed {
            info!(loadpoint = %self.title, %mode, "charge mode");
            self.publisher.publish("mode", mode);
            self.request_update();
        }
    }

    /// Non-blocking self-notification; the site channel has capacity 1 and
    /// additional events are coalesced by dropping.
    fn request_update(&self) {
        let _ = self.update_tx.try_send(self.id);
    }

    /// Refresh the charge power reading from the best available source and
    /// feed the session energy integrator. Returns the new value.
    pub async fn refresh_charge_power(&self) -> f64 {
        let has_meter = self.charge_meter.is_some() || self.charger.meter().is_some();

        let measured = if let Some(meter) = &self.charge_meter {
            match retry(&self.retry, || meter.current_power()).await {
                Ok(power) => Some(power),
                Err(err) => {
                    error!(loadpoint = %self.title, error = %err, "charge meter read failed");
                    None
                }
            }
        } else if let Some(meter) = self.charger.meter() {
            match retry(&self.retry, || meter.current_power()).await {
                Ok(power) => Some(power),
                Err(err) => {
                    error!(loadpoint = %self.title, error = %err, "charger power read failed");
                    None
                }
            }
        } else {
            None
        };

        let mut st = self.state.lock().await;
        let power = match (has_meter, measured) {
            (true, Some(power)) => power,
            // transient failure, keep last reading
            (true, None) => st.charge_power,
            (false, _) => {
                if st.status.is_charging() {
                    st.offered_current * st.phases as f64 * self.voltage
                } else {
                    0.0
                }
            }
        };
        st.charge_power = power;

        if st.status.is_charging() {
            st.session_energy.add(power);
        } else {
            st.session_energy.pause();
        }

        self.publisher.publish("chargePower", power);
        power
    }

    /// Central decision function, invoked by the site loop.
    pub async fn update(&self, site_power: f64, cheap: bool, battery_buffered: bool) {
        self.process_vehicle_releases().await;

        if !self.sync_charger().await {
            self.publish_state().await;
            return;
        }

        let fault = { self.state.lock().await.status.is_fault() };
        if fault {
            debug!(loadpoint = %self.title, "charger fault, control suspended");
            self.publish_state().await;
            return;
        }

        let soc = self.read_vehicle_soc().await;
        let mode = { self.state.lock().await.mode };
        let target = self
            .desired_current(mode, site_power, cheap, battery_buffered, soc)
            .await;

        self.set_limit(target).await;
        self.maybe_wake_vehicle().await;
        self.publish_state().await;
    }

    async fn desired_current(
        &self,
        mode: ChargeMode,
        site_power: f64,
        cheap: bool,
        battery_buffered: bool,
        soc: Option<f64>,
    ) -> f64 {
        if mode == ChargeMode::Off {
            return 0.0;
        }

        if let Some(soc) = soc {
            if self.target_soc < 100.0 && soc >= self.target_soc {
                debug!(loadpoint = %self.title, soc, "target soc reached");
                return 0.0;
            }
            if self.min_soc > 0.0 && soc < self.min_soc {
                debug!(loadpoint = %self.title, soc, "below minimum soc, charging at maximum");
                return self.max_current;
            }
        }

        if mode == ChargeMode::Now {
            return self.max_current;
        }

        let mut target = self
            .pv_max_current(mode, site_power, battery_buffered)
            .await;

        if target <= 0.0 && self.climate_active().await {
            debug!(loadpoint = %self.title, "climate active, keeping minimum current");
            target = self.min_current;
        }

        // cheap-rate overlay: behave like Now for the duration of the window
        if cheap {
            debug!(loadpoint = %self.title, "cheap tariff window, charging at maximum");
            target = self.max_current;
        }

        target
    }

    /// PV/MinPV control law. The available surplus is the exported site
    /// power plus what this loadpoint already draws; the raw target follows
    /// from dividing by the per-ampere power of the active phase
    /// configuration.
    async fn pv_max_current(
        &self,
        mode: ChargeMode,
        site_power: f64,
        battery_buffered: bool,
    ) -> f64 {
        if self.charger.phase_switcher().is_some() {
            self.pv_scale_phases(site_power).await;
        }

        let mut st = self.state.lock().await;
        let phases = st.phases.max(1) as f64;
        let available_power = -site_power + st.charge_power;
        let target = (available_power / (phases * self.voltage)).clamp(0.0, self.max_current);
        let charging = st.status.is_charging();

        // MinPV floors at min current; a buffered stationary battery keeps
        // an active charge running down to its buffer soc
        if (mode == ChargeMode::MinPv || (battery_buffered && charging))
            && target < self.min_current
        {
            st.pv_timer.disarm();
            return self.min_current;
        }

        if mode == ChargeMode::Pv && st.enabled && target < self.min_current {
            if st.pv_timer.gate(true, self.disable_delay) {
                debug!(loadpoint = %self.title, "pv disable timer elapsed");
                st.pv_timer.disarm();
                return 0.0;
            }
            debug!(
                loadpoint = %self.title,
                remaining_s = st.pv_timer.remaining(self.disable_delay).as_secs(),
                "surplus below minimum, disable pending"
            );
            return self.min_current;
        }

        if mode == ChargeMode::Pv && !st.enabled {
            if target >= self.min_current {
                if st.pv_timer.gate(true, self.enable_delay) {
                    debug!(loadpoint = %self.title, "pv enable timer elapsed");
                    st.pv_timer.disarm();
                    return self.min_current;
                }
                debug!(
                    loadpoint = %self.title,
                    remaining_s = st.pv_timer.remaining(self.enable_delay).as_secs(),
                    "surplus above minimum, enable pending"
                );
            } else {
                st.pv_timer.disarm();
            }
            return 0.0;
        }

        st.pv_timer.disarm();
        target
    }

    /// Evaluate 1p/3p scaling against the sustained available power.
    async fn pv_scale_phases(&self, site_power: f64) {
        let decision = {
            let mut st = self.state.lock().await;
            let available_power = -site_power + st.charge_power;

            let scale_down =
                st.phases == 3 && available_power < self.max_current * self.voltage;
            let scale_up = st.phases == 1
                && available_power >= self.min_current * 3.0 * self.voltage;

            if scale_down || scale_up {
                let target = if scale_down { 1 } else { 3 };
                if st.phase_timer.gate(true, self.phase_switch_delay) {
                    st.phase_timer.disarm();
                    Some(target)
                } else {
                    debug!(
                        loadpoint = %self.title,
                        target,
                        remaining_s = st.phase_timer.remaining(self.phase_switch_delay).as_secs(),
                        "phase switch pending"
                    );
                    None
                }
            } else {
                st.phase_timer.disarm();
                None
            }
        };

        if let Some(phases) = decision {
            self.switch_phases(phases).await;
        }
    }

    /// Disable, switch the contactor, then let the control law re-enable
    /// immediately by expiring the pv timer.
    async fn switch_phases(&self, phases: u8) {
        let Some(switcher) = self.charger.phase_switcher() else {
            return;
        };
        info!(loadpoint = %self.title, phases, "switching phases");

        {
            self.state.lock().await.phase_switch_guard = true;
        }

        self.set_limit(0.0).await;

        if let Err(err) = switcher.phases_1p3p(phases).await {
            error!(loadpoint = %self.title, error = %err, "phase switch failed");
            return;
        }

        let mut st = self.state.lock().await;
        st.phases = phases;
        st.phase_timer.disarm();
        st.pv_timer.expire();
        self.publisher.publish("phases", phases);
    }

    /// Mirror the charger status into the connection state machine.
    /// Returns false when control decisions must be skipped this cycle.
    async fn sync_charger(&self) -> bool {
        let status_res = self.charger.status().await;

        let transition = {
            let mut st = self.state.lock().await;
            match status_res {
                Ok(new_status) => {
                    st.status_failures = 0;
                    let guarded = st.phase_switch_guard;
                    st.phase_switch_guard = false;
                    if new_status.is_fault() && guarded {
                        debug!(loadpoint = %self.title, "ignoring fault status during phase switch");
                        None
                    } else if new_status != st.status {
                        Some((st.status, new_status))
                    } else {
                        None
                    }
                }
                Err(err) => {
                    st.status_failures += 1;
                    let failures = st.status_failures;
                    warn!(loadpoint = %self.title, failures, error = %err, "charger status read failed");
                    if failures < 2 {
                        // keep last known state for one more cycle
                        return true;
                    }
                    st.desired_current = 0.0;
                    drop(st);

                    warn!(loadpoint = %self.title, "charger unreachable, disabling");
                    if let Err(err) = self.charger.enable(false).await {
                        error!(loadpoint = %self.title, error = %err, "defensive disable failed");
                    }
                    let mut st = self.state.lock().await;
                    st.enabled = false;
                    st.offered_current = 0.0;
                    return false;
                }
            }
        };

        if let Some((old, new)) = transition {
            self.on_status_change(old, new).await;
        }

        // detect chargers toggled behind our back
        match self.charger.enabled().await {
            Ok(actual) => {
                let mut st = self.state.lock().await;
                if actual != st.enabled {
                    warn!(
                        loadpoint = %self.title,
                        actual,
                        expected = st.enabled,
                        "charger enable state out of sync, adopting"
                    );
                    st.enabled = actual;
                }
                if st.status.is_charging() && !st.enabled {
                    st.enabled = true;
                }
            }
            Err(err) => {
                debug!(loadpoint = %self.title, error = %err, "charger enabled read failed");
            }
        }

        true
    }

    async fn on_status_change(&self, old: ChargeStatus, new: ChargeStatus) {
        {
            self.state.lock().await.status = new;
        }
        info!(loadpoint = %self.title, from = %old, to = %new, "charger status");

        if !old.is_connected() && new.is_connected() {
            self.on_connect().await;
        }
        if old.is_charging() && !new.is_charging() {
            self.on_charge_stop().await;
        }
        if !old.is_charging() && new.is_charging() {
            self.on_charge_start().await;
        }
        if old.is_connected() && new == ChargeStatus::A {
            self.on_disconnect().await;
        }

        self.publisher.publish("connected", new.is_connected());
        self.publisher.publish("charging", new.is_charging());
        self.request_update();
    }

    async fn on_connect(&self) {
        info!(loadpoint = %self.title, "vehicle connected");

        // charger-side identification (RFID, MAC) wins over status matching
        let mut vehicle: Option<Arc<dyn Vehicle>> = None;
        if let Some(identifier) = self.charger.identifier() {
            match identifier.identify().await {
                Ok(Some(token)) if !token.is_empty() => {
                    info!(loadpoint = %self.title, token, "charger identified vehicle");
                    vehicle = self.vehicle_by_identity(&token).await;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(loadpoint = %self.title, error = %err, "charger identification failed")
                }
            }
        }

        let vehicle = match vehicle {
            Some(vehicle) => Some(vehicle),
            None => match self.coordinator.identify_vehicle_by_status().await {
                Some(vehicle) => Some(vehicle),
                None => self.default_vehicle.clone(),
            },
        };
        if let Some(vehicle) = vehicle {
            self.bind_vehicle(vehicle).await;
        }

        let mut st = self.state.lock().await;
        st.wake_timer.disarm();
    }

    async fn vehicle_by_identity(&self, token: &str) -> Option<Arc<dyn Vehicle>> {
        for vehicle in self.coordinator.vehicles() {
            let Some(identifier) = vehicle.identifier() else {
                continue;
            };
            match identifier.identify().await {
                Ok(Some(id)) if id == token => return Some(vehicle),
                Ok(_) => {}
                Err(err) => {
                    debug!(
                        loadpoint = %self.title,
                        vehicle = %vehicle.title(),
                        error = %err,
                        "vehicle identification failed"
                    );
                }
            }
        }
        None
    }

    async fn bind_vehicle(&self, vehicle: Arc<dyn Vehicle>) {
        self.coordinator.acquire(&vehicle);
        info!(loadpoint = %self.title, vehicle = %vehicle.title(), "vehicle bound");
        self.publisher.publish("vehicleTitle", vehicle.title());
        self.publisher
            .publish("vehicleCapacity", vehicle.capacity_kwh());

        let mut st = self.state.lock().await;
        st.vehicle = Some(vehicle);
        st.vehicle_soc = None;
    }

    async fn on_disconnect(&self) {
        info!(loadpoint = %self.title, "vehicle disconnected");

        // normally closed by the charge-stop transition already
        self.close_session().await;

        let vehicle = {
            let mut st = self.state.lock().await;
            st.pv_timer.disarm();
            st.phase_timer.disarm();
            st.wake_timer.disarm();
            st.vehicle_soc = None;
            st.vehicle.take()
        };
        if let Some(vehicle) = vehicle {
            self.coordinator.release(&vehicle);
        }
        self.publisher.publish("vehicleTitle", "");
    }

    async fn on_charge_start(&self) {
        info!(loadpoint = %self.title, "charging started");

        let meter_start = match &self.charge_meter {
            Some(meter) => match meter.energy() {
                Some(energy) => energy.total_energy().await.ok(),
                None => None,
            },
            None => None,
        };
        let rater_start = if meter_start.is_none() {
            match self.charger.charge_rater() {
                Some(rater) => rater.charged_energy().await.ok(),
                None => None,
            }
        } else {
            None
        };

        let mut st = self.state.lock().await;
        st.session_energy.restart();
        st.session_source = match (meter_start, rater_start) {
            (Some(_), _) => EnergySource::ChargeMeter,
            (None, Some(_)) => EnergySource::Rater,
            (None, None) => EnergySource::Integrator,
        };

        let vehicle = st.vehicle.as_ref().map(|v| v.title());
        let start_energy = meter_start.or(rater_start).unwrap_or(0.0);
        let mut session = Session::begin(&self.title, vehicle, start_energy);
        session.meter_start_wh = meter_start;
        st.session = Some(session.clone());
        drop(st);

        self.persist_session(&session).await;
    }

    async fn on_charge_stop(&self) {
        info!(loadpoint = %self.title, "charging stopped");
        self.close_session().await;
    }

    /// Close and persist the open session, if any. Also invoked from the
    /// shutdown path.
    pub async fn stop_session(&self) {
        self.close_session().await;
    }

    async fn close_session(&self) {
        let has_session = { self.state.lock().await.session.is_some() };
        if !has_session {
            return;
        }

        let meter_stop = match &self.charge_meter {
            Some(meter) => match meter.energy() {
                Some(energy) => energy.total_energy().await.ok(),
                None => None,
            },
            None => None,
        };
        let rater_stop = match self.charger.charge_rater() {
            Some(rater) => rater.charged_energy().await.ok(),
            None => None,
        };

        let session = {
            let mut st = self.state.lock().await;
            let Some(mut session) = st.session.take() else {
                return;
            };
            let integrated = st.session_energy.energy_wh();

            session.finished_at = Some(chrono::Utc::now());
            session.meter_stop_wh = meter_stop;
            session.charged_wh = match st.session_source {
                EnergySource::ChargeMeter => match (session.meter_start_wh, meter_stop) {
                    (Some(start), Some(stop)) => (stop - start).max(0.0),
                    _ => integrated,
                },
                EnergySource::Rater => match rater_stop {
                    Some(now) => (now - session.start_energy_wh).max(0.0),
                    None => integrated,
                },
                EnergySource::Integrator => integrated,
            };
            session.end_energy_wh = Some(session.start_energy_wh + session.charged_wh);
            session
        };

        info!(
            loadpoint = %self.title,
            charged_wh = session.charged_wh,
            "session closed"
        );
        self.publisher.publish("sessionEnergy", session.charged_wh);
        self.persist_session(&session).await;
    }

    async fn persist_session(&self, session: &Session) {
        let Some(store) = &self.session_store else {
            return;
        };
        if let Err(err) = store.persist(session).await {
            // history loss is acceptable, control is not
            error!(loadpoint = %self.title, error = %err, "session not persisted");
        }
    }

    /// Apply the target current to the charger. A target of 0 disables.
    /// Failed writes are logged and retried on the next cycle because the
    /// desired state is remembered.
    async fn set_limit(&self, current: f64) {
        let mut quantized = if self.charger.millis().is_some() {
            current
        } else {
            current.floor()
        };
        if current >= self.min_current && quantized < self.min_current {
            quantized = self.min_current.ceil();
        }

        let (prev_offered, prev_enabled) = {
            let mut st = self.state.lock().await;
            st.desired_current = quantized;
            (st.offered_current, st.enabled)
        };

        let mut current_write_failed = false;
        if quantized >= self.min_current && (quantized - prev_offered).abs() > f64::EPSILON {
            let res = match self.charger.millis() {
                Some(millis) => millis.max_current_millis(quantized).await,
                None => self.charger.max_current(quantized as i64).await,
            };
            match res {
                Ok(()) => {
                    self.state.lock().await.offered_current = quantized;
                    self.publisher.publish("chargeCurrent", quantized);
                    debug!(loadpoint = %self.title, current = quantized, "max current set");
                }
                Err(err) => {
                    error!(loadpoint = %self.title, current = quantized, error = %err, "set max current failed");
                    current_write_failed = true;
                }
            }
        }

        let want_enabled = quantized >= self.min_current;
        if want_enabled != prev_enabled && !current_write_failed {
            match self.charger.enable(want_enabled).await {
                Ok(()) => {
                    let mut st = self.state.lock().await;
                    st.enabled = want_enabled;
                    if !want_enabled {
                        st.offered_current = 0.0;
                    }
                    drop(st);
                    info!(loadpoint = %self.title, enabled = want_enabled, "charger");
                    self.publisher.publish("enabled", want_enabled);
                }
                Err(err) => {
                    error!(loadpoint = %self.title, enable = want_enabled, error = %err, "charger enable failed");
                }
            }
        }
    }

    /// Fire a wake-up when the charger stays idle while enabled and a
    /// wake-capable party is around. Prefers the charger-side wake-up.
    async fn maybe_wake_vehicle(&self) {
        let fire = {
            let mut st = self.state.lock().await;
            let has_target = self.charger.resurrector().is_some()
                || st
                    .vehicle
                    .as_ref()
                    .is_some_and(|v| v.resurrector().is_some());
            let condition = st.enabled && st.status == ChargeStatus::A && has_target;
            if st.wake_timer.gate(condition, self.wake_up_timeout) {
                st.wake_timer.disarm();
                true
            } else {
                false
            }
        };
        if !fire {
            return;
        }

        if let Some(resurrector) = self.charger.resurrector() {
            info!(loadpoint = %self.title, "waking vehicle via charger");
            if let Err(err) = resurrector.wake_up().await {
                warn!(loadpoint = %self.title, error = %err, "charger wake-up failed");
            }
            return;
        }

        let vehicle = { self.state.lock().await.vehicle.clone() };
        if let Some(vehicle) = vehicle {
            if let Some(resurrector) = vehicle.resurrector() {
                info!(loadpoint = %self.title, vehicle = %vehicle.title(), "waking vehicle");
                if let Err(err) = resurrector.wake_up().await {
                    warn!(loadpoint = %self.title, error = %err, "vehicle wake-up failed");
                }
            }
        }
    }

    /// Query and cache the bound vehicle's soc. Vehicle errors are never
    /// fatal; an asleep vehicle reads as unknown.
    async fn read_vehicle_soc(&self) -> Option<f64> {
        let vehicle = { self.state.lock().await.vehicle.clone() };
        let soc = match vehicle {
            Some(vehicle) => match vehicle.soc() {
                Some(cap) => match cap.soc().await {
                    Ok(soc) => Some(soc),
                    Err(DeviceError::Asleep) => {
                        debug!(loadpoint = %self.title, "vehicle asleep, soc unknown");
                        None
                    }
                    Err(err) => {
                        debug!(loadpoint = %self.title, error = %err, "vehicle soc unavailable");
                        None
                    }
                },
                None => None,
            },
            None => None,
        };

        self.state.lock().await.vehicle_soc = soc;
        soc
    }

    async fn climate_active(&self) -> bool {
        let vehicle = { self.state.lock().await.vehicle.clone() };
        let Some(vehicle) = vehicle else {
            return false;
        };
        let Some(climater) = vehicle.climater() else {
            return false;
        };
        match climater.climate_active().await {
            Ok(active) => active,
            Err(err) => {
                debug!(loadpoint = %self.title, error = %err, "climater unavailable");
                false
            }
        }
    }

    async fn process_vehicle_releases(&self) {
        for vehicle in self.coordinator.take_pending_release() {
            let mut st = self.state.lock().await;
            if st
                .vehicle
                .as_ref()
                .is_some_and(|own| Arc::ptr_eq(own, &vehicle))
            {
                info!(
                    loadpoint = %self.title,
                    vehicle = %vehicle.title(),
                    "vehicle taken over by another loadpoint"
                );
                st.vehicle = None;
                st.vehicle_soc = None;
            }
        }
    }

    async fn publish_state(&self) {
        let (mode, status, enabled, desired, phases, charge_power, session_wh, vehicle, vehicle_soc) = {
            let st = self.state.lock().await;
            (
                st.mode,
                st.status,
                st.enabled,
                st.desired_current,
                st.phases,
                st.charge_power,
                st.session_energy.energy_wh(),
                st.vehicle.clone(),
                st.vehicle_soc,
            )
        };

        self.publisher.publish("mode", mode);
        self.publisher.publish("connected", status.is_connected());
        self.publisher.publish("charging", status.is_charging());
        self.publisher.publish("enabled", enabled);
        self.publisher.publish("chargeCurrent", desired);
        self.publisher.publish("phases", phases);
        self.publisher.publish("chargePower", charge_power);
        self.publisher.publish("chargedEnergy", session_wh);
        if let Some(soc) = vehicle_soc {
            self.publisher.publish("vehicleSoC", soc);
        }
        if let Some(vehicle) = vehicle {
            if let Some(range) = vehicle.range() {
                if let Ok(km) = range.range_km().await {
                    self.publisher.publish("vehicleRange", km);
                }
            }
            if let Some(timer) = vehicle.finish_timer() {
                if let Ok(at) = timer.finish_time().await {
                    self.publisher.publish("vehicleFinishTime", at.to_rfc3339());
                }
            }
        }
    }
}
