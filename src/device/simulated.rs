//! In-process devices for the `sim` hardware mode and for tests.
//!
//! Readings are settable, capabilities are chosen at construction and
//! failures can be scripted (fail the next N calls) to exercise the retry
//! and degradation paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;

use super::charger::{
    ChargeRater, ChargeStatus, Charger, CurrentMillis, PhaseSwitcher,
};
use super::meter::{BatterySoc, EnergyMeter, Meter, PhaseCurrents};
use super::vehicle::{
    ChargeState, Climater, FinishTimer, Vehicle, VehicleRange, VehicleSoc,
};
use super::{DeviceError, DeviceResult, Identifier, Resurrector};

fn take_failure(counter: &mut u32, what: &str) -> DeviceResult<()> {
    if *counter > 0 {
        *counter -= 1;
        return Err(DeviceError::Device(format!("simulated {what} failure")));
    }
    Ok(())
}

// --- meter ---------------------------------------------------------------

#[derive(Debug, Default)]
struct SimMeterState {
    power: f64,
    soc: f64,
    currents: (f64, f64, f64),
    energy_wh: f64,
    fail_power: u32,
    fail_soc: u32,
}

/// Simulated meter. Capabilities are fixed at construction.
#[derive(Debug, Default)]
pub struct SimMeter {
    state: Mutex<SimMeterState>,
    has_soc: bool,
    has_currents: bool,
    has_energy: bool,
    jitter: f64,
}

impl SimMeter {
    pub fn new(power: f64) -> Self {
        Self {
            state: Mutex::new(SimMeterState {
                power,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn with_soc(mut self, soc: f64) -> Self {
        self.has_soc = true;
        self.state.get_mut().soc = soc;
        self
    }

    pub fn with_currents(mut self, l1: f64, l2: f64, l3: f64) -> Self {
        self.has_currents = true;
        self.state.get_mut().currents = (l1, l2, l3);
        self
    }

    pub fn with_energy(mut self, energy_wh: f64) -> Self {
        self.has_energy = true;
        self.state.get_mut().energy_wh = energy_wh;
        self
    }

    /// Relative reading noise, e.g. 0.02 for +/-2%.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.abs();
        self
    }

    pub fn set_power(&self, power: f64) {
        self.state.lock().power = power;
    }

    pub fn set_soc(&self, soc: f64) {
        self.state.lock().soc = soc;
    }

    pub fn set_energy(&self, energy_wh: f64) {
        self.state.lock().energy_wh = energy_wh;
    }

    /// Fail the next `n` power reads.
    pub fn fail_power_reads(&self, n: u32) {
        self.state.lock().fail_power = n;
    }

    /// Fail the next `n` soc reads.
    pub fn fail_soc_reads(&self, n: u32) {
        self.state.lock().fail_soc = n;
    }
}

#[async_trait]
impl Meter for SimMeter {
    async fn current_power(&self) -> DeviceResult<f64> {
        let mut state = self.state.lock();
        take_failure(&mut state.fail_power, "power read")?;
        let mut power = state.power;
        if self.jitter > 0.0 {
            let noise = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            power *= 1.0 + noise;
        }
        Ok(power)
    }

    fn phase_currents(&self) -> Option<&dyn PhaseCurrents> {
        self.has_currents.then_some(self as &dyn PhaseCurrents)
    }

    fn energy(&self) -> Option<&dyn EnergyMeter> {
        self.has_energy.then_some(self as &dyn EnergyMeter)
    }

    fn battery(&self) -> Option<&dyn BatterySoc> {
        self.has_soc.then_some(self as &dyn BatterySoc)
    }
}

#[async_trait]
impl PhaseCurrents for SimMeter {
    async fn currents(&self) -> DeviceResult<(f64, f64, f64)> {
        Ok(self.state.lock().currents)
    }
}

#[async_trait]
impl EnergyMeter for SimMeter {
    async fn total_energy(&self) -> DeviceResult<f64> {
        Ok(self.state.lock().energy_wh)
    }
}

#[async_trait]
impl BatterySoc for SimMeter {
    async fn soc(&self) -> DeviceResult<f64> {
        let mut state = self.state.lock();
        take_failure(&mut state.fail_soc, "soc read")?;
        Ok(state.soc)
    }
}

// --- charger -------------------------------------------------------------

#[derive(Debug)]
struct SimChargerState {
    status: ChargeStatus,
    enabled: bool,
    current: f64,
    phases: u8,
    power: f64,
    charged_wh: f64,
    fail_status: u32,
    fail_enable: u32,
    fail_current: u32,
    enable_calls: Vec<bool>,
    phase_calls: Vec<u8>,
    wake_ups: u32,
}

impl Default for SimChargerState {
    fn default() -> Self {
        Self {
            status: ChargeStatus::A,
            enabled: false,
            current: 0.0,
            phases: 3,
            power: 0.0,
            charged_wh: 0.0,
            fail_status: 0,
            fail_enable: 0,
            fail_current: 0,
            enable_calls: Vec::new(),
            phase_calls: Vec::new(),
            wake_ups: 0,
        }
    }
}

/// Simulated charger. Capabilities are fixed at construction; `auto_charge`
/// makes enable/disable move the status between B and C like a cooperative
/// vehicle would.
#[derive(Debug, Default)]
pub struct SimCharger {
    state: Mutex<SimChargerState>,
    has_millis: bool,
    has_phase_switcher: bool,
    has_rater: bool,
    has_meter: bool,
    has_resurrector: bool,
    identity: Option<String>,
    auto_charge: bool,
}

impl SimCharger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_millis(mut self) -> Self {
        self.has_millis = true;
        self
    }

    pub fn with_phase_switcher(mut self, phases: u8) -> Self {
        self.has_phase_switcher = true;
        self.state.get_mut().phases = phases;
        self
    }

    pub fn with_rater(mut self) -> Self {
        self.has_rater = true;
        self
    }

    pub fn with_meter(mut self) -> Self {
        self.has_meter = true;
        self
    }

    pub fn with_resurrector(mut self) -> Self {
        self.has_resurrector = true;
        self
    }

    pub fn with_identity(mut self, id: impl Into<String>) -> Self {
        self.identity = Some(id.into());
        self
    }

    pub fn with_auto_charge(mut self) -> Self {
        self.auto_charge = true;
        self
    }

    pub fn set_status(&self, status: ChargeStatus) {
        self.state.lock().status = status;
    }

    pub fn set_power(&self, power: f64) {
        self.state.lock().power = power;
    }

    pub fn set_charged_energy(&self, wh: f64) {
        self.state.lock().charged_wh = wh;
    }

    pub fn fail_status_reads(&self, n: u32) {
        self.state.lock().fail_status = n;
    }

    pub fn fail_enable_calls(&self, n: u32) {
        self.state.lock().fail_enable = n;
    }

    pub fn fail_current_calls(&self, n: u32) {
        self.state.lock().fail_current = n;
    }

    pub fn status_now(&self) -> ChargeStatus {
        self.state.lock().status
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn current(&self) -> f64 {
        self.state.lock().current
    }

    pub fn phase_count(&self) -> u8 {
        self.state.lock().phases
    }

    pub fn wake_up_count(&self) -> u32 {
        self.state.lock().wake_ups
    }

    pub fn enable_history(&self) -> Vec<bool> {
        self.state.lock().enable_calls.clone()
    }

    pub fn phase_history(&self) -> Vec<u8> {
        self.state.lock().phase_calls.clone()
    }
}

#[async_trait]
impl Charger for SimCharger {
    async fn status(&self) -> DeviceResult<ChargeStatus> {
        let mut state = self.state.lock();
        take_failure(&mut state.fail_status, "status read")?;
        Ok(state.status)
    }

    async fn enabled(&self) -> DeviceResult<bool> {
        Ok(self.state.lock().enabled)
    }

    async fn enable(&self, enable: bool) -> DeviceResult<()> {
        let mut state = self.state.lock();
        take_failure(&mut state.fail_enable, "enable")?;
        state.enabled = enable;
        state.enable_calls.push(enable);
        if self.auto_charge {
            if enable && state.status == ChargeStatus::B {
                state.status = ChargeStatus::C;
            } else if !enable && state.status.is_charging() {
                state.status = ChargeStatus::B;
            }
        }
        Ok(())
    }

    async fn max_current(&self, current: i64) -> DeviceResult<()> {
        let mut state = self.state.lock();
        take_failure(&mut state.fail_current, "max current")?;
        state.current = current as f64;
        Ok(())
    }

    fn millis(&self) -> Option<&dyn CurrentMillis> {
        self.has_millis.then_some(self as &dyn CurrentMillis)
    }

    fn charge_rater(&self) -> Option<&dyn ChargeRater> {
        self.has_rater.then_some(self as &dyn ChargeRater)
    }

    fn phase_switcher(&self) -> Option<&dyn PhaseSwitcher> {
        self.has_phase_switcher
            .then_some(self as &dyn PhaseSwitcher)
    }

    fn meter(&self) -> Option<&dyn Meter> {
        self.has_meter.then_some(self as &dyn Meter)
    }

    fn identifier(&self) -> Option<&dyn Identifier> {
        self.identity
            .is_some()
            .then_some(self as &dyn Identifier)
    }

    fn resurrector(&self) -> Option<&dyn Resurrector> {
        self.has_resurrector.then_some(self as &dyn Resurrector)
    }
}

#[async_trait]
impl CurrentMillis for SimCharger {
    async fn max_current_millis(&self, current: f64) -> DeviceResult<()> {
        let mut state = self.state.lock();
        take_failure(&mut state.fail_current, "max current")?;
        state.current = current;
        Ok(())
    }
}

#[async_trait]
impl ChargeRater for SimCharger {
    async fn charged_energy(&self) -> DeviceResult<f64> {
        Ok(self.state.lock().charged_wh)
    }
}

#[async_trait]
impl PhaseSwitcher for SimCharger {
    async fn phases_1p3p(&self, phases: u8) -> DeviceResult<()> {
        if phases != 1 && phases != 3 {
            return Err(DeviceError::Device(format!("invalid phase count {phases}")));
        }
        let mut state = self.state.lock();
        state.phases = phases;
        state.phase_calls.push(phases);
        Ok(())
    }
}

#[async_trait]
impl Meter for SimCharger {
    async fn current_power(&self) -> DeviceResult<f64> {
        Ok(self.state.lock().power)
    }
}

#[async_trait]
impl Identifier for SimCharger {
    async fn identify(&self) -> DeviceResult<Option<String>> {
        let state = self.state.lock();
        Ok(state.status.is_connected().then(|| {
            self.identity.clone().unwrap_or_default()
        }))
    }
}

#[async_trait]
impl Resurrector for SimCharger {
    async fn wake_up(&self) -> DeviceResult<()> {
        self.state.lock().wake_ups += 1;
        Ok(())
    }
}

// --- vehicle -------------------------------------------------------------

#[derive(Debug, Default)]
struct SimVehicleState {
    soc: f64,
    status: ChargeStatus,
    range_km: i64,
    climate_active: bool,
    asleep: bool,
    wake_ups: u32,
}

/// Simulated vehicle. Capabilities are fixed at construction.
pub struct SimVehicle {
    title: String,
    capacity_kwh: f64,
    state: Mutex<SimVehicleState>,
    has_soc: bool,
    has_status: bool,
    has_range: bool,
    has_finish_timer: bool,
    has_climater: bool,
    has_resurrector: bool,
    identity: Option<String>,
    finish_time: Option<DateTime<Utc>>,
}

impl SimVehicle {
    pub fn new(title: impl Into<String>, capacity_kwh: f64) -> Self {
        Self {
            title: title.into(),
            capacity_kwh,
            state: Mutex::new(SimVehicleState {
                status: ChargeStatus::A,
                ..Default::default()
            }),
            has_soc: false,
            has_status: false,
            has_range: false,
            has_finish_timer: false,
            has_climater: false,
            has_resurrector: false,
            identity: None,
            finish_time: None,
        }
    }

    pub fn with_soc(mut self, soc: f64) -> Self {
        self.has_soc = true;
        self.state.get_mut().soc = soc;
        self
    }

    pub fn with_status(mut self, status: ChargeStatus) -> Self {
        self.has_status = true;
        self.state.get_mut().status = status;
        self
    }

    pub fn with_range(mut self, km: i64) -> Self {
        self.has_range = true;
        self.state.get_mut().range_km = km;
        self
    }

    pub fn with_finish_time(mut self, at: DateTime<Utc>) -> Self {
        self.has_finish_timer = true;
        self.finish_time = Some(at);
        self
    }

    pub fn with_climater(mut self) -> Self {
        self.has_climater = true;
        self
    }

    pub fn with_resurrector(mut self) -> Self {
        self.has_resurrector = true;
        self
    }

    pub fn with_identity(mut self, id: impl Into<String>) -> Self {
        self.identity = Some(id.into());
        self
    }

    pub fn set_soc(&self, soc: f64) {
        self.state.lock().soc = soc;
    }

    pub fn set_status(&self, status: ChargeStatus) {
        self.state.lock().status = status;
    }

    pub fn set_climate_active(&self, active: bool) {
        self.state.lock().climate_active = active;
    }

    /// An asleep vehicle answers every query with `DeviceError::Asleep`.
    pub fn set_asleep(&self, asleep: bool) {
        self.state.lock().asleep = asleep;
    }

    pub fn wake_up_count(&self) -> u32 {
        self.state.lock().wake_ups
    }

    fn guard_awake(&self) -> DeviceResult<()> {
        if self.state.lock().asleep {
            return Err(DeviceError::Asleep);
        }
        Ok(())
    }
}

#[async_trait]
impl Vehicle for SimVehicle {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn capacity_kwh(&self) -> f64 {
        self.capacity_kwh
    }

    fn soc(&self) -> Option<&dyn VehicleSoc> {
        self.has_soc.then_some(self as &dyn VehicleSoc)
    }

    fn range(&self) -> Option<&dyn VehicleRange> {
        self.has_range.then_some(self as &dyn VehicleRange)
    }

    fn finish_timer(&self) -> Option<&dyn FinishTimer> {
        self.has_finish_timer.then_some(self as &dyn FinishTimer)
    }

    fn charge_state(&self) -> Option<&dyn ChargeState> {
        self.has_status.then_some(self as &dyn ChargeState)
    }

    fn climater(&self) -> Option<&dyn Climater> {
        self.has_climater.then_some(self as &dyn Climater)
    }

    fn resurrector(&self) -> Option<&dyn Resurrector> {
        self.has_resurrector.then_some(self as &dyn Resurrector)
    }

    fn identifier(&self) -> Option<&dyn Identifier> {
        self.identity.is_some().then_some(self as &dyn Identifier)
    }
}

#[async_trait]
impl VehicleSoc for SimVehicle {
    async fn soc(&self) -> DeviceResult<f64> {
        self.guard_awake()?;
        Ok(self.state.lock().soc)
    }
}

#[async_trait]
impl VehicleRange for SimVehicle {
    async fn range_km(&self) -> DeviceResult<i64> {
        self.guard_awake()?;
        Ok(self.state.lock().range_km)
    }
}

#[async_trait]
impl FinishTimer for SimVehicle {
    async fn finish_time(&self) -> DeviceResult<DateTime<Utc>> {
        self.guard_awake()?;
        self.finish_time
            .ok_or_else(|| DeviceError::Device("no finish time".into()))
    }
}

#[async_trait]
impl ChargeState for SimVehicle {
    async fn status(&self) -> DeviceResult<ChargeStatus> {
        self.guard_awake()?;
        Ok(self.state.lock().status)
    }
}

#[async_trait]
impl Climater for SimVehicle {
    async fn climate_active(&self) -> DeviceResult<bool> {
        self.guard_awake()?;
        Ok(self.state.lock().climate_active)
    }
}

#[async_trait]
impl Resurrector for SimVehicle {
    async fn wake_up(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.wake_ups += 1;
        state.asleep = false;
        Ok(())
    }
}

#[async_trait]
impl Identifier for SimVehicle {
    async fn identify(&self) -> DeviceResult<Option<String>> {
        Ok(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn meter_capabilities_are_pure_predicates() {
        let plain = SimMeter::new(1000.0);
        assert!(plain.battery().is_none());
        assert!(plain.phase_currents().is_none());
        assert!(plain.energy().is_none());

        let battery = SimMeter::new(-500.0).with_soc(80.0);
        let soc = battery.battery().expect("soc capability");
        assert_eq!(soc.soc().await.unwrap(), 80.0);
    }

    #[tokio::test]
    async fn meter_failure_script_is_consumed() {
        let meter = SimMeter::new(100.0);
        meter.fail_power_reads(1);
        assert!(meter.current_power().await.is_err());
        assert_eq!(meter.current_power().await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn charger_auto_charge_follows_enable() {
        let charger = SimCharger::new().with_auto_charge();
        charger.set_status(ChargeStatus::B);

        charger.enable(true).await.unwrap();
        assert_eq!(charger.status_now(), ChargeStatus::C);

        charger.enable(false).await.unwrap();
        assert_eq!(charger.status_now(), ChargeStatus::B);
    }

    #[tokio::test]
    async fn asleep_vehicle_reports_asleep() {
        let vehicle = SimVehicle::new("ev", 60.0).with_soc(40.0).with_resurrector();
        vehicle.set_asleep(true);
        let soc = Vehicle::soc(&vehicle).unwrap();
        assert!(matches!(soc.soc().await, Err(DeviceError::Asleep)));

        vehicle.resurrector().unwrap().wake_up().await.unwrap();
        assert_eq!(soc.soc().await.unwrap(), 40.0);
    }
}
