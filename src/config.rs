use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::core::loadpoint::ChargeMode;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub site: SiteConfig,

    #[serde(default)]
    #[validate(nested)]
    pub controller: ControllerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub health: HealthConfig,

    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub tariff: Option<TariffConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub meters: Vec<MeterDeviceConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub chargers: Vec<ChargerDeviceConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub vehicles: Vec<VehicleDeviceConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub loadpoints: Vec<LoadpointConfig>,
}

/// Site-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SiteConfig {
    #[serde(default = "default_site_title")]
    pub title: String,

    /// Operating voltage. 230V for most of Europe.
    #[serde(default = "default_voltage")]
    #[validate(range(min = 100.0, max = 400.0))]
    pub voltage: f64,

    /// Household safety margin subtracted from the available surplus (W).
    #[serde(default)]
    pub residual_power: f64,

    /// Prefer stationary battery charging below this soc (%).
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub priority_soc: f64,

    /// Allow discharging the stationary battery into the vehicle above this
    /// soc (%). 0 disables buffering.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub buffer_soc: f64,

    /// Ignore battery charging when grid import exceeds this value (W).
    /// 0 disables the cap.
    #[serde(default)]
    pub max_grid_supply_while_battery_charging: f64,

    #[serde(default)]
    #[validate(custom(function = "validate_site_meters"))]
    pub meters: SiteMetersConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            title: default_site_title(),
            voltage: default_voltage(),
            residual_power: 0.0,
            priority_soc: 0.0,
            buffer_soc: 0.0,
            max_grid_supply_while_battery_charging: 0.0,
            meters: SiteMetersConfig::default(),
        }
    }
}

/// Meter references for the site
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SiteMetersConfig {
    #[serde(default)]
    pub grid: Option<String>,

    #[serde(default)]
    pub pv: Option<String>,

    #[serde(default)]
    pub pvs: Vec<String>,

    #[serde(default)]
    pub battery: Option<String>,

    #[serde(default)]
    pub batteries: Vec<String>,
}

impl SiteMetersConfig {
    /// All PV meter references, single and plural forms combined.
    pub fn pv_refs(&self) -> Vec<String> {
        let mut refs = self.pvs.clone();
        if let Some(pv) = &self.pv {
            refs.push(pv.clone());
        }
        refs
    }

    /// All battery meter references, single and plural forms combined.
    pub fn battery_refs(&self) -> Vec<String> {
        let mut refs = self.batteries.clone();
        if let Some(battery) = &self.battery {
            refs.push(battery.clone());
        }
        refs
    }
}

fn validate_site_meters(meters: &SiteMetersConfig) -> Result<(), validator::ValidationError> {
    if meters.pv.is_some() && !meters.pvs.is_empty() {
        return Err(validator::ValidationError::new("cannot have pv and pvs both"));
    }
    if meters.battery.is_some() && !meters.batteries.is_empty() {
        return Err(validator::ValidationError::new(
            "cannot have battery and batteries both",
        ));
    }
    Ok(())
}

/// Control loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ControllerConfig {
    #[serde(default = "default_interval_seconds")]
    #[validate(range(min = 1, max = 3600))]
    pub interval_seconds: u64,

    #[serde(default = "default_max_retries")]
    #[validate(range(min = 1, max = 10))]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    #[validate(range(min = 10, max = 10000))]
    pub retry_delay_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn retry_policy(&self) -> crate::device::RetryPolicy {
        crate::device::RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HealthConfig {
    /// Socket is bound at /tmp/<name>.
    #[serde(default = "default_socket_name")]
    #[validate(length(min = 1))]
    pub socket_name: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
        }
    }
}

impl HealthConfig {
    pub fn socket_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/tmp/{}", self.socket_name))
    }
}

/// Session history database
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub path: String,
}

/// Fixed cheap-rate window, hours in [from, to), UTC. A wrapping window
/// (from > to) spans midnight.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TariffConfig {
    #[validate(range(min = 0, max = 23))]
    pub cheap_from_hour: u32,

    #[validate(range(min = 0, max = 23))]
    pub cheap_to_hour: u32,

    #[serde(default = "default_currency")]
    pub currency: String,
}

/// One simulated/declared meter
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MeterDeviceConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_device_kind")]
    pub kind: DeviceKind,

    /// Initial power reading (W).
    #[serde(default)]
    pub power: f64,

    /// Soc capability, battery meters only.
    #[serde(default)]
    pub soc: Option<f64>,

    #[serde(default)]
    pub currents: bool,

    #[serde(default)]
    pub energy: bool,

    /// Relative reading noise for simulation, e.g. 0.02.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 0.5))]
    pub jitter: f64,
}

/// One simulated/declared charger
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChargerDeviceConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_device_kind")]
    pub kind: DeviceKind,

    #[serde(default)]
    pub millis: bool,

    #[serde(default)]
    pub phase_switcher: bool,

    #[serde(default)]
    pub rater: bool,

    #[serde(default)]
    pub meter: bool,

    #[serde(default)]
    pub wakeup: bool,

    #[serde(default)]
    pub identity: Option<String>,
}

/// One configured vehicle
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VehicleDeviceConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_device_kind")]
    pub kind: DeviceKind,

    #[serde(default = "default_capacity_kwh")]
    #[validate(range(min = 1.0, max = 300.0))]
    pub capacity_kwh: f64,

    #[serde(default)]
    pub soc: Option<f64>,

    /// Vehicle-side charge state capability, value is the initial status
    /// letter (A, B, C).
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub range_km: Option<i64>,

    #[serde(default)]
    pub climater: bool,

    #[serde(default)]
    pub wakeup: bool,

    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Sim,
}

/// One loadpoint
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_loadpoint"))]
pub struct LoadpointConfig {
    #[serde(default = "default_loadpoint_title")]
    pub title: String,

    #[serde(default = "default_mode")]
    pub mode: ChargeMode,

    #[serde(default = "default_min_current")]
    #[validate(range(min = 1.0, max = 32.0))]
    pub min_current: f64,

    #[serde(default = "default_max_current")]
    #[validate(range(min = 1.0, max = 63.0))]
    pub max_current: f64,

    /// Enabled phases, 1 or 3.
    #[serde(default = "default_phases")]
    pub phases: u8,

    /// Charger reference, mandatory.
    pub charger: String,

    /// Dedicated charge meter reference.
    #[serde(default)]
    pub meter: Option<String>,

    /// Default vehicle reference.
    #[serde(default)]
    pub vehicle: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub delays: DelaysConfig,

    #[serde(default)]
    #[validate(nested)]
    pub soc: SocConfig,
}

fn validate_loadpoint(lp: &LoadpointConfig) -> Result<(), validator::ValidationError> {
    if lp.phases != 1 && lp.phases != 3 {
        return Err(validator::ValidationError::new("phases must be 1 or 3"));
    }
    if lp.min_current > lp.max_current {
        return Err(validator::ValidationError::new(
            "min_current must not exceed max_current",
        ));
    }
    if lp.charger.is_empty() {
        return Err(validator::ValidationError::new("charger reference missing"));
    }
    Ok(())
}

/// Hysteresis delays of a loadpoint
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DelaysConfig {
    #[serde(default = "default_enable_seconds")]
    pub enable_seconds: u64,

    #[serde(default = "default_disable_seconds")]
    pub disable_seconds: u64,

    #[serde(default = "default_phase_switch_seconds")]
    pub phase_switch_seconds: u64,

    #[serde(default = "default_wake_up_seconds")]
    pub wake_up_seconds: u64,
}

impl Default for DelaysConfig {
    fn default() -> Self {
        Self {
            enable_seconds: default_enable_seconds(),
            disable_seconds: default_disable_seconds(),
            phase_switch_seconds: default_phase_switch_seconds(),
            wake_up_seconds: default_wake_up_seconds(),
        }
    }
}

/// Vehicle soc thresholds of a loadpoint
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SocConfig {
    /// Charge at full power below this soc regardless of surplus (%).
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min: f64,

    /// Stop charging at this soc (%).
    #[serde(default = "default_target_soc")]
    #[validate(range(min = 1.0, max = 100.0))]
    pub target: f64,
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            min: 0.0,
            target: default_target_soc(),
        }
    }
}

// Default value functions
fn default_site_title() -> String { "Home".to_string() }
fn default_voltage() -> f64 { 230.0 }
fn default_interval_seconds() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 100 }
fn default_socket_name() -> String { "pvflow".to_string() }
fn default_currency() -> String { "EUR".to_string() }
fn default_device_kind() -> DeviceKind { DeviceKind::Sim }
fn default_capacity_kwh() -> f64 { 50.0 }
fn default_loadpoint_title() -> String { "Loadpoint".to_string() }
fn default_mode() -> ChargeMode { ChargeMode::Pv }
fn default_min_current() -> f64 { 6.0 }
fn default_max_current() -> f64 { 16.0 }
fn default_phases() -> u8 { 3 }
fn default_enable_seconds() -> u64 { 60 }
fn default_disable_seconds() -> u64 { 180 }
fn default_phase_switch_seconds() -> u64 { 60 }
fn default_wake_up_seconds() -> u64 { 30 }
fn default_target_soc() -> f64 { 100.0 }

impl Config {
    /// Load configuration from pvflow.toml and PVFLOW__ environment
    /// variables (PVFLOW__SITE__VOLTAGE -> site.voltage).
    pub fn load() -> Result<Self> {
        Self::load_from(Figment::new().merge(Toml::file("pvflow.toml")))
    }

    pub fn load_file(path: &str) -> Result<Self> {
        Self::load_from(Figment::new().merge(Toml::file(path)))
    }

    fn load_from(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .merge(Env::prefixed("PVFLOW__").split("__"))
            .extract()
            .context("failed to parse configuration")?;

        config
            .validate()
            .context("configuration validation failed")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loadpoint() -> LoadpointConfig {
        LoadpointConfig {
            title: default_loadpoint_title(),
            mode: ChargeMode::Pv,
            min_current: 6.0,
            max_current: 16.0,
            phases: 3,
            charger: "wallbox".to_string(),
            meter: None,
            vehicle: None,
            delays: DelaysConfig::default(),
            soc: SocConfig::default(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.site.voltage, 230.0);
        assert_eq!(cfg.controller.interval_seconds, 30);
    }

    #[test]
    fn pv_and_pvs_both_is_rejected() {
        let mut cfg = Config::default();
        cfg.site.meters.pv = Some("roof".to_string());
        cfg.site.meters.pvs = vec!["east".to_string(), "west".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn battery_and_batteries_both_is_rejected() {
        let mut cfg = Config::default();
        cfg.site.meters.battery = Some("bat".to_string());
        cfg.site.meters.batteries = vec!["bat2".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn meter_refs_combine_single_and_plural() {
        let meters = SiteMetersConfig {
            pvs: vec!["east".to_string(), "west".to_string()],
            battery: Some("bat".to_string()),
            ..Default::default()
        };
        assert_eq!(meters.pv_refs(), vec!["east", "west"]);
        assert_eq!(meters.battery_refs(), vec!["bat"]);
    }

    #[test]
    fn loadpoint_phase_count_is_checked() {
        let mut lp = loadpoint();
        assert!(lp.validate().is_ok());

        lp.phases = 2;
        assert!(lp.validate().is_err());
    }

    #[test]
    fn loadpoint_current_window_is_checked() {
        let mut lp = loadpoint();
        lp.min_current = 20.0;
        assert!(lp.validate().is_err());
    }

    #[test]
    fn mode_parses_from_lowercase() {
        let lp: LoadpointConfig =
            toml::from_str("charger = \"wallbox\"\nmode = \"minpv\"").unwrap();
        assert_eq!(lp.mode, ChargeMode::MinPv);
        assert_eq!(lp.min_current, 6.0);
        assert_eq!(lp.delays.disable_seconds, 180);
    }
}
