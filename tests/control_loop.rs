//! End-to-end tests driving the site control loop against simulated devices.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pvflow::config::{Config, DelaysConfig, LoadpointConfig, SiteConfig, SocConfig};
use pvflow::core::loadpoint::ChargeMode;
use pvflow::core::publish::Publisher;
use pvflow::core::site::{LoadpointSpec, Site, SiteDevices};
use pvflow::device::simulated::{SimCharger, SimMeter};
use pvflow::device::{ChargeStatus, Charger, Meter, RetryPolicy, Vehicle};

fn lp_config(mode: ChargeMode, enable_seconds: u64) -> LoadpointConfig {
    LoadpointConfig {
        title: "garage".to_string(),
        mode,
        min_current: 6.0,
        max_current: 16.0,
        phases: 3,
        charger: "wallbox".to_string(),
        meter: None,
        vehicle: None,
        delays: DelaysConfig {
            enable_seconds,
            disable_seconds: 180,
            phase_switch_seconds: 60,
            wake_up_seconds: 30,
        },
        soc: SocConfig::default(),
    }
}

struct Rig {
    site: Arc<Site>,
    grid: Arc<SimMeter>,
    chargers: Vec<Arc<SimCharger>>,
}

fn rig(modes: &[ChargeMode], grid_power: f64, pv_power: f64) -> Rig {
    let grid = Arc::new(SimMeter::new(grid_power));
    let pv = Arc::new(SimMeter::new(pv_power));

    let chargers: Vec<Arc<SimCharger>> = modes
        .iter()
        .map(|_| Arc::new(SimCharger::new().with_auto_charge()))
        .collect();

    let specs = modes
        .iter()
        .zip(&chargers)
        .map(|(mode, charger)| LoadpointSpec {
            config: lp_config(*mode, 1),
            charger: charger.clone() as Arc<dyn Charger>,
            charge_meter: None,
            default_vehicle: None,
        })
        .collect();

    let site = Site::new(
        &SiteConfig::default(),
        Duration::from_secs(1),
        RetryPolicy::default(),
        SiteDevices {
            grid_meter: Some(grid.clone() as Arc<dyn Meter>),
            pv_meters: vec![pv as Arc<dyn Meter>],
            battery_meters: Vec::new(),
            tariff: None,
        },
        specs,
        Vec::<Arc<dyn Vehicle>>::new(),
        None,
        Publisher::disabled(),
    )
    .unwrap();

    Rig {
        site,
        grid,
        chargers,
    }
}

#[tokio::test(start_paused = true)]
async fn surplus_charging_comes_up_through_the_loop() {
    let rig = rig(&[ChargeMode::Pv], -5000.0, 5000.0);
    for charger in &rig.chargers {
        charger.set_status(ChargeStatus::B);
    }

    let stop = CancellationToken::new();
    let run = tokio::spawn(
        rig.site
            .clone()
            .run(stop.clone(), Duration::from_secs(1)),
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    stop.cancel();
    run.await.unwrap();

    let charger = &rig.chargers[0];
    assert!(charger.is_enabled());
    assert!(charger.current() >= 6.0 && charger.current() <= 16.0);
    assert!(rig.site.health().healthy());

    let lp = &rig.site.loadpoints()[0];
    let target = lp.target_current().await;
    assert!(target >= 6.0 && target <= 16.0);
}

#[tokio::test(start_paused = true)]
async fn round_robin_serves_all_loadpoints() {
    let rig = rig(&[ChargeMode::Now, ChargeMode::Now], 0.0, 1000.0);
    for charger in &rig.chargers {
        charger.set_status(ChargeStatus::B);
    }

    let stop = CancellationToken::new();
    let run = tokio::spawn(
        rig.site
            .clone()
            .run(stop.clone(), Duration::from_secs(1)),
    );

    tokio::time::sleep(Duration::from_secs(4)).await;
    stop.cancel();
    run.await.unwrap();

    for charger in &rig.chargers {
        assert!(charger.is_enabled());
        assert_eq!(charger.current(), 16.0);
    }
}

#[tokio::test(start_paused = true)]
async fn out_of_cycle_update_reuses_cached_readings() {
    let rig = rig(&[ChargeMode::Off], 0.0, 1000.0);
    rig.chargers[0].set_status(ChargeStatus::B);

    let stop = CancellationToken::new();
    // long interval: only the immediate first tick refreshes the meters
    let run = tokio::spawn(
        rig.site
            .clone()
            .run(stop.clone(), Duration::from_secs(3600)),
    );

    // let the first tick pass, then break the grid meter
    tokio::time::sleep(Duration::from_secs(1)).await;
    rig.grid.fail_power_reads(100);

    // the mode change triggers an out-of-cycle update which must not
    // re-poll the broken meter
    rig.site.loadpoints()[0].set_mode(ChargeMode::Now).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    stop.cancel();
    run.await.unwrap();

    assert!(rig.chargers[0].is_enabled());
    assert_eq!(rig.chargers[0].current(), 16.0);
}

#[tokio::test(start_paused = true)]
async fn grid_failure_suspends_control_but_loop_recovers() {
    let rig = rig(&[ChargeMode::Now], 0.0, 1000.0);
    rig.chargers[0].set_status(ChargeStatus::B);
    rig.grid.fail_power_reads(6);

    let stop = CancellationToken::new();
    let run = tokio::spawn(
        rig.site
            .clone()
            .run(stop.clone(), Duration::from_secs(1)),
    );

    // first ticks fail on the grid meter, later ones succeed
    tokio::time::sleep(Duration::from_secs(6)).await;
    stop.cancel();
    run.await.unwrap();

    assert!(rig.chargers[0].is_enabled());
    assert!(rig.site.health().healthy());
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_open_sessions() {
    use pvflow::core::session::{MemoryStore, SessionStore};

    let grid = Arc::new(SimMeter::new(0.0));
    let charger = Arc::new(SimCharger::new().with_auto_charge());
    let store = Arc::new(MemoryStore::new());

    let site = Site::new(
        &SiteConfig::default(),
        Duration::from_secs(1),
        RetryPolicy::default(),
        SiteDevices {
            grid_meter: Some(grid as Arc<dyn Meter>),
            pv_meters: Vec::new(),
            battery_meters: Vec::new(),
            tariff: None,
        },
        vec![LoadpointSpec {
            config: lp_config(ChargeMode::Now, 1),
            charger: charger.clone() as Arc<dyn Charger>,
            charge_meter: None,
            default_vehicle: None,
        }],
        Vec::<Arc<dyn Vehicle>>::new(),
        Some(store.clone() as Arc<dyn SessionStore>),
        Publisher::disabled(),
    )
    .unwrap();

    charger.set_status(ChargeStatus::B);

    let stop = CancellationToken::new();
    let run = tokio::spawn(site.clone().run(stop.clone(), Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_secs(3)).await;
    stop.cancel();
    run.await.unwrap();

    // charging was active, the session is still open
    site.shutdown().await;

    let sessions = store.sessions();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].finished_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn assembles_from_configuration() {
    let toml = r#"
        [site]
        title = "test home"
        [site.meters]
        grid = "grid"
        pv = "roof"

        [[meters]]
        name = "grid"
        power = -3000.0

        [[meters]]
        name = "roof"
        power = 3000.0

        [[chargers]]
        name = "wallbox"

        [[loadpoints]]
        title = "garage"
        charger = "wallbox"
        mode = "now"
    "#;

    let cfg: Config = toml::from_str(toml).unwrap();
    let (site, mut ui_rx) = pvflow::factory::assemble_site(&cfg).await.unwrap();

    let stop = CancellationToken::new();
    let run = tokio::spawn(site.clone().run(stop.clone(), Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_secs(2)).await;
    stop.cancel();
    run.await.unwrap();

    // the publish stream saw the prepared site keys
    let mut keys = Vec::new();
    while let Ok(param) = ui_rx.try_recv() {
        keys.push(param.key);
    }
    assert!(keys.iter().any(|k| k == "siteTitle"));
    assert!(keys.iter().any(|k| k == "gridConfigured"));
    assert!(keys.iter().any(|k| k == "gridPower"));
    assert!(keys.iter().any(|k| k == "homePower"));
}
