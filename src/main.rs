use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use pvflow::{config::Config, factory, server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let cfg = Config::load()?;
    let (site, mut ui_rx) = factory::assemble_site(&cfg).await?;
    site.dump_config();

    let stop = CancellationToken::new();

    // drain the publish stream; UI transports attach here
    tokio::spawn(async move {
        while let Some(param) = ui_rx.recv().await {
            trace!(loadpoint = ?param.loadpoint, key = %param.key, val = %param.val, "publish");
        }
    });

    let health_server = tokio::spawn(server::health::serve(
        cfg.health.socket_path(),
        site.health(),
        stop.clone(),
    ));

    let run = tokio::spawn(site.clone().run(stop.clone(), cfg.controller.interval()));

    telemetry::shutdown_signal().await;
    stop.cancel();

    let _ = run.await;
    site.shutdown().await;
    if let Err(err) = health_server.await? {
        warn!(error = %err, "health listener");
    }

    warn!("shutdown complete");
    Ok(())
}
