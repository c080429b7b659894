//! OBD-II Live Monitor - Main Entry Point

use anyhow::Context;
use obd_monitor::{init_logging, run, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    init_logging(&config)?;

    info!("=== OBD-II Monitor v{} ===", env!("CARGO_PKG_VERSION"));
    if config.mock {
        info!("Mock mode enabled");
    } else {
        info!("Adapter on {} at {} baud", config.device, config.baud_rate);
    }

    run(config).await
}
