//! OBD-II Live Monitor
//!
//! Connects to an ELM327 adapter (or the built-in emulator), brings it up,
//! and prints every parameter after each sweep. Lost connections are
//! re-established after a fixed delay.

use anyhow::{Context, Result};
use obd_protocol::mock::MockAdapter;
use obd_protocol::{open_serial, DynTransport, Reading, Session, SessionConfig};
use obd_scheduler::{PollerConfig, PollingEngine, SweepSnapshot};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Snapshots buffered between the poller and the printer
const SNAPSHOT_BUFFER: usize = 8;

/// How snapshots are written to stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One `name: value unit` line per parameter
    #[default]
    Text,
    /// One JSON object per sweep
    Json,
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial device the adapter is attached to
    pub device: String,
    pub baud_rate: u32,
    /// Talk to the built-in emulator instead of `device`
    pub mock: bool,
    /// Pause before reconnecting after a session fails
    pub reconnect_delay_ms: u64,
    pub log_level: String,
    pub json_logs: bool,
    pub output: OutputFormat,
    pub session: SessionConfig,
    pub poller: PollerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            mock: false,
            reconnect_delay_ms: 1000,
            log_level: "info".to_string(),
            json_logs: false,
            output: OutputFormat::Text,
            session: SessionConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `obd-monitor.{toml,yaml,json}` if present, then `OBD_*`
    /// environment variables (`OBD_POLLER__SWEEP_INTERVAL_MS=500`)
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("obd-monitor")
    }

    pub fn load_from(name: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(
                config::Environment::with_prefix("OBD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}

/// Initialize logging
pub fn init_logging(config: &AppConfig) -> Result<()> {
    let level: Level = config
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    if config.json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("Failed to set tracing subscriber")
}

/// Open the configured link to the adapter
pub fn connect(config: &AppConfig) -> Result<DynTransport> {
    if config.mock {
        info!("Using emulated adapter");
        let (io, _handle) = MockAdapter::new().spawn();
        return Ok(Box::new(io));
    }
    open_serial(&config.device, config.baud_rate).with_context(|| format!("opening {}", config.device))
}

/// Render one reading as a display line
pub fn format_reading(reading: &Reading) -> String {
    let line = format!("{}: {:.2} {}", reading.name, reading.value, reading.unit);
    if reading.fresh {
        line
    } else {
        format!("{} (stale)", line)
    }
}

/// Render a snapshot in the requested format
pub fn format_snapshot(snapshot: &SweepSnapshot, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(snapshot
            .readings
            .iter()
            .map(format_reading)
            .collect::<Vec<_>>()
            .join("\n")),
        OutputFormat::Json => serde_json::to_string(snapshot).context("encoding snapshot"),
    }
}

async fn print_snapshots(mut rx: mpsc::Receiver<SweepSnapshot>, format: OutputFormat) {
    while let Some(snapshot) = rx.recv().await {
        match format_snapshot(&snapshot, format) {
            Ok(text) => println!("{}", text),
            Err(e) => warn!("Dropping sweep {}: {:#}", snapshot.sweep, e),
        }
    }
}

/// Bring up one session and poll it until it fails or the printer stops
pub async fn run_session(config: &AppConfig) -> Result<()> {
    let io = connect(config)?;
    let mut session = Session::new(io, config.session.clone());
    session.initialize().await.context("initializing adapter")?;
    info!(
        "Connected to {} (vehicle {}), adapter timeout {:?}",
        session.adapter_id(),
        session.vehicle_id(),
        session.adapter_timeout()
    );

    let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
    let printer = tokio::spawn(print_snapshots(rx, config.output));

    let mut engine = PollingEngine::new(config.poller.clone());
    let result = engine.run(&mut session, tx).await;

    if let Err(e) = session.close().await {
        warn!("Closing adapter link: {}", e);
    }
    if printer.await.is_err() {
        warn!("Snapshot printer panicked");
    }
    result.context("polling adapter")
}

/// Run sessions back to back until interrupted
pub async fn run(config: AppConfig) -> Result<()> {
    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);

    loop {
        tokio::select! {
            result = run_session(&config) => match result {
                Ok(()) => {
                    info!("Snapshot consumer closed, stopping");
                    return Ok(());
                }
                Err(e) => error!("Session ended: {:#}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                return Ok(());
            }
        }

        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_scheduler::ComputePolicy;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert_eq!(config.poller.sweep_interval_ms, 250);
        assert_eq!(config.poller.compute_policy, ComputePolicy::PriorSweep);
        assert_eq!(config.session.timeout_candidates, [0x0A, 0x14, 0x1E, 0x28, 0x32]);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            device = "/dev/rfcomm0"
            mock = true
            output = "json"

            [poller]
            compute_policy = "in_order"

            [session]
            probe_count = 5
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.device, "/dev/rfcomm0");
        assert!(config.mock);
        assert_eq!(config.output, OutputFormat::Json);
        assert_eq!(config.poller.compute_policy, ComputePolicy::InOrder);
        assert_eq!(config.poller.sweep_interval_ms, 250);
        assert_eq!(config.session.probe_count, 5);
        assert_eq!(config.session.probe_command, "0100");
        assert_eq!(config.baud_rate, 38400);
    }

    #[test]
    fn test_format_reading() {
        let reading = Reading {
            name: "RPM".to_string(),
            unit: "rpm".to_string(),
            value: 1726.0,
            fresh: true,
        };
        assert_eq!(format_reading(&reading), "RPM: 1726.00 rpm");

        let stale = Reading { fresh: false, ..reading };
        assert_eq!(format_reading(&stale), "RPM: 1726.00 rpm (stale)");
    }

    #[tokio::test]
    async fn test_mock_session_produces_snapshots() {
        let config = AppConfig {
            mock: true,
            session: SessionConfig {
                settle_delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut session = Session::new(connect(&config).unwrap(), config.session.clone());
        session.initialize().await.unwrap();

        let mut engine = PollingEngine::new(config.poller.clone());
        let snapshot = engine.sweep(&mut session).await.unwrap();

        let text = format_snapshot(&snapshot, OutputFormat::Text).unwrap();
        assert!(text.starts_with("RPM: 1726.00 rpm\nSpeed: 40.00 km/h\n"));

        let json: serde_json::Value =
            serde_json::from_str(&format_snapshot(&snapshot, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["sweep"], 1);
        assert_eq!(json["readings"][0]["name"], "RPM");
    }
}
