//! Adapter session and initialization sequence
//!
//! A session owns the command channel, the parameter registry, and what was
//! learned while bringing the adapter up: its identification banner, the
//! vehicle identifier query result, and the calibrated response timeout.

use crate::channel::CommandChannel;
use crate::command::Command;
use crate::error::ObdError;
use crate::registry::ParameterRegistry;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// ELM327 `ATST` counts in units of 4 ms
pub const TIMEOUT_UNIT_MS: u64 = 4;

/// Session initialization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pause after reset before discarding leftover banner bytes
    pub settle_delay_ms: u64,
    /// `ATST` values to try, smallest first
    pub timeout_candidates: Vec<u8>,
    /// Probe command issued after each `ATST`
    pub probe_command: String,
    /// Number of probes that must succeed for a candidate to be adopted
    pub probe_count: usize,
    /// Query whose answer identifies the vehicle for this session
    pub id_command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 200,
            timeout_candidates: vec![0x0A, 0x14, 0x1E, 0x28, 0x32],
            probe_command: "0100".to_string(),
            probe_count: 3,
            id_command: "010D".to_string(),
        }
    }
}

/// Connection to one adapter over one transport
pub struct Session<T> {
    channel: Arc<CommandChannel<T>>,
    registry: ParameterRegistry,
    config: SessionConfig,
    adapter_id: String,
    vehicle_id: String,
    timeout_code: Option<u8>,
}

impl<T: Transport> Session<T> {
    /// Create a session with the standard parameter registry
    pub fn new(io: T, config: SessionConfig) -> Self {
        Self::with_registry(io, config, ParameterRegistry::standard())
    }

    pub fn with_registry(io: T, config: SessionConfig, registry: ParameterRegistry) -> Self {
        Self {
            channel: Arc::new(CommandChannel::new(io)),
            registry,
            config,
            adapter_id: "Unknown".to_string(),
            vehicle_id: "Unknown".to_string(),
            timeout_code: None,
        }
    }

    /// Reset and configure the adapter, then calibrate its response timeout
    pub async fn initialize(&mut self) -> Result<(), ObdError> {
        info!("Initializing OBD adapter");

        self.adapter_id = self.channel.submit(&Command::reset()).await?;
        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
        self.channel.discard_pending().await?;

        for command in [Command::echo_off(), Command::linefeeds_off(), Command::headers_off()] {
            self.channel.submit(&command).await?;
        }

        let id_query = Command::raw(self.config.id_command.as_str(), "identify vehicle");
        self.vehicle_id = self.channel.submit(&id_query).await?;
        info!("id: {}", self.vehicle_id);

        let code = self.calibrate().await?;
        self.timeout_code = Some(code);
        info!("OBD adapter initialized successfully");
        Ok(())
    }

    /// Find the smallest adapter timeout that answers every probe
    async fn calibrate(&self) -> Result<u8, ObdError> {
        let probe = Command::raw(self.config.probe_command.as_str(), "probe");
        let mut tried = Vec::with_capacity(self.config.timeout_candidates.len());

        for &code in &self.config.timeout_candidates {
            tried.push(format!("{:02X}", code));
            match self.try_timeout(code, &probe).await {
                Ok(()) => {
                    info!("timeout set to {:02X}", code);
                    return Ok(code);
                }
                // A dead link fails every candidate the same way
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("timeout {:02X} failed, trying next: {}", code, e),
            }
        }

        Err(ObdError::Calibration { tried })
    }

    async fn try_timeout(&self, code: u8, probe: &Command) -> Result<(), ObdError> {
        self.channel.submit(&Command::set_timeout(code)).await?;
        for _ in 0..self.config.probe_count {
            self.channel.submit(probe).await?;
        }
        Ok(())
    }

    /// Shared handle to the command channel
    pub fn channel(&self) -> Arc<CommandChannel<T>> {
        Arc::clone(&self.channel)
    }

    /// Close the transport; an exchange in flight through a shared channel
    /// handle fails as a transport error
    pub async fn close(&self) -> Result<(), ObdError> {
        self.channel.close().await
    }
}

impl<T> Session<T> {
    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Channel and registry together, for refreshing values
    pub fn parts_mut(&mut self) -> (&CommandChannel<T>, &mut ParameterRegistry) {
        (&self.channel, &mut self.registry)
    }

    /// Identification banner returned by the reset command
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    /// Answer to the identification query
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Calibrated `ATST` value, once initialized
    pub fn timeout_code(&self) -> Option<u8> {
        self.timeout_code
    }

    /// Calibrated adapter-side response timeout
    pub fn adapter_timeout(&self) -> Option<Duration> {
        self.timeout_code
            .map(|code| Duration::from_millis(u64::from(code) * TIMEOUT_UNIT_MS))
    }
}
