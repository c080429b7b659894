//! Registry Sweep Implementation

use obd_protocol::{Command, ObdError, Reading, Refresh, Session, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which values computed parameters read during a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePolicy {
    /// All computed parameters read the values held when the sweep started
    #[default]
    PriorSweep,
    /// Computed parameters read whatever is held when their turn comes, so
    /// inputs earlier in the registry are this sweep's and later ones are
    /// the previous sweep's
    InOrder,
}

/// Configuration for the polling engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Pause between the end of one sweep and the start of the next
    pub sweep_interval_ms: u64,
    /// Inputs used by computed parameters
    pub compute_policy: ComputePolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 250,
            compute_policy: ComputePolicy::PriorSweep,
        }
    }
}

/// Readings produced by one sweep, in registry order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSnapshot {
    /// Sweep counter, starting at 1
    pub sweep: u64,
    /// Completion time (Unix ms)
    pub timestamp_ms: u64,
    pub readings: Vec<Reading>,
}

impl SweepSnapshot {
    /// Reading for the parameter called `name`
    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.readings.iter().find(|r| r.name == name)
    }

    /// Parameters that kept an old value in this sweep
    pub fn stale(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter().filter(|r| !r.fresh)
    }
}

/// Drives sweeps over a session's parameter registry
pub struct PollingEngine {
    config: PollerConfig,
    sweeps: u64,
}

impl PollingEngine {
    /// Create a new polling engine
    pub fn new(config: PollerConfig) -> Self {
        info!("Polling engine created with {:?}", config);
        Self { config, sweeps: 0 }
    }

    /// Number of completed sweeps
    pub fn sweep_count(&self) -> u64 {
        self.sweeps
    }

    /// Refresh every parameter once, in registry order
    ///
    /// A parameter that fails to refresh keeps its previous value and the
    /// sweep moves on. Transport failures end the sweep with an error.
    pub async fn sweep<T: Transport>(&mut self, session: &mut Session<T>) -> Result<SweepSnapshot, ObdError> {
        let (channel, registry) = session.parts_mut();
        let prior = match self.config.compute_policy {
            ComputePolicy::PriorSweep => Some(registry.clone()),
            ComputePolicy::InOrder => None,
        };
        let mut fresh = vec![false; registry.len()];

        for index in 0..registry.len() {
            let Some(descriptor) = registry.get(index) else {
                continue;
            };
            let name = descriptor.name().to_string();

            let outcome = match descriptor.refresh() {
                Refresh::Decode { address, .. } => match channel.submit(&Command::query(address)).await {
                    Ok(response) => {
                        debug!("{}: {} [{}]", name, address.command_text(), response);
                        registry.refresh_from_response(index, &response)
                    }
                    Err(e) => Err(e),
                },
                Refresh::Compute { .. } => registry.refresh_computed(index, prior.as_ref()),
            };

            match outcome {
                Ok(value) => fresh[index] = value.is_finite(),
                Err(e) if e.is_fatal() => {
                    error!("Sweep aborted at {}: {}", name, e);
                    return Err(e);
                }
                Err(e) => warn!("{}: could not refresh: {}", name, e),
            }
        }

        self.sweeps += 1;
        let mut readings = registry.readings();
        for (reading, fresh) in readings.iter_mut().zip(fresh) {
            reading.fresh = fresh;
        }

        Ok(SweepSnapshot {
            sweep: self.sweeps,
            timestamp_ms: now_ms(),
            readings,
        })
    }

    /// Sweep repeatedly, handing each snapshot to `snapshot_tx`
    ///
    /// Returns `Ok` once the receiving side is gone, or the first
    /// session-fatal error. Snapshots are dropped while the consumer lags.
    pub async fn run<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        snapshot_tx: mpsc::Sender<SweepSnapshot>,
    ) -> Result<(), ObdError> {
        info!("Starting polling engine");
        let interval = Duration::from_millis(self.config.sweep_interval_ms);

        while !snapshot_tx.is_closed() {
            let snapshot = self.sweep(session).await?;
            match snapshot_tx.try_send(snapshot) {
                Ok(()) => {}
                Err(TrySendError::Full(snapshot)) => {
                    debug!("Consumer busy, dropping sweep {}", snapshot.sweep);
                }
                Err(TrySendError::Closed(_)) => break,
            }
            tokio::time::sleep(interval).await;
        }

        info!("Polling engine stopped after {} sweeps", self.sweeps);
        Ok(())
    }

    /// Run on a dedicated task; the session comes back with the outcome so
    /// the owner can tear it down
    pub fn spawn<T: Transport + 'static>(
        mut self,
        mut session: Session<T>,
        snapshot_tx: mpsc::Sender<SweepSnapshot>,
    ) -> JoinHandle<(Session<T>, Result<(), ObdError>)> {
        tokio::spawn(async move {
            let result = self.run(&mut session, snapshot_tx).await;
            (session, result)
        })
    }
}

impl Default for PollingEngine {
    fn default() -> Self {
        Self::new(PollerConfig::default())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
