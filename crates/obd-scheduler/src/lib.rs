//! OBD-II Polling Engine
//!
//! Sweeps a session's parameter registry in order, refreshing queried
//! parameters through the adapter and computed ones from held values, and
//! hands each sweep's readings to a consumer task.

mod poller;

pub use poller::{ComputePolicy, PollerConfig, PollingEngine, SweepSnapshot};
