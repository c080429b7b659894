//! OBD-II Protocol Implementation
//!
//! This crate talks to ELM327-compatible OBD-II adapters over any async byte
//! stream: it frames prompt-terminated responses, classifies adapter error
//! text, serializes command exchanges, initializes and calibrates the adapter,
//! and keeps an ordered table of decoded and computed parameters.

mod channel;
mod command;
mod error;
mod frame;
mod framer;
pub mod mock;
mod pid;
mod registry;
mod session;
mod transport;

pub use channel::CommandChannel;
pub use command::{Command, Expect};
pub use error::{ObdError, ProtocolError};
pub use frame::{find_frame, PidAddress, RawFrame};
pub use framer::{classify, ResponseFramer};
pub use pid::{compute_fuel_economy, Pid};
pub use registry::{ComputeFn, DecodeFn, ParameterDescriptor, ParameterRegistry, Reading, Refresh};
pub use session::{Session, SessionConfig};
pub use transport::{discard_buffered, open_serial, DynTransport, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
}
