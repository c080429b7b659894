//! OBD-II PID Definitions and Decoding Formulas
//!
//! Decoders take the whole matched frame (`41 0C A B`), so payload byte `A`
//! sits at index 2.

use crate::error::ObdError;
use crate::frame::PidAddress;
use crate::mode;
use crate::registry::ParameterRegistry;
use serde::{Deserialize, Serialize};

/// Mode 01 PIDs polled by the standard registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Timing advance (0x0E)
    TimingAdvance = 0x0E,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Run time since engine start (0x1F)
    RunTime = 0x1F,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Mode 01 address of this PID
    pub fn address(&self) -> PidAddress {
        PidAddress::new(mode::CURRENT_DATA, self.as_hex())
    }

    /// Decoder for this PID's response frame
    pub fn decoder(&self) -> fn(&[u8]) -> Result<f64, ObdError> {
        match self {
            Pid::Rpm => decode_rpm,
            Pid::Speed => decode_speed,
            Pid::EngineLoad | Pid::ThrottlePosition => decode_percent,
            Pid::Maf => decode_maf,
            Pid::TimingAdvance => decode_timing_advance,
            Pid::CoolantTemp => decode_temperature,
            Pid::RunTime => decode_run_time,
        }
    }
}

fn payload(frame: &[u8], count: usize) -> Result<&[u8], ObdError> {
    frame
        .get(2..2 + count)
        .ok_or_else(|| ObdError::Framing(format!("expected {} data bytes, frame has {}", count, frame.len().saturating_sub(2))))
}

fn word(frame: &[u8]) -> Result<f64, ObdError> {
    let data = payload(frame, 2)?;
    Ok(f64::from(u16::from(data[0]) << 8 | u16::from(data[1])))
}

/// RPM: ((A*256)+B)/4
pub fn decode_rpm(frame: &[u8]) -> Result<f64, ObdError> {
    Ok(word(frame)? / 4.0)
}

/// Speed: A (km/h)
pub fn decode_speed(frame: &[u8]) -> Result<f64, ObdError> {
    Ok(f64::from(payload(frame, 1)?[0]))
}

/// Engine load and throttle position: A * 100 / 255 (%)
pub fn decode_percent(frame: &[u8]) -> Result<f64, ObdError> {
    Ok(f64::from(payload(frame, 1)?[0]) * 100.0 / 255.0)
}

/// MAF: ((A*256)+B)/4 (g/s)
pub fn decode_maf(frame: &[u8]) -> Result<f64, ObdError> {
    Ok(word(frame)? / 4.0)
}

/// Timing advance: A/2 - 64 (degrees before TDC)
pub fn decode_timing_advance(frame: &[u8]) -> Result<f64, ObdError> {
    Ok(f64::from(payload(frame, 1)?[0]) / 2.0 - 64.0)
}

/// Temperature: A - 40 (°C)
pub fn decode_temperature(frame: &[u8]) -> Result<f64, ObdError> {
    Ok(f64::from(payload(frame, 1)?[0]) - 40.0)
}

/// Run time: (A*256)+B (seconds)
pub fn decode_run_time(frame: &[u8]) -> Result<f64, ObdError> {
    word(frame)
}

/// Inputs read by [`compute_fuel_economy`]
pub const FUEL_ECONOMY_INPUTS: &[PidAddress] = &[
    PidAddress::new(mode::CURRENT_DATA, Pid::Speed as u8),
    PidAddress::new(mode::CURRENT_DATA, Pid::Maf as u8),
];

/// Instantaneous fuel economy in miles per gallon from speed and MAF
///
/// Stoichiometric ratio 14.7, gasoline density 6.17 lb/gal, 4.54 g/lb·100,
/// 0.621371 mi/km.
pub fn compute_fuel_economy(values: &ParameterRegistry) -> Result<f64, ObdError> {
    let input = |pid: Pid| {
        values.value(pid.address()).ok_or_else(|| ObdError::Compute {
            name: "Miles per Gallon".to_string(),
            reason: format!("{:?} is not registered", pid),
        })
    };
    let vss = input(Pid::Speed)?;
    let maf = input(Pid::Maf)?;

    if maf <= 0.0 {
        return Err(ObdError::Compute {
            name: "Miles per Gallon".to_string(),
            reason: format!("MAF rate is {}", maf),
        });
    }

    Ok((14.7 * 6.17 * 4.54 * vss * 0.621371) / (3600.0 * maf / 100.0))
}
