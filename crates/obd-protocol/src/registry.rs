//! Ordered parameter table with last known values

use crate::error::ObdError;
use crate::frame::{find_frame, PidAddress};
use crate::pid::{self, Pid};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Decodes a matched response frame into a value
pub type DecodeFn = fn(&[u8]) -> Result<f64, ObdError>;

/// Derives a value from other parameters' values
pub type ComputeFn = fn(&ParameterRegistry) -> Result<f64, ObdError>;

/// How a parameter gets a new value
#[derive(Debug, Clone, Copy)]
pub enum Refresh {
    /// Query the adapter at `address` and decode the matching frame
    Decode { address: PidAddress, decode: DecodeFn },
    /// Combine the values of `inputs`; nothing is sent
    Compute {
        inputs: &'static [PidAddress],
        compute: ComputeFn,
    },
}

/// One named parameter and its last successfully refreshed value
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    name: String,
    unit: String,
    refresh: Refresh,
    last_value: f64,
}

impl ParameterDescriptor {
    /// Parameter refreshed by querying the adapter
    pub fn decoded(name: impl Into<String>, unit: impl Into<String>, address: PidAddress, decode: DecodeFn) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            refresh: Refresh::Decode { address, decode },
            last_value: 0.0,
        }
    }

    /// Parameter computed from other registered parameters
    pub fn computed(
        name: impl Into<String>,
        unit: impl Into<String>,
        inputs: &'static [PidAddress],
        compute: ComputeFn,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            refresh: Refresh::Compute { inputs, compute },
            last_value: 0.0,
        }
    }

    fn standard(name: &str, unit: &str, pid: Pid) -> Self {
        Self::decoded(name, unit, pid.address(), pid.decoder())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn refresh(&self) -> Refresh {
        self.refresh
    }

    /// Address queried for this parameter, if it is command-bearing
    pub fn address(&self) -> Option<PidAddress> {
        match self.refresh {
            Refresh::Decode { address, .. } => Some(address),
            Refresh::Compute { .. } => None,
        }
    }

    pub fn has_command(&self) -> bool {
        self.address().is_some()
    }

    pub fn last_value(&self) -> f64 {
        self.last_value
    }
}

/// A parameter value as handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub name: String,
    pub unit: String,
    pub value: f64,
    /// Whether the value was refreshed by the sweep that produced it
    pub fresh: bool,
}

/// Ordered set of parameters; order is both display and refresh order
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    descriptors: Vec<ParameterDescriptor>,
}

impl ParameterRegistry {
    /// Build a registry, checking that queried addresses are unique and that
    /// computed parameters only read registered addresses
    pub fn new(descriptors: Vec<ParameterDescriptor>) -> Result<Self, ObdError> {
        let mut addresses = HashSet::new();
        for descriptor in &descriptors {
            if let Some(address) = descriptor.address() {
                if !addresses.insert(address) {
                    return Err(ObdError::InvalidRegistry(format!(
                        "{} is registered more than once",
                        address
                    )));
                }
            }
        }

        for descriptor in &descriptors {
            if let Refresh::Compute { inputs, .. } = descriptor.refresh {
                if let Some(missing) = inputs.iter().find(|a| !addresses.contains(*a)) {
                    return Err(ObdError::InvalidRegistry(format!(
                        "{} reads unregistered {}",
                        descriptor.name, missing
                    )));
                }
            }
        }

        Ok(Self { descriptors })
    }

    /// The built-in parameter set
    pub fn standard() -> Self {
        Self {
            descriptors: vec![
                ParameterDescriptor::standard("RPM", "rpm", Pid::Rpm),
                ParameterDescriptor::standard("Speed", "km/h", Pid::Speed),
                ParameterDescriptor::computed(
                    "Miles per Gallon",
                    "mpg",
                    pid::FUEL_ECONOMY_INPUTS,
                    pid::compute_fuel_economy,
                ),
                ParameterDescriptor::standard("Engine Load", "%", Pid::EngineLoad),
                ParameterDescriptor::standard("MAF rate", "g/s", Pid::Maf),
                ParameterDescriptor::standard("Timing advance", "°", Pid::TimingAdvance),
                ParameterDescriptor::standard("Temperature", "°C", Pid::CoolantTemp),
                ParameterDescriptor::standard("Throttle", "%", Pid::ThrottlePosition),
                ParameterDescriptor::standard("Run Time", "seconds", Pid::RunTime),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ParameterDescriptor> {
        self.descriptors.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.descriptors.iter()
    }

    /// Descriptor queried at `address`
    pub fn find(&self, address: PidAddress) -> Option<&ParameterDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.address() == Some(address))
    }

    /// Last value of the parameter queried at `address`
    pub fn value(&self, address: PidAddress) -> Option<f64> {
        self.find(address).map(ParameterDescriptor::last_value)
    }

    /// Decode an adapter response for the parameter at `index`
    ///
    /// The value is only replaced when a matching frame decodes cleanly.
    pub fn refresh_from_response(&mut self, index: usize, response: &str) -> Result<f64, ObdError> {
        let descriptor = self.slot(index)?;
        let Refresh::Decode { address, decode } = descriptor.refresh else {
            return Err(ObdError::InvalidRegistry(format!("{} has no command", descriptor.name)));
        };

        let frame = find_frame(response, address)?;
        let value = decode(frame.bytes())?;
        self.descriptors[index].last_value = value;
        Ok(value)
    }

    /// Recompute the parameter at `index` from the values in `source`
    ///
    /// `source` may be this registry or an earlier copy of it. Non-finite
    /// results leave the old value in place.
    pub fn refresh_computed(&mut self, index: usize, source: Option<&ParameterRegistry>) -> Result<f64, ObdError> {
        let descriptor = self.slot(index)?;
        let Refresh::Compute { compute, .. } = descriptor.refresh else {
            return Err(ObdError::InvalidRegistry(format!("{} is not computed", descriptor.name)));
        };

        let value = compute(source.unwrap_or(&*self))?;
        if !value.is_finite() {
            return Err(ObdError::Compute {
                name: descriptor.name.clone(),
                reason: format!("result is {}", value),
            });
        }
        self.descriptors[index].last_value = value;
        Ok(value)
    }

    /// Current values in registry order
    pub fn readings(&self) -> Vec<Reading> {
        self.descriptors
            .iter()
            .map(|d| Reading {
                name: d.name.clone(),
                unit: d.unit.clone(),
                value: d.last_value,
                fresh: false,
            })
            .collect()
    }

    fn slot(&self, index: usize) -> Result<&ParameterDescriptor, ObdError> {
        self.descriptors
            .get(index)
            .ok_or_else(|| ObdError::InvalidRegistry(format!("no parameter at index {}", index)))
    }
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
