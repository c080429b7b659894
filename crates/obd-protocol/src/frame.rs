//! Response frame parsing

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bit set in the first response byte to mark a positive reply
pub const RESPONSE_MODE_FLAG: u8 = 0x40;

/// Mode/PID pair addressing one vehicle parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PidAddress {
    pub mode: u8,
    pub pid: u8,
}

impl PidAddress {
    pub const fn new(mode: u8, pid: u8) -> Self {
        Self { mode, pid }
    }

    /// Four hex digits sent to the adapter, e.g. `010C`
    pub fn command_text(&self) -> String {
        format!("{:02X}{:02X}", self.mode, self.pid)
    }
}

impl fmt::Display for PidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}/{:02X}", self.mode, self.pid)
    }
}

/// One response line decoded into bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Vec<u8>,
}

impl RawFrame {
    /// Parse a line of hex byte pairs. Spaces between pairs are optional.
    pub fn parse(line: &str) -> Result<Self, ObdError> {
        let digits: Vec<u8> = line.bytes().filter(|b| *b != b' ').collect();
        if digits.is_empty() {
            return Err(ObdError::Framing("empty line".to_string()));
        }
        if digits.len() % 2 != 0 {
            return Err(ObdError::Framing(format!("odd number of hex digits in [{}]", line)));
        }

        let bytes = digits
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or_else(|| ObdError::Framing(format!("invalid hex byte in [{}]", line)))
            })
            .collect::<Result<Vec<u8>, ObdError>>()?;

        Ok(Self { bytes })
    }

    /// All bytes of the line, including mode and PID
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether this line is the positive reply to `address`
    pub fn answers(&self, address: PidAddress) -> bool {
        self.bytes.len() >= 2
            && self.bytes[0] == address.mode | RESPONSE_MODE_FLAG
            && self.bytes[1] == address.pid
    }
}

/// Find the frame answering `address` in a cleaned multi-line response
///
/// Lines that do not parse are skipped; some adapters interleave status text
/// with data. Fails with a framing error when no line matches.
pub fn find_frame(response: &str, address: PidAddress) -> Result<RawFrame, ObdError> {
    let mut last_error = None;

    for line in response.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
        match RawFrame::parse(line) {
            Ok(frame) if frame.answers(address) => return Ok(frame),
            Ok(_) => {}
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(ObdError::Framing(reason)) => {
            ObdError::Framing(format!("no reply to {} ({})", address, reason))
        }
        _ => ObdError::Framing(format!("no reply to {} in [{}]", address, response)),
    })
}
