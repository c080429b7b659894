//! ELM327 command definitions

use crate::frame::PidAddress;
use std::fmt;

/// How a command's response is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Response text is returned to the caller as-is
    Raw,
    /// Response must contain `OK`
    Confirmation,
}

/// A single line sent to the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    description: String,
    expect: Expect,
}

impl Command {
    /// Command whose response is returned verbatim
    pub fn raw(text: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            description: description.into(),
            expect: Expect::Raw,
        }
    }

    /// Setup command that must be acknowledged with `OK`
    pub fn confirmed(text: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            description: description.into(),
            expect: Expect::Confirmation,
        }
    }

    /// `ATZ`
    pub fn reset() -> Self {
        Self::raw("ATZ", "reset adapter")
    }

    /// `ATE0`
    pub fn echo_off() -> Self {
        Self::confirmed("ATE0", "disable echo")
    }

    /// `ATL0`
    pub fn linefeeds_off() -> Self {
        Self::confirmed("ATL0", "disable linefeed")
    }

    /// `ATH0`
    pub fn headers_off() -> Self {
        Self::confirmed("ATH0", "disable headers")
    }

    /// `ATST<hh>`: adapter-side response timeout in units of 4 ms
    pub fn set_timeout(code: u8) -> Self {
        Self::confirmed(format!("ATST{:02X}", code), "set timeout")
    }

    /// Mode/PID data query, e.g. `010C`
    pub fn query(address: PidAddress) -> Self {
        Self::raw(address.command_text(), format!("query {}", address))
    }

    /// Text sent on the wire, without the terminator
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Human-readable purpose, used in error messages
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Response expectation
    pub fn expect(&self) -> Expect {
        self.expect
    }

    /// Wire bytes including the carriage-return terminator
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.text.len() + 1);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes.push(b'\r');
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(Command::echo_off().to_wire(), b"ATE0\r");
        assert_eq!(Command::raw(" 0100 ", "probe").to_wire(), b"0100\r");
    }

    #[test]
    fn test_set_timeout_is_two_hex_digits() {
        assert_eq!(Command::set_timeout(0x0A).text(), "ATST0A");
        assert_eq!(Command::set_timeout(0x32).text(), "ATST32");
        assert_eq!(Command::set_timeout(0x32).expect(), Expect::Confirmation);
    }

    #[test]
    fn test_query_text() {
        let cmd = Command::query(PidAddress::new(0x01, 0x0C));
        assert_eq!(cmd.text(), "010C");
        assert_eq!(cmd.expect(), Expect::Raw);
    }
}
