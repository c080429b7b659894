//! OBD-II Error Types

use thiserror::Error;

/// Conditions reported by the adapter as text in place of data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Adapter did not understand the command (`?`)
    #[error("Did not understand")]
    UnrecognizedCommand,

    /// Bus was busy (`BUS BUSY`)
    #[error("Bus busy")]
    BusBusy,

    /// Bus feedback error (`FB ERROR`)
    #[error("Feedback error")]
    FeedbackError,

    /// Corrupt reply from the vehicle (`DATA ERROR`)
    #[error("Data error")]
    DataError,

    /// Vehicle did not answer the query (`NO DATA`)
    #[error("No data")]
    NoData,

    /// Adapter could not reach the ECU (`UNABLE TO CONNECT`)
    #[error("Unable to connect to ECU")]
    UnableToConnect,
}

impl ProtocolError {
    /// Error tokens in the order they are checked. The first match wins.
    pub const SCAN_ORDER: [ProtocolError; 6] = [
        ProtocolError::UnrecognizedCommand,
        ProtocolError::BusBusy,
        ProtocolError::FeedbackError,
        ProtocolError::DataError,
        ProtocolError::NoData,
        ProtocolError::UnableToConnect,
    ];

    /// Text the adapter prints for this condition
    pub fn token(&self) -> &'static str {
        match self {
            ProtocolError::UnrecognizedCommand => "?",
            ProtocolError::BusBusy => "BUS BUSY",
            ProtocolError::FeedbackError => "FB ERROR",
            ProtocolError::DataError => "DATA ERROR",
            ProtocolError::NoData => "NO DATA",
            ProtocolError::UnableToConnect => "UNABLE TO CONNECT",
        }
    }

    /// Find the first known error token contained in `response`
    pub fn scan(response: &str) -> Option<ProtocolError> {
        Self::SCAN_ORDER
            .into_iter()
            .find(|condition| response.contains(condition.token()))
    }
}

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// I/O failure on the byte stream, or the peer closed it
    #[error("Transport error: {0}")]
    Transport(String),

    /// Link reported that the adapter never answered
    #[error("Timed out. Received [{received}]")]
    Timeout { received: String },

    /// Adapter reported an error condition instead of data
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Response could not be parsed into the expected frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// A setup step did not report success
    #[error("Unable to {step} [{response}]")]
    Initialization { step: String, response: String },

    /// No timeout candidate produced reliable responses
    #[error("Unable to set any timeout (tried {})", .tried.join(", "))]
    Calibration { tried: Vec<String> },

    /// Parameter table violates a registry invariant
    #[error("Invalid parameter registry: {0}")]
    InvalidRegistry(String),

    /// A computed parameter produced no usable value
    #[error("Cannot compute {name}: {reason}")]
    Compute { name: String, reason: String },

    /// Failure while executing a specific command
    #[error("{source} while executing [{command}]")]
    Exchange {
        command: String,
        #[source]
        source: Box<ObdError>,
    },
}

impl ObdError {
    /// Attach the command that was being executed
    pub fn during(self, command: &str) -> Self {
        ObdError::Exchange {
            command: command.to_string(),
            source: Box::new(self),
        }
    }

    /// The underlying condition, without command context
    pub fn kind(&self) -> &ObdError {
        match self {
            ObdError::Exchange { source, .. } => source.kind(),
            other => other,
        }
    }

    /// Whether the error ends the current session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ObdError::Transport(_) | ObdError::Calibration { .. }
        )
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_first_match_wins() {
        assert_eq!(
            ProtocolError::scan("BUS BUSY\rNO DATA"),
            Some(ProtocolError::BusBusy)
        );
        assert_eq!(
            ProtocolError::scan("NO DATA ?"),
            Some(ProtocolError::UnrecognizedCommand)
        );
        assert_eq!(ProtocolError::scan("41 0C 1A F8"), None);
    }

    #[test]
    fn test_kind_unwraps_exchange() {
        let err = ObdError::from(ProtocolError::NoData)
            .during("010C")
            .during("outer");
        assert!(matches!(err.kind(), ObdError::Protocol(ProtocolError::NoData)));
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "No data while executing [010C] while executing [outer]");
    }

    #[test]
    fn test_fatal_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(ObdError::from(io).during("0100").is_fatal());
        assert!(ObdError::Calibration { tried: vec!["0A".into()] }.is_fatal());
        assert!(!ObdError::Timeout { received: "-1".into() }.is_fatal());
    }
}
