//! Error types for the GivEnergy transparent Modbus client.

use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, GivEnergyError>;

/// Errors produced while talking to a GivEnergy inverter/gateway/EMS.
#[derive(Debug, Error, Clone)]
pub enum GivEnergyError {
    /// IO error on the underlying TCP stream.
    #[error("IO error: {0}")]
    Io(String),

    /// Failed to establish a connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation was attempted on a client that isn't connected.
    #[error("Not connected")]
    NotConnected,

    /// A request did not receive a response within its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Bytes on the wire didn't form a valid frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// A PDU was decoded into a state that violates its own invariants
    /// (e.g. CRC mismatch, function code mismatch with the expected decoder).
    #[error("Invalid PDU state: {0}")]
    InvalidPduState(String),

    /// A register value failed a schema conversion (e.g. impossible date).
    #[error("Conversion error on {attribute}: {cause}")]
    Conversion { attribute: String, cause: String },

    /// A value rejected by a register's validity range, or a malformed
    /// command argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Protocol-level violation (unexpected PDU, bad header, etc).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A pending request was cancelled, typically because a newer request
    /// with the same shape superseded it.
    #[error("Request cancelled")]
    Cancelled,
}

impl From<std::io::Error> for GivEnergyError {
    fn from(err: std::io::Error) -> Self {
        GivEnergyError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GivEnergyError {
    fn from(err: serde_json::Error) -> Self {
        GivEnergyError::Protocol(format!("JSON error: {}", err))
    }
}

impl GivEnergyError {
    pub fn conversion(attribute: impl Into<String>, cause: impl Into<String>) -> Self {
        GivEnergyError::Conversion {
            attribute: attribute.into(),
            cause: cause.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        GivEnergyError::Validation(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        GivEnergyError::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        GivEnergyError::Connection(msg.into())
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        GivEnergyError::InvalidFrame(msg.into())
    }

    /// Whether this error means the underlying connection is dead and a
    /// reconnect should be attempted, mirroring the client's `watch_plant`
    /// recovery loop.
    pub fn needs_reconnect(&self) -> bool {
        match self {
            GivEnergyError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("Network is unreachable")
            }
            GivEnergyError::Connection(_) => true,
            GivEnergyError::NotConnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== needs_reconnect tests ==========

    #[test]
    fn io_error_with_broken_pipe_needs_reconnect() {
        let err = GivEnergyError::Io("Broken pipe (os error 32)".into());
        assert!(err.needs_reconnect());
    }

    #[test]
    fn io_error_unrelated_does_not_need_reconnect() {
        let err = GivEnergyError::Io("unexpected eof".into());
        assert!(!err.needs_reconnect());
    }

    #[test]
    fn connection_error_needs_reconnect() {
        assert!(GivEnergyError::Connection("refused".into()).needs_reconnect());
    }

    #[test]
    fn not_connected_needs_reconnect() {
        assert!(GivEnergyError::NotConnected.needs_reconnect());
    }

    #[test]
    fn timeout_does_not_need_reconnect() {
        assert!(!GivEnergyError::Timeout("deadline exceeded".into()).needs_reconnect());
    }

    #[test]
    fn validation_does_not_need_reconnect() {
        assert!(!GivEnergyError::validation("out of range").needs_reconnect());
    }

    // ========== From conversions ==========

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: GivEnergyError = io_err.into();
        matches!(err, GivEnergyError::Io(_));
    }

    #[test]
    fn conversion_helper_sets_attribute_and_cause() {
        let err = GivEnergyError::conversion("system_time_year", "value 12000 out of range");
        match err {
            GivEnergyError::Conversion { attribute, cause } => {
                assert_eq!(attribute, "system_time_year");
                assert_eq!(cause, "value 12000 out of range");
            }
            _ => panic!("expected Conversion variant"),
        }
    }
}
