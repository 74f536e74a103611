//! Protocol errors

use thiserror::Error;

/// Errors that can occur during instrument communication
#[derive(Error, Debug)]
pub enum ScpiError {
    /// Port open, write, or read failure; fatal to the current session
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No reply line arrived within the command timeout
    #[error("No reply within the command timeout")]
    Timeout,

    /// The connection has been closed
    #[error("Not connected to instrument")]
    NotConnected,

    /// The baud negotiation handshake did not reach the target rate
    #[error("Baud negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The reply text does not match the shape the caller declared
    #[error("Cannot parse reply as {expected}: {text:?}")]
    Parse {
        /// Shape the caller asked for
        expected: &'static str,
        /// Raw reply text
        text: String,
    },

    /// The instrument's own error queue reported a fault after a directive
    #[error("Instrument reported error {code}: {message}")]
    Instrument {
        /// Error code from the instrument error queue
        code: i32,
        /// Human-readable message accompanying the code
        message: String,
    },

    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
