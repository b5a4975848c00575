// Crate-wide error type shared by both controller backends and the
// assembly layer.

use thiserror::Error;

/// Error types for rig communication and control
#[derive(Debug, Error)]
pub enum RigError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The device produced no frame within the read timeout. Distinct from
    /// every valid reading; callers branch on this rather than seeing a
    /// fabricated zero.
    #[error("No reply to {request} within the timeout window")]
    NoReply { request: String },

    #[error("Unexpected reply 0x{got:04X}, expected 0x{expected:04X}")]
    UnexpectedReply { expected: u16, got: u16 },

    #[error("Malformed reply: {0}")]
    Malformed(String),

    #[error("Serial port is closed")]
    PortClosed,

    #[error("Unknown rotation axis {0:?} (expected \"theta\" or \"phi\")")]
    UnknownAxis(String),

    #[error("Expected a scalar target, got a 3-vector")]
    ScalarRequired,

    #[error("{what} {value} is outside the supported range {min}..={max}")]
    OutOfRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

pub type Result<T> = std::result::Result<T, RigError>;
