//! Error taxonomy surfaced by the driver stack.
use std::io;
use thiserror::Error;

/// Top-level driver errors surfaced to callers: configuration, transport,
/// handshake, version, validation, busy, timeout, hardware, and
/// cancellation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("config error: {0}")]
    /// Bad connection string, bad IP/port, invalid multi-device count.
    Config(String),

    #[error("transport error: {0}")]
    /// I/O open/read/write failure at the transport layer.
    Transport(#[from] io::Error),

    #[error("serial transport error: {0}")]
    /// Errors raised by the serial-port backend specifically.
    Serial(#[from] serialport::Error),

    #[error("handshake error: {0}")]
    /// Malformed or missing device-info response.
    Handshake(String),

    #[error("version error: {0}")]
    /// Parsed firmware version is below the minimum supported version.
    Version(String),

    #[error("validation error: {0}")]
    /// Capture session violates device limits or trigger constraints.
    Validation(String),

    #[error("device busy: capture already in progress")]
    /// A capture was requested while the engine was not `Idle`.
    Busy,

    #[error("timeout: {0}")]
    /// A deadline was missed (handshake, capture-start, payload, control response).
    Timeout(String),

    #[error("hardware error: {0}")]
    /// Unexpected device response or unexpected disconnect.
    Hardware(String),

    #[error("capture cancelled")]
    /// `stop()` was issued while a capture was in flight.
    Cancelled,
}

/// Convenience result alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
