//! Host-side driver stack for Pico-based digital logic analyzers.
//!
//! Opens a transport to one or more capture devices, negotiates
//! capabilities, programs a capture session (sample rate, trigger mode,
//! channel selection, burst/loop configuration), streams back a binary
//! capture buffer, decodes per-sample channel values and per-burst
//! timestamps, and delivers a structured capture result.
//!
//! # Layout
//!
//! - [`transport`]: serial/TCP byte transport with a shared line+byte reader.
//! - [`protocol`]: the wire request codec.
//! - [`handshake`]: device-info exchange and firmware version validation.
//! - [`session`]: the public capture data model.
//! - [`planner`]: session validation, capture mode selection, trigger delay
//!   compensation.
//! - [`demux`]: packed-sample unpacking into per-channel bit streams.
//! - [`timestamp`]: burst tick-counter reconstruction.
//! - [`engine`]: the single-device capture state machine.
//! - [`device`]: a single device handle combining transport, handshake, and
//!   engine, plus the control-plane operations.
//! - [`multi`]: the multi-device orchestrator.

pub mod demux;
pub mod device;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod multi;
pub mod planner;
pub mod protocol;
pub mod session;
pub mod timestamp;
pub mod transport;

pub use device::LogicAnalyzer;
pub use error::{DriverError, Result};
pub use multi::MultiAnalyzer;
pub use session::{
    BurstInfo, CaptureLimits, CaptureMode, CaptureResult, CaptureSession, DeviceInfo,
    TransportKind, TriggerType,
};
