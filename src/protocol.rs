//! Wire packet codec: serialize a typed request into a framed byte packet.
//!
//! Responses are not decoded here — they are either newline-delimited ASCII
//! (handled by [`crate::transport::Transport::read_line`]) or a
//! length-prefixed binary payload (handled by [`crate::engine`]).

use crate::error::{DriverError, Result};
use crate::session::{CaptureMode, CaptureSession, TriggerType, MAX_DEVICE_CHANNELS};

/// Command byte values understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    DeviceInfo = 0,
    StartCapture = 1,
    Stop = 2,
    Bootloader = 3,
    VoltageQuery = 4,
    WifiSettings = 5,
}

/// The 24-channel table plus count, frequency, pre/post sample counts, loop
/// count, measure flag, and capture mode: the on-wire capture request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequestWire {
    pub trigger_type: u8,
    pub trigger: u8,
    pub inverted_or_count: u8,
    pub trigger_value: u16,
    pub channels: [u8; MAX_DEVICE_CHANNELS as usize],
    pub channel_count: u8,
    pub frequency: u32,
    pub pre_samples: u32,
    pub post_samples: u32,
    pub loop_count: u8,
    pub measure: u8,
    pub capture_mode: u8,
}

impl CaptureRequestWire {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(45);
        buf.push(self.trigger_type);
        buf.push(self.trigger);
        buf.push(self.inverted_or_count);
        buf.extend_from_slice(&self.trigger_value.to_le_bytes());
        buf.extend_from_slice(&self.channels);
        buf.push(self.channel_count);
        buf.extend_from_slice(&self.frequency.to_le_bytes());
        buf.extend_from_slice(&self.pre_samples.to_le_bytes());
        buf.extend_from_slice(&self.post_samples.to_le_bytes());
        buf.push(self.loop_count);
        buf.push(self.measure);
        buf.push(self.capture_mode);
        buf
    }
}

/// 115-byte fixed-length WiFi settings block: AP name (33B), password (64B),
/// IP (16B), port (u16 LE), all ASCII fields NUL-padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiConfig {
    ap: [u8; 33],
    password: [u8; 64],
    ip: [u8; 16],
    port: u16,
}

fn pack_ascii_field(value: &str, len: usize, field_name: &str) -> Result<Vec<u8>> {
    if value.len() > len {
        return Err(DriverError::Config(format!(
            "{field_name} '{value}' exceeds {len} bytes"
        )));
    }
    if !value.is_ascii() {
        return Err(DriverError::Config(format!(
            "{field_name} must be ASCII"
        )));
    }
    let mut out = vec![0u8; len];
    out[..value.len()].copy_from_slice(value.as_bytes());
    Ok(out)
}

impl WifiConfig {
    pub fn new(ap: &str, password: &str, ip: &str, port: u16) -> Result<Self> {
        let ap_bytes = pack_ascii_field(ap, 33, "ap name")?;
        let pw_bytes = pack_ascii_field(password, 64, "password")?;
        let ip_bytes = pack_ascii_field(ip, 16, "ip")?;

        let mut ap_arr = [0u8; 33];
        ap_arr.copy_from_slice(&ap_bytes);
        let mut pw_arr = [0u8; 64];
        pw_arr.copy_from_slice(&pw_bytes);
        let mut ip_arr = [0u8; 16];
        ip_arr.copy_from_slice(&ip_bytes);

        Ok(Self {
            ap: ap_arr,
            password: pw_arr,
            ip: ip_arr,
            port,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(115);
        buf.extend_from_slice(&self.ap);
        buf.extend_from_slice(&self.password);
        buf.extend_from_slice(&self.ip);
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf
    }
}

/// A request the host can send to the device.
pub enum Request {
    DeviceInfo,
    StartCapture(CaptureRequestWire),
    Stop,
    Bootloader,
    VoltageQuery,
    WifiSettings(WifiConfig),
}

impl Request {
    fn command_id(&self) -> CommandId {
        match self {
            Request::DeviceInfo => CommandId::DeviceInfo,
            Request::StartCapture(_) => CommandId::StartCapture,
            Request::Stop => CommandId::Stop,
            Request::Bootloader => CommandId::Bootloader,
            Request::VoltageQuery => CommandId::VoltageQuery,
            Request::WifiSettings(_) => CommandId::WifiSettings,
        }
    }

    /// Encode the full framed packet: command byte followed by the
    /// command-specific little-endian packed body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.command_id() as u8];
        match self {
            Request::DeviceInfo | Request::Stop | Request::Bootloader | Request::VoltageQuery => {}
            Request::StartCapture(body) => buf.extend_from_slice(&body.encode()),
            Request::WifiSettings(body) => buf.extend_from_slice(&body.encode()),
        }
        buf
    }
}

/// Build the fixed part of a capture request, leaving trigger delay
/// compensation and validation to [`crate::planner`].
pub(crate) fn build_channel_table(channels: &[u8]) -> [u8; MAX_DEVICE_CHANNELS as usize] {
    let mut table = [0u8; MAX_DEVICE_CHANNELS as usize];
    for (i, &ch) in channels.iter().enumerate() {
        table[i] = ch;
    }
    table
}

pub(crate) fn trigger_fields(session: &CaptureSession) -> (u8, u8, u16) {
    match session.trigger_type {
        TriggerType::Edge => (
            session.trigger_channel,
            if session.trigger_inverted { 1 } else { 0 },
            if session.trigger_inverted { 1 } else { 0 },
        ),
        _ => (
            session.trigger_channel,
            session.trigger_bit_count,
            session.trigger_pattern,
        ),
    }
}

pub(crate) fn measure_flag(session: &CaptureSession) -> u8 {
    match session.trigger_type {
        TriggerType::Blast => 1,
        TriggerType::Complex | TriggerType::Fast => 0,
        TriggerType::Edge => {
            if session.measure_bursts {
                1
            } else {
                0
            }
        }
    }
}

pub(crate) fn loop_count_field(session: &CaptureSession) -> u8 {
    match session.trigger_type {
        TriggerType::Complex | TriggerType::Fast => 0,
        _ => session.loop_count,
    }
}

pub(crate) fn capture_mode_from_wire(code: u8) -> CaptureMode {
    match code {
        0 => CaptureMode::Channels8,
        1 => CaptureMode::Channels16,
        _ => CaptureMode::Channels24,
    }
}
