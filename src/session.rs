//! Capture data model: device descriptor, capture session, and capture
//! output types shared across the planner, engine, demux, and timestamp
//! modules.

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Maximum channel count a single physical device can expose.
pub const MAX_DEVICE_CHANNELS: u8 = 24;

/// The external-trigger input line used to synchronize slave devices.
pub const EXTERNAL_TRIGGER_CHANNEL: u8 = 24;

/// Trigger classes supported by the capture protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    Edge,
    Complex,
    Fast,
    Blast,
}

impl TriggerType {
    pub(crate) fn wire_code(self) -> u8 {
        match self {
            TriggerType::Edge => 0,
            TriggerType::Complex => 1,
            TriggerType::Fast => 2,
            TriggerType::Blast => 3,
        }
    }
}

/// Wire-format capture mode, selected from the highest requested channel
/// index. Determines the on-wire sample width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Up to 8 channels, 1 byte per packed sample.
    Channels8,
    /// Up to 16 channels, 2 bytes per packed sample.
    Channels16,
    /// Up to 24 channels, 4 bytes per packed sample.
    Channels24,
}

impl CaptureMode {
    pub fn wire_code(self) -> u8 {
        match self {
            CaptureMode::Channels8 => 0,
            CaptureMode::Channels16 => 1,
            CaptureMode::Channels24 => 2,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            CaptureMode::Channels8 => 1,
            CaptureMode::Channels16 => 2,
            CaptureMode::Channels24 => 4,
        }
    }

    /// Selected from the maximum channel index present: `< 8` -> 8ch mode,
    /// `< 16` -> 16ch mode, else 24ch mode.
    pub fn select(max_channel_index: u8) -> Self {
        if max_channel_index < 8 {
            CaptureMode::Channels8
        } else if max_channel_index < 16 {
            CaptureMode::Channels16
        } else {
            CaptureMode::Channels24
        }
    }
}

/// Transport kind a device was opened over, retained for diagnostics and for
/// the multi-device capability homogeneity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Serial,
    Network,
}

/// Immutable device capabilities parsed from the handshake response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub version: String,
    pub major: u16,
    pub minor: u16,
    pub channel_count: u8,
    pub max_frequency: u32,
    pub burst_frequency: u32,
    pub buffer_size: u32,
    pub transport_kind: TransportKind,
    /// Path (serial) or `host:port` (network), used for reconnect/diagnostics.
    pub identity: String,
}

impl DeviceInfo {
    /// The minimum admissible sample frequency: `floor(maxFreq * 2 / 65535)`.
    pub fn min_frequency(&self) -> u32 {
        ((self.max_frequency as u64 * 2) / 65535) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_count == 0 || self.channel_count > MAX_DEVICE_CHANNELS {
            return Err(DriverError::Handshake(format!(
                "channel count {} out of range (1..={})",
                self.channel_count, MAX_DEVICE_CHANNELS
            )));
        }
        if self.max_frequency == 0 || self.burst_frequency == 0 || self.buffer_size == 0 {
            return Err(DriverError::Handshake(
                "zero frequency or buffer size in device-info response".into(),
            ));
        }
        Ok(())
    }
}

/// Device-imposed limits derived from `DeviceInfo`, used by the planner.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub max_total_samples: u32,
    pub max_pre_samples: u32,
    pub max_post_samples: u32,
    pub min_pre_samples: u32,
    pub min_post_samples: u32,
    pub min_frequency: u32,
    pub max_frequency: u32,
    pub burst_frequency: u32,
    pub channel_count: u8,
}

impl CaptureLimits {
    pub fn from_device_info(info: &DeviceInfo) -> Self {
        Self {
            max_total_samples: info.buffer_size,
            max_pre_samples: (info.buffer_size as f64 * 0.5).floor() as u32,
            max_post_samples: info.buffer_size.saturating_sub(2),
            min_pre_samples: 2,
            min_post_samples: 2,
            min_frequency: info.min_frequency(),
            max_frequency: info.max_frequency,
            burst_frequency: info.burst_frequency,
            channel_count: info.channel_count,
        }
    }
}

/// A logical capture request, owned by the caller for the duration of one
/// capture and mutated only through its output fields (or, as implemented
/// here, left untouched in favor of returning a fresh [`CaptureResult`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    pub frequency: u32,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    pub loop_count: u8,
    pub measure_bursts: bool,
    pub trigger_type: TriggerType,
    pub trigger_channel: u8,
    pub trigger_inverted: bool,
    pub trigger_bit_count: u8,
    pub trigger_pattern: u16,
    pub capture_channels: Vec<u8>,
}

impl CaptureSession {
    /// Total sample count across all bursts: `pre + post*(loop+1)`.
    pub fn total_samples(&self) -> u64 {
        self.pre_trigger_samples as u64
            + self.post_trigger_samples as u64 * (self.loop_count as u64 + 1)
    }

    pub fn capture_mode(&self) -> CaptureMode {
        let max_channel = self.capture_channels.iter().copied().max().unwrap_or(0);
        CaptureMode::select(max_channel)
    }
}

/// One post-trigger collection window, reconstructed from device tick
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstInfo {
    pub burst_sample_start: u32,
    pub burst_sample_end: u32,
    pub burst_sample_gap: u32,
    pub burst_time_gap: u64,
}

/// Output of a single capture: per-channel sample bits (keyed by requested
/// channel number) and, for measured-burst sessions, burst timing.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    /// Channel number -> decoded 0/1 samples, same length for every channel.
    pub channels: Vec<(u8, Vec<u8>)>,
    pub bursts: Option<Vec<BurstInfo>>,
}

impl CaptureResult {
    pub fn channel(&self, number: u8) -> Option<&[u8]> {
        self.channels
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, v)| v.as_slice())
    }
}
