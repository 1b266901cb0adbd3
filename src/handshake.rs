//! Device handshake: issue the device-info query and parse the five ASCII
//! response lines into a [`DeviceInfo`], validating firmware version.

use std::time::{Duration, Instant};

use log::debug;

use crate::error::{DriverError, Result};
use crate::protocol::Request;
use crate::session::{DeviceInfo, TransportKind};
use crate::transport::DeviceTransport;

/// Total deadline for the five-line handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum accepted firmware version (major, minor).
pub const MIN_VERSION: (u16, u16) = (1, 7);

fn parse_numeric_line(line: &str, prefix: &str) -> Result<u32> {
    let value = line.trim();
    let rest = value.strip_prefix(prefix).ok_or_else(|| {
        DriverError::Handshake(format!("expected line starting with '{prefix}', got '{line}'"))
    })?;
    rest.trim()
        .parse::<u32>()
        .map_err(|_| DriverError::Handshake(format!("malformed numeric line: '{line}'")))
}

/// Parse a version token of the form `V<major>_<minor>` (case-insensitive,
/// may appear anywhere in the line) or `<major>.<minor>`.
pub fn parse_version(line: &str) -> Result<(u16, u16)> {
    let lower = line.to_ascii_lowercase();

    if let Some(v_pos) = lower.find('v') {
        let rest = &lower[v_pos + 1..];
        let digits_and_sep: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '_')
            .collect();
        if let Some((major_str, minor_str)) = digits_and_sep.split_once('_') {
            if let (Ok(major), Ok(minor)) =
                (major_str.parse::<u16>(), minor_str.trim_matches('_').parse::<u16>())
            {
                if !major_str.is_empty() && !minor_str.is_empty() {
                    return Ok((major, minor));
                }
            }
        }
    }

    // Fall back to bare `<major>.<minor>` anywhere in the line.
    for token in line.split(|c: char| !c.is_ascii_digit() && c != '.') {
        if let Some((major_str, minor_str)) = token.split_once('.') {
            if let (Ok(major), Ok(minor)) = (major_str.parse::<u16>(), minor_str.parse::<u16>()) {
                return Ok((major, minor));
            }
        }
    }

    Err(DriverError::Handshake(format!(
        "could not parse version token from '{line}'"
    )))
}

pub fn validate_version(major: u16, minor: u16) -> Result<()> {
    if (major, minor) < MIN_VERSION {
        return Err(DriverError::Version(format!(
            "firmware version {major}.{minor} is below minimum {}.{}",
            MIN_VERSION.0, MIN_VERSION.1
        )));
    }
    Ok(())
}

/// Run the handshake over an already-open transport: send the device-info
/// request, read exactly five lines within [`HANDSHAKE_TIMEOUT`], and
/// validate the parsed version.
pub fn handshake(transport: &mut dyn DeviceTransport, transport_kind: TransportKind) -> Result<DeviceInfo> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    transport.write(&Request::DeviceInfo.encode())?;

    let read_line_budget = |deadline: Instant| -> Result<Duration> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DriverError::Timeout("handshake deadline exceeded".into()));
        }
        Ok(remaining)
    };

    let version_line = transport.read_line(read_line_budget(deadline)?)?;
    let freq_line = transport.read_line(read_line_budget(deadline)?)?;
    let blast_freq_line = transport.read_line(read_line_budget(deadline)?)?;
    let buffer_line = transport.read_line(read_line_budget(deadline)?)?;
    let channels_line = transport.read_line(read_line_budget(deadline)?)?;

    let max_frequency = parse_numeric_line(&freq_line, "FREQ:")?;
    let burst_frequency = parse_numeric_line(&blast_freq_line, "BLASTFREQ:")?;
    let buffer_size = parse_numeric_line(&buffer_line, "BUFFER:")?;
    let channel_count = parse_numeric_line(&channels_line, "CHANNELS:")?;

    if max_frequency == 0 {
        return Err(DriverError::Handshake("zero max frequency reported".into()));
    }
    if channel_count > crate::session::MAX_DEVICE_CHANNELS as u32 {
        return Err(DriverError::Handshake(format!(
            "channel count {channel_count} exceeds {}",
            crate::session::MAX_DEVICE_CHANNELS
        )));
    }

    let (major, minor) = parse_version(&version_line)?;
    validate_version(major, minor)?;

    let info = DeviceInfo {
        version: version_line,
        major,
        minor,
        channel_count: channel_count as u8,
        max_frequency,
        burst_frequency,
        buffer_size,
        transport_kind,
        identity: transport.identity(),
    };
    info.validate()?;
    debug!("handshake complete: {info:?}");
    Ok(info)
}
