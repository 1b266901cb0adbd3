//! Sample demux: unpack the packed N-bit-per-sample blob into per-channel
//! bit arrays.
//!
//! Bit position is the *index in the requested channel list*, not the
//! channel's hardware number — the device packs captured channels
//! contiguously from LSB upward.

use crate::error::{DriverError, Result};
use crate::session::CaptureMode;

/// Read `total_samples` packed values of 1/2/4 bytes (LE) from `blob` into a
/// `u32` array.
pub fn unpack_raw_samples(blob: &[u8], mode: CaptureMode, total_samples: usize) -> Result<Vec<u32>> {
    let width = mode.bytes_per_sample();
    let needed = width * total_samples;
    if blob.len() < needed {
        return Err(DriverError::Hardware(format!(
            "sample blob too short: expected {needed} bytes, got {}",
            blob.len()
        )));
    }

    let mut samples = Vec::with_capacity(total_samples);
    for chunk in blob[..needed].chunks_exact(width) {
        let value = match width {
            1 => chunk[0] as u32,
            2 => u16::from_le_bytes([chunk[0], chunk[1]]) as u32,
            4 => u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            _ => unreachable!("capture mode widths are 1, 2, or 4 bytes"),
        };
        samples.push(value);
    }
    Ok(samples)
}

/// For each requested channel (identified by its position `i` in
/// `capture_channels`), extract bit `i` of every raw packed sample.
///
/// Returns `(channel_number, bits)` pairs in the caller's channel order.
pub fn demux(
    raw_samples: &[u32],
    capture_channels: &[u8],
) -> Vec<(u8, Vec<u8>)> {
    capture_channels
        .iter()
        .enumerate()
        .map(|(i, &channel_number)| {
            let bits: Vec<u8> = raw_samples
                .iter()
                .map(|&sample| ((sample >> i) & 1) as u8)
                .collect();
            (channel_number, bits)
        })
        .collect()
}
