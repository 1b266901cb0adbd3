//! Capture planner: validates a [`CaptureSession`] against device limits,
//! selects the capture mode, computes per-trigger delay compensation, and
//! produces the wire-serialized [`CaptureRequestWire`].

use crate::error::{DriverError, Result};
use crate::protocol::{
    build_channel_table, capture_mode_from_wire, loop_count_field, measure_flag, trigger_fields,
    CaptureRequestWire,
};
use crate::session::{CaptureLimits, CaptureSession, TriggerType};

/// The emitted, delay-compensated pre/post sample counts plus the wire
/// request ready to serialize.
#[derive(Debug, Clone)]
pub struct PlannedCapture {
    pub wire: CaptureRequestWire,
    /// Sample counts actually sent on the wire, after trigger delay
    /// compensation (see invariant: `pre + post == original pre + post`).
    pub wire_pre_samples: u32,
    pub wire_post_samples: u32,
}

fn validate(session: &CaptureSession, limits: &CaptureLimits) -> Result<()> {
    let freq_in_range =
        session.frequency >= limits.min_frequency && session.frequency <= limits.max_frequency;
    let freq_is_burst = session.frequency == limits.burst_frequency;
    if !freq_in_range && !freq_is_burst {
        return Err(DriverError::Validation(format!(
            "frequency {} outside [{}, {}] and not equal to burst frequency {}",
            session.frequency, limits.min_frequency, limits.max_frequency, limits.burst_frequency
        )));
    }

    if session.pre_trigger_samples < limits.min_pre_samples
        || session.pre_trigger_samples > limits.max_pre_samples
    {
        return Err(DriverError::Validation(format!(
            "preTriggerSamples {} outside [{}, {}]",
            session.pre_trigger_samples, limits.min_pre_samples, limits.max_pre_samples
        )));
    }
    if session.post_trigger_samples < limits.min_post_samples
        || session.post_trigger_samples > limits.max_post_samples
    {
        return Err(DriverError::Validation(format!(
            "postTriggerSamples {} outside [{}, {}]",
            session.post_trigger_samples, limits.min_post_samples, limits.max_post_samples
        )));
    }

    if session.total_samples() > limits.max_total_samples as u64 {
        return Err(DriverError::Validation(format!(
            "total samples {} exceeds device buffer {}",
            session.total_samples(),
            limits.max_total_samples
        )));
    }

    match session.trigger_type {
        TriggerType::Complex => {
            if session.trigger_channel as u16 + session.trigger_bit_count as u16 > 16 {
                return Err(DriverError::Validation(
                    "Complex trigger: triggerChannel + triggerBitCount exceeds 16".into(),
                ));
            }
            if session.loop_count != 0 {
                return Err(DriverError::Validation(
                    "loopCount must be 0 for Complex trigger".into(),
                ));
            }
        }
        TriggerType::Fast => {
            if session.trigger_channel as u16 + session.trigger_bit_count as u16 > 5 {
                return Err(DriverError::Validation(
                    "Fast trigger: triggerChannel + triggerBitCount exceeds 5".into(),
                ));
            }
            if session.loop_count != 0 {
                return Err(DriverError::Validation(
                    "loopCount must be 0 for Fast trigger".into(),
                ));
            }
        }
        TriggerType::Blast => {
            // loopCount <= 255 always holds for u8; nothing further to check.
        }
        TriggerType::Edge => {
            if session.loop_count != 0 {
                return Err(DriverError::Validation(
                    "loopCount must be 0 for Edge trigger".into(),
                ));
            }
        }
    }

    for &ch in &session.capture_channels {
        if ch as u32 >= limits.channel_count as u32 {
            return Err(DriverError::Validation(format!(
                "captured channel {ch} is out of range [0, {})",
                limits.channel_count
            )));
        }
    }

    Ok(())
}

/// Trigger delay compensation constants from spec §4.4: the pipeline
/// latency (in nanoseconds) baked into each trigger class, converted to a
/// whole number of samples at the requested frequency.
fn delay_offset_samples(session: &CaptureSession, limits: &CaptureLimits) -> u32 {
    let ns_per_sample = 1e9 / session.frequency as f64;
    let latency_ns = match session.trigger_type {
        TriggerType::Complex => (1.0 / limits.max_frequency as f64) * 1e9 * 5.0,
        TriggerType::Fast => (1.0 / limits.max_frequency as f64) * 1e9 * 3.0,
        TriggerType::Edge | TriggerType::Blast => return 0,
    };
    (latency_ns / ns_per_sample + 0.3).round() as u32
}

/// Build the wire capture request for a validated session: selects capture
/// mode, applies trigger delay compensation, and fills the protocol fields
/// exactly as specified in §4.4.
pub fn plan(session: &CaptureSession, limits: &CaptureLimits) -> Result<PlannedCapture> {
    validate(session, limits)?;

    let offset = delay_offset_samples(session, limits);
    let wire_pre_samples = session.pre_trigger_samples + offset;
    let wire_post_samples = session.post_trigger_samples - offset;

    let mode = session.capture_mode();
    let (trigger, inverted_or_count, trigger_value) = trigger_fields(session);

    let wire = CaptureRequestWire {
        trigger_type: session.trigger_type.wire_code(),
        trigger,
        inverted_or_count,
        trigger_value,
        channels: build_channel_table(&session.capture_channels),
        channel_count: session.capture_channels.len() as u8,
        frequency: session.frequency,
        pre_samples: wire_pre_samples,
        post_samples: wire_post_samples,
        loop_count: loop_count_field(session),
        measure: measure_flag(session),
        capture_mode: mode.wire_code(),
    };

    debug_assert_eq!(
        capture_mode_from_wire(wire.capture_mode).wire_code(),
        mode.wire_code()
    );

    Ok(PlannedCapture {
        wire,
        wire_pre_samples,
        wire_post_samples,
    })
}
