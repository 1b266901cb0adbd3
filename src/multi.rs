//! Multi-device orchestrator: partitions one logical capture across up to
//! five physical devices, with one triggered master and N-1 externally
//! triggered slaves, and merges their output back into a single result.

use std::collections::HashMap;
use std::sync::mpsc;

use crate::device::LogicAnalyzer;
use crate::engine::CaptureOutcome;
use crate::error::{DriverError, Result};
use crate::session::{CaptureResult, CaptureSession, TriggerType, EXTERNAL_TRIGGER_CHANNEL};

const MIN_DEVICES: usize = 2;
const MAX_DEVICES: usize = 5;

/// Per-device channel budget; channel `n` belongs to device `n / 24`.
const CHANNELS_PER_DEVICE: u8 = 24;

/// Slave `preTriggerSamples` shift compensating for external-trigger
/// propagation delay between master and slaves. Device-characterized;
/// override with [`MultiAnalyzer::with_slave_offset`] for a specific rig.
pub const SLAVE_TRIGGER_OFFSET_SAMPLES: u32 = 4;

pub struct MultiAnalyzer {
    devices: Vec<LogicAnalyzer>,
    total_channels: u32,
    max_frequency: u32,
    min_frequency: u32,
    buffer_size: u32,
    slave_offset: u32,
}

impl MultiAnalyzer {
    /// Open 2-5 devices by connection string. If any child fails to open,
    /// the ones already opened are dropped (closing their transports) and
    /// the whole construction fails.
    pub fn new(connection_strings: &[String]) -> Result<Self> {
        if connection_strings.len() < MIN_DEVICES || connection_strings.len() > MAX_DEVICES {
            return Err(DriverError::Config(format!(
                "multi-device orchestrator requires {MIN_DEVICES}..={MAX_DEVICES} devices, got {}",
                connection_strings.len()
            )));
        }

        let mut devices = Vec::with_capacity(connection_strings.len());
        for conn in connection_strings {
            match LogicAnalyzer::open(conn) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    devices.clear();
                    return Err(e);
                }
            }
        }

        let infos: Vec<_> = devices.iter().map(|d| d.device_info()).collect();
        let major = infos[0].major;
        if infos.iter().any(|i| i.major != major) {
            return Err(DriverError::Version(
                "devices in a multi-device group report mismatched major firmware versions".into(),
            ));
        }

        let n = devices.len() as u32;
        let total_channels = infos.iter().map(|i| i.channel_count as u32).min().unwrap() * n;
        let max_frequency = infos.iter().map(|i| i.max_frequency).min().unwrap();
        let min_frequency = infos.iter().map(|i| i.min_frequency()).max().unwrap();
        let buffer_size = infos.iter().map(|i| i.buffer_size).min().unwrap();

        Ok(Self {
            devices,
            total_channels,
            max_frequency,
            min_frequency,
            buffer_size,
            slave_offset: SLAVE_TRIGGER_OFFSET_SAMPLES,
        })
    }

    pub fn with_slave_offset(mut self, offset: u32) -> Self {
        self.slave_offset = offset;
        self
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn total_channels(&self) -> u32 {
        self.total_channels
    }

    pub fn max_frequency(&self) -> u32 {
        self.max_frequency
    }

    pub fn min_frequency(&self) -> u32 {
        self.min_frequency
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Run one synchronized capture across all participating devices and
    /// merge the result. Blocks until every participating device reports
    /// completion.
    pub fn capture(&self, session: CaptureSession) -> Result<CaptureResult> {
        reject_top_level_edge_trigger(&session)?;

        let partitions = partition_channels(&session.capture_channels, self.devices.len())?;
        let master_index = master_device_index(session.trigger_channel, self.devices.len());

        let mut participating: Vec<usize> = (0..self.devices.len())
            .filter(|&idx| idx == master_index || !partitions[idx].is_empty())
            .collect();
        participating.sort_unstable();

        let (tx, rx) = mpsc::channel::<(usize, CaptureOutcome)>();

        for &idx in participating.iter().filter(|&&i| i != master_index) {
            let slave_session = build_slave_session(&session, &partitions[idx], self.slave_offset)?;
            let sender = tx.clone();
            self.devices[idx].start_capture(slave_session, move |outcome| {
                let _ = sender.send((idx, outcome));
            })?;
        }

        let master_session = build_master_session(&session, &partitions[master_index]);
        let sender = tx.clone();
        self.devices[master_index].start_capture(master_session, move |outcome| {
            let _ = sender.send((master_index, outcome));
        })?;
        drop(tx);

        let mut outcomes = Vec::with_capacity(participating.len());
        for _ in 0..participating.len() {
            let received = rx
                .recv()
                .map_err(|_| DriverError::Hardware("multi-device completion channel closed early".into()))?;
            outcomes.push(received);
        }

        if let Some(pos) = outcomes.iter().position(|(_, o)| !o.success) {
            let (_, failed) = outcomes.remove(pos);
            for &idx in &participating {
                let _ = self.devices[idx].stop_capture();
            }
            return Err(failed
                .error
                .unwrap_or_else(|| DriverError::Hardware("child capture failed".into())));
        }

        let mut by_device: HashMap<usize, CaptureOutcome> = outcomes.into_iter().collect();
        let master_result = by_device
            .remove(&master_index)
            .and_then(|o| o.result)
            .ok_or_else(|| DriverError::Hardware("master produced no capture result".into()))?;

        let mut channels = Vec::with_capacity(session.capture_channels.len());
        for &ch in &session.capture_channels {
            let device_idx = (ch / CHANNELS_PER_DEVICE) as usize;
            let local = ch % CHANNELS_PER_DEVICE;
            let bits = if device_idx == master_index {
                master_result.channel(local)
            } else {
                by_device
                    .get(&device_idx)
                    .and_then(|o| o.result.as_ref())
                    .and_then(|r| r.channel(local))
            }
            .ok_or_else(|| {
                DriverError::Hardware(format!("channel {ch} missing from child capture result"))
            })?
            .to_vec();
            channels.push((ch, bits));
        }

        Ok(CaptureResult {
            channels,
            bursts: master_result.bursts,
        })
    }
}

fn reject_top_level_edge_trigger(session: &CaptureSession) -> Result<()> {
    if session.trigger_type == TriggerType::Edge {
        return Err(DriverError::Validation(
            "Edge trigger is rejected by the multi-device orchestrator; use Complex, Fast, or Blast".into(),
        ));
    }
    Ok(())
}

/// Map each requested global channel number to its owning device's local
/// channel list, in the order the caller specified them.
fn partition_channels(capture_channels: &[u8], device_count: usize) -> Result<Vec<Vec<u8>>> {
    let mut partitions = vec![Vec::new(); device_count];
    for &ch in capture_channels {
        let idx = (ch / CHANNELS_PER_DEVICE) as usize;
        if idx >= device_count {
            return Err(DriverError::Validation(format!(
                "channel {ch} has no owning device among {device_count} devices"
            )));
        }
        partitions[idx].push(ch % CHANNELS_PER_DEVICE);
    }
    Ok(partitions)
}

fn master_device_index(trigger_channel: u8, device_count: usize) -> usize {
    let idx = (trigger_channel / CHANNELS_PER_DEVICE) as usize;
    if idx >= device_count {
        0
    } else {
        idx
    }
}

fn build_master_session(session: &CaptureSession, local_channels: &[u8]) -> CaptureSession {
    CaptureSession {
        frequency: session.frequency,
        pre_trigger_samples: session.pre_trigger_samples,
        post_trigger_samples: session.post_trigger_samples,
        loop_count: session.loop_count,
        measure_bursts: session.measure_bursts,
        trigger_type: session.trigger_type,
        trigger_channel: session.trigger_channel % CHANNELS_PER_DEVICE,
        trigger_inverted: session.trigger_inverted,
        trigger_bit_count: session.trigger_bit_count,
        trigger_pattern: session.trigger_pattern,
        capture_channels: local_channels.to_vec(),
    }
}

fn build_slave_session(session: &CaptureSession, local_channels: &[u8], offset: u32) -> Result<CaptureSession> {
    if offset > session.post_trigger_samples {
        return Err(DriverError::Validation(format!(
            "slave trigger offset {offset} exceeds postTriggerSamples {}",
            session.post_trigger_samples
        )));
    }
    Ok(CaptureSession {
        frequency: session.frequency,
        pre_trigger_samples: session.pre_trigger_samples + offset,
        post_trigger_samples: session.post_trigger_samples - offset,
        loop_count: 0,
        measure_bursts: false,
        trigger_type: TriggerType::Edge,
        trigger_channel: EXTERNAL_TRIGGER_CHANNEL,
        trigger_inverted: false,
        trigger_bit_count: 0,
        trigger_pattern: 0,
        capture_channels: local_channels.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_session() -> CaptureSession {
        CaptureSession {
            frequency: 10_000_000,
            pre_trigger_samples: 1000,
            post_trigger_samples: 4000,
            loop_count: 0,
            measure_bursts: false,
            trigger_type: TriggerType::Complex,
            trigger_channel: 0,
            trigger_inverted: false,
            trigger_bit_count: 4,
            trigger_pattern: 0,
            capture_channels: vec![0, 24, 48],
        }
    }

    /// S5 — partition [0, 24, 48] across 3 devices.
    #[test]
    fn scenario_s5_partitions_channels_by_device() {
        let partitions = partition_channels(&[0, 24, 48], 3).unwrap();
        assert_eq!(partitions, vec![vec![0], vec![0], vec![0]]);
    }

    #[test]
    fn scenario_s5_master_is_device_owning_trigger_channel() {
        assert_eq!(master_device_index(0, 3), 0);
        assert_eq!(master_device_index(30, 3), 1);
        assert_eq!(master_device_index(48, 3), 2);
    }

    #[test]
    fn master_falls_back_to_device_zero_when_trigger_out_of_range() {
        assert_eq!(master_device_index(200, 3), 0);
    }

    #[test]
    fn rejects_channel_with_no_owning_device() {
        assert!(partition_channels(&[0, 200], 3).is_err());
    }

    #[test]
    fn invariant_9_rejects_edge_trigger() {
        let mut session = base_session();
        session.trigger_type = TriggerType::Edge;
        assert!(reject_top_level_edge_trigger(&session).is_err());
    }

    #[test]
    fn accepts_non_edge_trigger() {
        assert!(reject_top_level_edge_trigger(&base_session()).is_ok());
    }

    #[test]
    fn slave_session_is_edge_on_external_trigger_channel() {
        let session = base_session();
        let slave = build_slave_session(&session, &[0], SLAVE_TRIGGER_OFFSET_SAMPLES).unwrap();
        assert_eq!(slave.trigger_type, TriggerType::Edge);
        assert_eq!(slave.trigger_channel, EXTERNAL_TRIGGER_CHANNEL);
        assert_eq!(slave.loop_count, 0);
        assert!(!slave.measure_bursts);
    }

    #[test]
    fn slave_offset_preserves_total_pre_plus_post() {
        let session = base_session();
        let master = build_master_session(&session, &[0]);
        let slave = build_slave_session(&session, &[0], SLAVE_TRIGGER_OFFSET_SAMPLES).unwrap();
        assert_eq!(
            slave.pre_trigger_samples + slave.post_trigger_samples,
            master.pre_trigger_samples + master.post_trigger_samples
        );
    }

    #[test]
    fn rejects_offset_larger_than_post_trigger_samples() {
        let mut session = base_session();
        session.post_trigger_samples = 2;
        assert!(build_slave_session(&session, &[0], SLAVE_TRIGGER_OFFSET_SAMPLES).is_err());
    }

    #[test]
    fn rejects_device_count_outside_two_to_five() {
        assert!(MultiAnalyzer::new(&[]).is_err());
        assert!(MultiAnalyzer::new(&["a".into()]).is_err());
        assert!(MultiAnalyzer::new(&(0..6).map(|i| i.to_string()).collect::<Vec<_>>()).is_err());
    }
}
