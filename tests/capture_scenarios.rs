//! End-to-end scenarios from spec §8, driven through the public engine and
//! handshake APIs against an in-memory mock transport — no real hardware.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::Duration;

use pla_core::engine::{CaptureEngine, CaptureOutcome};
use pla_core::error::DriverError;
use pla_core::handshake;
use pla_core::session::{CaptureSession, DeviceInfo, TransportKind, TriggerType};
use pla_core::transport::DeviceTransport;

/// A fully scripted transport: a queue of lines for `read_line`, a byte
/// buffer for `read_bytes`, and a record of every command byte written.
/// Reused across the handshake that follows the forced post-capture
/// reconnect, so it carries two batches of handshake lines when needed.
#[derive(Default)]
struct ScriptedTransport {
    lines: VecDeque<String>,
    bytes: VecDeque<u8>,
    network: bool,
    writes: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    fn push_handshake_lines(&mut self, version: &str, freq: u32, blast: u32, buffer: u32, channels: u32) {
        self.lines.push_back(version.to_string());
        self.lines.push_back(format!("FREQ:{freq}"));
        self.lines.push_back(format!("BLASTFREQ:{blast}"));
        self.lines.push_back(format!("BUFFER:{buffer}"));
        self.lines.push_back(format!("CHANNELS:{channels}"));
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend(bytes.iter().copied());
    }
}

impl DeviceTransport for ScriptedTransport {
    fn write(&mut self, bytes: &[u8]) -> pla_core::Result<()> {
        self.writes.push(bytes.to_vec());
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> pla_core::Result<String> {
        self.lines
            .pop_front()
            .ok_or_else(|| DriverError::Timeout("scripted transport ran out of lines".into()))
    }

    fn read_bytes(&mut self, buf: &mut [u8], _timeout: Duration) -> pla_core::Result<()> {
        if self.bytes.len() < buf.len() {
            return Err(DriverError::Timeout(format!(
                "scripted transport ran out of bytes: wanted {}, had {}",
                buf.len(),
                self.bytes.len()
            )));
        }
        for slot in buf.iter_mut() {
            *slot = self.bytes.pop_front().unwrap();
        }
        Ok(())
    }

    fn reconnect(&mut self) -> pla_core::Result<()> {
        Ok(())
    }

    fn drain(&mut self, _timeout: Duration) {}

    fn is_network(&self) -> bool {
        self.network
    }

    fn identity(&self) -> String {
        "scripted".to_string()
    }
}

fn device_info(channel_count: u8, max_frequency: u32, burst_frequency: u32, buffer_size: u32) -> DeviceInfo {
    DeviceInfo {
        version: "V1_7".into(),
        major: 1,
        minor: 7,
        channel_count,
        max_frequency,
        burst_frequency,
        buffer_size,
        transport_kind: TransportKind::Serial,
        identity: "scripted".into(),
    }
}

fn run_capture(engine: &CaptureEngine, session: CaptureSession) -> CaptureOutcome {
    let (tx, rx) = mpsc::channel();
    engine.start(session, move |outcome| {
        let _ = tx.send(outcome);
    }).expect("engine accepted start() from Idle");
    rx.recv_timeout(Duration::from_secs(5))
        .expect("capture completed within test deadline")
}

/// S1 — 8-channel Edge capture, no bursts.
#[test]
fn scenario_s1_edge_capture_no_bursts() {
    let mut transport = ScriptedTransport::default();
    transport.lines.push_back("CAPTURE_STARTED".to_string());
    // data_length = 1000, 1 byte/sample (mode 0), pattern 0b101 repeated.
    transport.push_bytes(&1000u32.to_le_bytes());
    transport.push_bytes(&vec![0b101u8; 1000]);
    transport.push_bytes(&[0]); // timestampBytes = 0
    transport.push_handshake_lines("V1_7", 100_000_000, 4_000_000, 100_000, 8);

    let info = device_info(8, 100_000_000, 4_000_000, 100_000);
    let engine = CaptureEngine::new(Box::new(transport), info);

    let session = CaptureSession {
        frequency: 1_000_000,
        pre_trigger_samples: 100,
        post_trigger_samples: 900,
        loop_count: 0,
        measure_bursts: false,
        trigger_type: TriggerType::Edge,
        trigger_channel: 0,
        trigger_inverted: false,
        trigger_bit_count: 0,
        trigger_pattern: 0,
        capture_channels: vec![0, 1, 2],
    };

    let outcome = run_capture(&engine, session);
    assert!(outcome.success, "expected success, got {:?}", outcome.error.map(|e| e.to_string()));
    let result = outcome.result.unwrap();
    let ch0 = result.channel(0).unwrap();
    let ch1 = result.channel(1).unwrap();
    let ch2 = result.channel(2).unwrap();
    assert_eq!(ch0.len(), 1000);
    assert!(ch0.iter().all(|&b| b == 1));
    assert!(ch1.iter().all(|&b| b == 0));
    assert!(ch2.iter().all(|&b| b == 1));
    assert!(result.bursts.is_none());

    // Engine must have reconnected and returned to Idle before accepting the
    // next start() (invariant 7).
    assert_eq!(engine.state(), pla_core::engine::EngineState::Idle);
}

/// S3 — Blast with measured bursts: four `BurstInfo` entries reconstructed
/// from five device tick values.
#[test]
fn scenario_s3_blast_with_measured_bursts() {
    const LOW_24_MASK: u32 = 0x00FF_FFFF;
    const TAG_MASK: u32 = 0xFF00_0000;
    let invert = |raw: u32| -> u32 { (raw & TAG_MASK) | (LOW_24_MASK - (raw & LOW_24_MASK)) };

    let frequency = 10_000_000u32;
    let post = 4000u32;
    let pre = 1000u32;
    let ns_per_sample = 1e9 / frequency as f64;
    let ticks_per_burst = (ns_per_sample * post as f64 / 5.0).round() as u32;

    let mut decrementing = vec![0x00FF_FFFFu32];
    for _ in 0..4 {
        let prev_inverted = invert(*decrementing.last().unwrap());
        let next_inverted = prev_inverted + ticks_per_burst + 100;
        decrementing.push(invert(next_inverted));
    }
    assert_eq!(decrementing.len(), 5);

    let mut transport = ScriptedTransport::default();
    transport.lines.push_back("CAPTURE_STARTED".to_string());
    let total_samples = pre + post * 4; // loopCount = 3
    transport.push_bytes(&total_samples.to_le_bytes());
    transport.push_bytes(&vec![0u8; total_samples as usize]); // mode 0, channels [0,1]
    transport.push_bytes(&[20]); // timestampBytes = 5 * 4
    for tick in &decrementing {
        transport.push_bytes(&tick.to_le_bytes());
    }
    transport.push_handshake_lines("V1_7", 100_000_000, frequency, 20_000, 8);

    let info = device_info(8, 100_000_000, frequency, 20_000);
    let engine = CaptureEngine::new(Box::new(transport), info);

    let session = CaptureSession {
        frequency,
        pre_trigger_samples: pre,
        post_trigger_samples: post,
        loop_count: 3,
        measure_bursts: true,
        trigger_type: TriggerType::Blast,
        trigger_channel: 0,
        trigger_inverted: false,
        trigger_bit_count: 0,
        trigger_pattern: 0,
        capture_channels: vec![0, 1],
    };

    let outcome = run_capture(&engine, session);
    assert!(outcome.success, "expected success, got {:?}", outcome.error.map(|e| e.to_string()));
    let result = outcome.result.unwrap();
    assert_eq!(result.channel(0).unwrap().len(), total_samples as usize);

    let bursts = result.bursts.expect("blast capture must report bursts");
    assert_eq!(bursts.len(), 4);
    let starts: Vec<u32> = bursts.iter().map(|b| b.burst_sample_start).collect();
    let ends: Vec<u32> = bursts.iter().map(|b| b.burst_sample_end).collect();
    assert_eq!(starts, vec![1000, 5000, 9000, 13000]);
    assert_eq!(ends, vec![5000, 9000, 13000, 17000]);
    assert_eq!(bursts[0].burst_time_gap, 0);
    for b in &bursts[1..] {
        assert!(b.burst_time_gap > 0);
    }
}

/// S6 — firmware below the minimum version must be rejected before any
/// further command is issued, and the handshake must not proceed.
#[test]
fn scenario_s6_version_rejection() {
    let mut transport = ScriptedTransport::default();
    transport.push_handshake_lines("V1_6", 100_000_000, 4_000_000, 100_000, 8);

    let err = handshake::handshake(&mut transport, TransportKind::Serial).unwrap_err();
    assert!(matches!(err, DriverError::Version(_)), "expected VersionError, got {err:?}");
    // No commands beyond the initial device-info query should have been sent.
    assert_eq!(transport.writes.len(), 1);
}

/// A transport whose first write blocks briefly, holding the engine in
/// `Arming`/`Running` long enough for a racing second `start()` call to
/// observe `Busy` deterministically rather than by scheduling luck.
struct SlowStartTransport {
    inner: ScriptedTransport,
    first_write: bool,
}

impl DeviceTransport for SlowStartTransport {
    fn write(&mut self, bytes: &[u8]) -> pla_core::Result<()> {
        if self.first_write {
            self.first_write = false;
            std::thread::sleep(Duration::from_millis(200));
        }
        self.inner.write(bytes)
    }
    fn read_line(&mut self, timeout: Duration) -> pla_core::Result<String> {
        self.inner.read_line(timeout)
    }
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> pla_core::Result<()> {
        self.inner.read_bytes(buf, timeout)
    }
    fn reconnect(&mut self) -> pla_core::Result<()> {
        self.inner.reconnect()
    }
    fn drain(&mut self, timeout: Duration) {
        self.inner.drain(timeout)
    }
    fn is_network(&self) -> bool {
        self.inner.is_network()
    }
    fn identity(&self) -> String {
        self.inner.identity()
    }
}

/// Invariant 6 — the engine refuses a second concurrent `start()`.
#[test]
fn invariant_6_rejects_concurrent_start() {
    let mut inner = ScriptedTransport::default();
    // No CAPTURE_STARTED queued: the background thread will block on
    // read_line until it times out on its own, but we only need the engine's
    // synchronous Busy rejection here, so the capture need not finish within
    // the test.
    inner.lines.push_back("CAPTURE_STARTED".to_string());
    let transport = SlowStartTransport {
        inner,
        first_write: true,
    };

    let info = device_info(8, 100_000_000, 4_000_000, 100_000);
    let engine = CaptureEngine::new(Box::new(transport), info);

    let session = CaptureSession {
        frequency: 1_000_000,
        pre_trigger_samples: 100,
        post_trigger_samples: 900,
        loop_count: 0,
        measure_bursts: false,
        trigger_type: TriggerType::Edge,
        trigger_channel: 0,
        trigger_inverted: false,
        trigger_bit_count: 0,
        trigger_pattern: 0,
        capture_channels: vec![0],
    };

    engine
        .start(session.clone(), |_outcome| {})
        .expect("first start succeeds from Idle");
    let second = engine.start(session, |_outcome| {});
    assert!(matches!(second, Err(DriverError::Busy)));
}
