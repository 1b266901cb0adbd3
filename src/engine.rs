//! Capture engine: drives one capture through its state machine, streaming
//! the length-prefixed binary payload and decoding it into a
//! [`CaptureResult`].
//!
//! States: `Idle -> Arming -> Running -> Draining -> Done | Failed`. Only
//! one capture may be in flight at a time; the engine forces a transport
//! reconnect (and re-handshake) after every completed or failed capture
//! before it will accept the next `start()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::demux::{demux, unpack_raw_samples};
use crate::error::{DriverError, Result};
use crate::handshake;
use crate::planner::{plan, PlannedCapture};
use crate::protocol::{capture_mode_from_wire, Request};
use crate::session::{CaptureLimits, CaptureResult, CaptureSession, DeviceInfo};
use crate::timestamp::reconstruct_bursts;
use crate::transport::DeviceTransport;

/// 10 s deadline to observe the `CAPTURE_STARTED` line.
pub const CAPTURE_START_TIMEOUT: Duration = Duration::from_secs(10);
/// 60 s deadline to stream the complete binary payload, on either transport.
pub const PAYLOAD_TIMEOUT: Duration = Duration::from_secs(60);

const PAYLOAD_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Arming,
    Running,
    Draining,
    Done,
    Failed,
}

/// Delivered to the caller's completion callback exactly once per `start()`.
pub struct CaptureOutcome {
    pub success: bool,
    pub result: Option<CaptureResult>,
    pub error: Option<DriverError>,
}

impl CaptureOutcome {
    fn success(result: CaptureResult) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(error: DriverError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

fn with_transport<R>(
    transport: &Mutex<Box<dyn DeviceTransport>>,
    f: impl FnOnce(&mut dyn DeviceTransport) -> Result<R>,
) -> Result<R> {
    let mut guard = transport.lock().expect("transport mutex poisoned");
    f(guard.as_mut())
}

/// Drives one device's capture protocol and post-capture reconnect.
pub struct CaptureEngine {
    transport: Arc<Mutex<Box<dyn DeviceTransport>>>,
    device_info: Arc<Mutex<DeviceInfo>>,
    state: Arc<Mutex<EngineState>>,
    stop_requested: Arc<AtomicBool>,
}

impl CaptureEngine {
    pub fn new(transport: Box<dyn DeviceTransport>, device_info: DeviceInfo) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            device_info: Arc::new(Mutex::new(device_info)),
            state: Arc::new(Mutex::new(EngineState::Idle)),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().expect("state mutex poisoned")
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.device_info.lock().expect("device_info mutex poisoned").clone()
    }

    /// Access the underlying transport for control operations (stop,
    /// bootloader, voltage, WiFi config) that are not part of a capture.
    pub(crate) fn with_idle_transport<R>(
        &self,
        f: impl FnOnce(&mut dyn DeviceTransport) -> Result<R>,
    ) -> Result<R> {
        with_transport(&self.transport, f)
    }

    pub fn limits(&self) -> CaptureLimits {
        CaptureLimits::from_device_info(&self.device_info())
    }

    /// Start a capture. Validation happens synchronously, before the wire is
    /// touched; everything after that runs on a background thread and
    /// reports through `on_complete` exactly once.
    pub fn start(
        &self,
        session: CaptureSession,
        on_complete: impl FnOnce(CaptureOutcome) + Send + 'static,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state != EngineState::Idle {
                return Err(DriverError::Busy);
            }
            *state = EngineState::Arming;
        }

        let limits = self.limits();
        let planned = match plan(&session, &limits) {
            Ok(p) => p,
            Err(e) => {
                *self.state.lock().expect("state mutex poisoned") = EngineState::Idle;
                return Err(e);
            }
        };

        self.stop_requested.store(false, Ordering::SeqCst);

        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let device_info = Arc::clone(&self.device_info);
        let stop_flag = Arc::clone(&self.stop_requested);

        thread::spawn(move || {
            let outcome = run_capture(&transport, &state, &stop_flag, &session, &planned);

            let reconnect_result = with_transport(&transport, |t| {
                t.reconnect()?;
                let kind = device_info
                    .lock()
                    .expect("device_info mutex poisoned")
                    .transport_kind;
                handshake::handshake(t, kind)
            });
            match reconnect_result {
                Ok(info) => {
                    *device_info.lock().expect("device_info mutex poisoned") = info;
                }
                Err(e) => warn!("post-capture reconnect/handshake failed: {e}"),
            }

            *state.lock().expect("state mutex poisoned") = EngineState::Idle;
            on_complete(outcome);
        });

        Ok(())
    }

    /// Send the stop command and request cancellation of any in-flight
    /// capture. Does not synchronously interrupt a read in progress; the
    /// engine observes `stop_requested` at its next chunk boundary or
    /// deadline. Returns `true` if the device was idle or the stop request
    /// was issued.
    pub fn stop(&self) -> Result<bool> {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.state() == EngineState::Idle {
            return Ok(true);
        }
        let _ = with_transport(&self.transport, |t| t.write(&Request::Stop.encode()));
        Ok(true)
    }
}

fn run_capture(
    transport: &Arc<Mutex<Box<dyn DeviceTransport>>>,
    state: &Arc<Mutex<EngineState>>,
    stop_flag: &Arc<AtomicBool>,
    session: &CaptureSession,
    planned: &PlannedCapture,
) -> CaptureOutcome {
    let set_state = |s: EngineState| *state.lock().expect("state mutex poisoned") = s;

    if let Err(e) = with_transport(transport, |t| t.write(&Request::StartCapture(planned.wire.clone()).encode())) {
        set_state(EngineState::Failed);
        return CaptureOutcome::failure(e);
    }

    let started = with_transport(transport, |t| t.read_line(CAPTURE_START_TIMEOUT));
    match started {
        Ok(line) if line.trim() == "CAPTURE_STARTED" => {
            set_state(EngineState::Running);
        }
        Ok(other) => {
            set_state(EngineState::Failed);
            return CaptureOutcome::failure(DriverError::Hardware(format!(
                "unexpected line while awaiting CAPTURE_STARTED: '{other}'"
            )));
        }
        Err(e) => {
            set_state(EngineState::Failed);
            return CaptureOutcome::failure(e);
        }
    }

    if stop_flag.load(Ordering::SeqCst) {
        set_state(EngineState::Failed);
        with_transport(transport, |t| {
            t.drain(Duration::from_millis(500));
            Ok(())
        })
        .ok();
        return CaptureOutcome::failure(DriverError::Cancelled);
    }

    set_state(EngineState::Draining);
    let deadline = Instant::now() + PAYLOAD_TIMEOUT;

    let data_length = match read_u32(transport, deadline) {
        Ok(v) => v,
        Err(e) => {
            set_state(EngineState::Failed);
            return CaptureOutcome::failure(e);
        }
    };

    let mode = planned_capture_mode(planned);
    let sample_bytes_len = data_length as usize * mode.bytes_per_sample();
    let mut sample_blob = vec![0u8; sample_bytes_len];
    if let Err(e) = read_chunked(transport, stop_flag, &mut sample_blob, deadline) {
        set_state(EngineState::Failed);
        with_transport(transport, |t| {
            t.drain(Duration::from_millis(500));
            Ok(())
        })
        .ok();
        return CaptureOutcome::failure(e);
    }

    let timestamp_bytes_len = match read_u8(transport, deadline) {
        Ok(v) => v,
        Err(e) => {
            set_state(EngineState::Failed);
            return CaptureOutcome::failure(e);
        }
    };

    let mut timestamp_blob = vec![0u8; timestamp_bytes_len as usize];
    if timestamp_bytes_len > 0 {
        if let Err(e) = read_chunked(transport, stop_flag, &mut timestamp_blob, deadline) {
            set_state(EngineState::Failed);
            with_transport(transport, |t| {
                t.drain(Duration::from_millis(500));
                Ok(())
            })
            .ok();
            return CaptureOutcome::failure(e);
        }
    }

    debug!(
        "payload received: data_length={data_length}, timestamp_bytes={timestamp_bytes_len}"
    );

    let raw_samples = match unpack_raw_samples(&sample_blob, mode, data_length as usize) {
        Ok(s) => s,
        Err(e) => {
            set_state(EngineState::Failed);
            return CaptureOutcome::failure(e);
        }
    };
    let channels = demux(&raw_samples, &session.capture_channels);

    let bursts = if timestamp_bytes_len > 0 && session_measures_bursts(session) && session.loop_count > 0 {
        let ticks: Vec<u32> = timestamp_blob
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        match reconstruct_bursts(
            &ticks,
            session.frequency,
            session.pre_trigger_samples,
            session.post_trigger_samples,
        ) {
            Ok(b) => Some(b),
            Err(e) => {
                set_state(EngineState::Failed);
                return CaptureOutcome::failure(e);
            }
        }
    } else {
        None
    };

    set_state(EngineState::Done);
    CaptureOutcome::success(CaptureResult { channels, bursts })
}

fn session_measures_bursts(session: &CaptureSession) -> bool {
    use crate::session::TriggerType;
    match session.trigger_type {
        TriggerType::Blast => true,
        TriggerType::Edge => session.measure_bursts,
        TriggerType::Complex | TriggerType::Fast => false,
    }
}

fn planned_capture_mode(planned: &PlannedCapture) -> crate::session::CaptureMode {
    capture_mode_from_wire(planned.wire.capture_mode)
}

fn read_u32(transport: &Arc<Mutex<Box<dyn DeviceTransport>>>, deadline: Instant) -> Result<u32> {
    let mut buf = [0u8; 4];
    let remaining = remaining_or_timeout(deadline)?;
    with_transport(transport, |t| t.read_bytes(&mut buf, remaining))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u8(transport: &Arc<Mutex<Box<dyn DeviceTransport>>>, deadline: Instant) -> Result<u8> {
    let mut buf = [0u8; 1];
    let remaining = remaining_or_timeout(deadline)?;
    with_transport(transport, |t| t.read_bytes(&mut buf, remaining))?;
    Ok(buf[0])
}

fn remaining_or_timeout(deadline: Instant) -> Result<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(DriverError::Timeout("payload deadline exceeded".into()));
    }
    Ok(remaining)
}

/// Read `out.len()` bytes in chunks, checking the stop flag and overall
/// deadline between chunks so a capture can be cancelled mid-stream.
fn read_chunked(
    transport: &Arc<Mutex<Box<dyn DeviceTransport>>>,
    stop_flag: &Arc<AtomicBool>,
    out: &mut [u8],
    deadline: Instant,
) -> Result<()> {
    let mut filled = 0usize;
    while filled < out.len() {
        if stop_flag.load(Ordering::SeqCst) {
            return Err(DriverError::Cancelled);
        }
        let remaining = remaining_or_timeout(deadline)?;
        let take = (out.len() - filled).min(PAYLOAD_CHUNK);
        let slice = &mut out[filled..filled + take];
        with_transport(transport, |t| t.read_bytes(slice, remaining))?;
        filled += take;
    }
    Ok(())
}
