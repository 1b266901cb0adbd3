//! Single device handle: owns a transport exclusively, runs the handshake on
//! open, and exposes the capture engine plus the control-plane operations
//! that are not part of the capture state machine.

use std::time::Duration;

use log::{info, warn};

use crate::engine::{CaptureEngine, CaptureOutcome, EngineState};
use crate::error::{DriverError, Result};
use crate::handshake;
use crate::protocol::{Request, WifiConfig};
use crate::session::{CaptureLimits, CaptureSession, DeviceInfo, TransportKind};
use crate::transport::{parse_connection_string, DeviceTransport, Transport};

const VOLTAGE_TIMEOUT: Duration = Duration::from_secs(5);
const WIFI_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// A single logic analyzer: one transport, one handshake, one capture engine.
pub struct LogicAnalyzer {
    engine: CaptureEngine,
}

impl LogicAnalyzer {
    /// Open the connection, run the handshake, and return a ready device.
    pub fn open(connection_string: &str) -> Result<Self> {
        let identity = parse_connection_string(connection_string)?;
        let transport_kind = if matches!(identity, crate::transport::Identity::Network { .. }) {
            TransportKind::Network
        } else {
            TransportKind::Serial
        };
        let mut transport = Transport::open(identity)?;
        let info = handshake::handshake(&mut transport, transport_kind)?;
        info!("connected to device {} ({:?})", info.identity, transport_kind);
        Ok(Self {
            engine: CaptureEngine::new(Box::new(transport), info),
        })
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.engine.device_info()
    }

    pub fn limits(&self) -> CaptureLimits {
        self.engine.limits()
    }

    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// Start a capture; `on_complete` fires exactly once, from a background
    /// thread, once the capture has finished and the engine has reconnected.
    pub fn start_capture(
        &self,
        session: CaptureSession,
        on_complete: impl FnOnce(CaptureOutcome) + Send + 'static,
    ) -> Result<()> {
        self.engine.start(session, on_complete)
    }

    /// Send the stop command and request cancellation of any in-flight
    /// capture. Idempotent: returns `true` if the device was already idle.
    pub fn stop_capture(&self) -> Result<bool> {
        self.engine.stop()
    }

    /// Reboot into the bootloader. No response is expected; the transport is
    /// left for the caller to close, since the device will disappear.
    pub fn enter_bootloader(&self) -> Result<()> {
        self.require_idle()?;
        self.engine
            .with_idle_transport(|t| t.write(&Request::Bootloader.encode()))
    }

    /// Query the supply voltage. Serial devices report a fixed nominal
    /// voltage; network devices query the firmware and wait up to 5s for a
    /// reply.
    pub fn get_voltage(&self) -> Result<String> {
        self.require_idle()?;
        self.engine.with_idle_transport(|t| {
            if !t.is_network() {
                return Ok("3.3V".to_string());
            }
            t.write(&Request::VoltageQuery.encode())?;
            match t.read_line(VOLTAGE_TIMEOUT) {
                Ok(line) => Ok(line.trim().to_string()),
                Err(DriverError::Timeout(_)) => Ok("TIMEOUT".to_string()),
                Err(_) => Ok("ERROR".to_string()),
            }
        })
    }

    /// Push a WiFi configuration to a serially-connected device. Rejected
    /// outright on network transports: a device already reachable over the
    /// network has no use for AP credentials delivered over that same link.
    pub fn send_wifi_config(&self, ap: &str, password: &str, ip: &str, port: u16) -> Result<()> {
        self.require_idle()?;
        if self.device_info().transport_kind == TransportKind::Network {
            return Err(DriverError::Config(
                "WiFi configuration can only be sent over a serial transport".into(),
            ));
        }
        let config = WifiConfig::new(ap, password, ip, port)?;
        self.engine.with_idle_transport(|t| {
            t.write(&Request::WifiSettings(config).encode())?;
            match t.read_line(WIFI_CONFIRM_TIMEOUT) {
                Ok(line) if line.trim() == "SETTINGS SAVED" => Ok(()),
                Ok(other) => Err(DriverError::Hardware(format!(
                    "unexpected WiFi configuration reply: '{other}'"
                ))),
                Err(e) => {
                    warn!("no confirmation of WiFi settings: {e}");
                    Err(e)
                }
            }
        })
    }

    fn require_idle(&self) -> Result<()> {
        if self.state() != EngineState::Idle {
            return Err(DriverError::Busy);
        }
        Ok(())
    }
}

/// Construct a device directly from an already-open transport, bypassing
/// connection-string parsing. Used by the multi-device orchestrator, which
/// opens each child transport itself so it can roll back partial failures.
pub(crate) fn from_transport(transport: Box<dyn DeviceTransport>, info: DeviceInfo) -> LogicAnalyzer {
    LogicAnalyzer {
        engine: CaptureEngine::new(transport, info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory double implementing [`DeviceTransport`] for control-plane
    /// tests that do not need the full capture receive loop.
    struct MockTransport {
        lines: Arc<Mutex<VecDeque<String>>>,
        network: bool,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl DeviceTransport for MockTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration) -> Result<String> {
            self.lines
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| DriverError::Timeout("no more lines queued".into()))
        }

        fn read_bytes(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<()> {
            Err(DriverError::Hardware("not supported by mock".into()))
        }

        fn reconnect(&mut self) -> Result<()> {
            Ok(())
        }

        fn drain(&mut self, _timeout: Duration) {}

        fn is_network(&self) -> bool {
            self.network
        }

        fn identity(&self) -> String {
            "mock".to_string()
        }
    }

    fn device_info(kind: TransportKind) -> DeviceInfo {
        DeviceInfo {
            version: "V1_7".into(),
            major: 1,
            minor: 7,
            channel_count: 8,
            max_frequency: 100_000_000,
            burst_frequency: 4_000_000,
            buffer_size: 20_000,
            transport_kind: kind,
            identity: "mock".into(),
        }
    }

    #[test]
    fn serial_voltage_is_fixed() {
        let transport = MockTransport {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            network: false,
            writes: Arc::new(Mutex::new(Vec::new())),
        };
        let device = from_transport(Box::new(transport), device_info(TransportKind::Serial));
        assert_eq!(device.get_voltage().unwrap(), "3.3V");
    }

    #[test]
    fn network_voltage_reads_reply_line() {
        let mut lines = VecDeque::new();
        lines.push_back("4.98V".to_string());
        let transport = MockTransport {
            lines: Arc::new(Mutex::new(lines)),
            network: true,
            writes: Arc::new(Mutex::new(Vec::new())),
        };
        let device = from_transport(Box::new(transport), device_info(TransportKind::Network));
        assert_eq!(device.get_voltage().unwrap(), "4.98V");
    }

    #[test]
    fn network_voltage_timeout_reports_timeout_string() {
        let transport = MockTransport {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            network: true,
            writes: Arc::new(Mutex::new(Vec::new())),
        };
        let device = from_transport(Box::new(transport), device_info(TransportKind::Network));
        assert_eq!(device.get_voltage().unwrap(), "TIMEOUT");
    }

    #[test]
    fn wifi_config_rejected_on_network_transport() {
        let transport = MockTransport {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            network: true,
            writes: Arc::new(Mutex::new(Vec::new())),
        };
        let device = from_transport(Box::new(transport), device_info(TransportKind::Network));
        assert!(device
            .send_wifi_config("ap", "pw", "192.168.4.1", 80)
            .is_err());
    }

    #[test]
    fn wifi_config_accepted_on_confirmation() {
        let mut lines = VecDeque::new();
        lines.push_back("SETTINGS SAVED".to_string());
        let transport = MockTransport {
            lines: Arc::new(Mutex::new(lines)),
            network: false,
            writes: Arc::new(Mutex::new(Vec::new())),
        };
        let device = from_transport(Box::new(transport), device_info(TransportKind::Serial));
        assert!(device
            .send_wifi_config("ap", "pw", "192.168.4.1", 80)
            .is_ok());
    }

    #[test]
    fn bootloader_writes_command_byte_three() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            network: false,
            writes: writes.clone(),
        };
        let device = from_transport(Box::new(transport), device_info(TransportKind::Serial));
        device.enter_bootloader().unwrap();
        assert_eq!(writes.lock().unwrap()[0], vec![3]);
    }
}
