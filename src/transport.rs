//! Byte transport over serial or TCP.
//!
//! A `Transport` frames nothing by itself — it exposes a newline-delimited
//! line reader and a raw byte reader multiplexed on the same underlying
//! stream, buffering whatever bytes were read past a line delimiter so the
//! binary reader never loses them. This is the low-level contract the
//! handshake and capture engine build on.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{DriverError, Result};

/// Default poll chunk used while waiting on a deadline; keeps reads
/// responsive to cancellation without busy-looping.
const POLL_CHUNK: Duration = Duration::from_millis(200);

const SERIAL_BAUD_RATE: u32 = 115_200;

/// Identifies how to re-establish a transport after a forced reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Serial { path: String },
    Network { host: String, port: u16 },
}

impl Identity {
    pub fn describe(&self) -> String {
        match self {
            Identity::Serial { path } => path.clone(),
            Identity::Network { host, port } => format!("{host}:{port}"),
        }
    }
}

/// Parse a connection string per spec: a colon marks it as `HOST:PORT`;
/// otherwise it is a serial device path. An empty string is a config error.
pub fn parse_connection_string(conn: &str) -> Result<Identity> {
    if conn.is_empty() {
        return Err(DriverError::Config("empty connection string".into()));
    }
    if let Some(idx) = conn.rfind(':') {
        let (host, port_str) = conn.split_at(idx);
        let port_str = &port_str[1..];
        let port: u16 = port_str
            .parse()
            .map_err(|_| DriverError::Config(format!("invalid port in '{conn}'")))?;
        if port == 0 {
            return Err(DriverError::Config(format!("invalid port in '{conn}'")));
        }
        if host.is_empty() {
            return Err(DriverError::Config(format!("invalid host in '{conn}'")));
        }
        Ok(Identity::Network {
            host: host.to_string(),
            port,
        })
    } else {
        Ok(Identity::Serial {
            path: conn.to_string(),
        })
    }
}

trait RawIo: Read + Write + Send {
    fn set_io_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;
}

impl RawIo for TcpStream {
    fn set_io_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }
}

impl RawIo for Box<dyn serialport::SerialPort> {
    fn set_io_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.as_mut().set_timeout(timeout).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })
    }
}

/// Buffers bytes read past whatever the last consumer asked for, so the line
/// reader and the raw byte reader can share one stream without losing data.
struct ByteSource<T: RawIo> {
    io: T,
    buf: Vec<u8>,
    pos: usize,
}

impl<T: RawIo> ByteSource<T> {
    fn new(io: T) -> Self {
        Self {
            io,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    fn fill_more(&mut self, deadline: Instant) -> Result<usize> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DriverError::Timeout("transport read deadline exceeded".into()));
        }
        let chunk = remaining.min(POLL_CHUNK);
        self.io
            .set_io_timeout(chunk)
            .map_err(DriverError::Transport)?;
        let mut tmp = [0u8; 4096];
        match self.io.read(&mut tmp) {
            Ok(0) => Err(DriverError::Hardware("transport closed (EOF)".into())),
            Ok(n) => {
                self.buf.extend_from_slice(&tmp[..n]);
                Ok(n)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(DriverError::Transport(e)),
        }
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(nl) = self.available().iter().position(|&b| b == b'\n') {
                let line_bytes = self.buf[self.pos..self.pos + nl].to_vec();
                self.consume(nl + 1);
                let line = String::from_utf8_lossy(&line_bytes);
                return Ok(line.trim_end_matches('\r').to_string());
            }
            if Instant::now() > deadline {
                return Err(DriverError::Timeout("timed out waiting for line".into()));
            }
            self.fill_more(deadline)?;
        }
    }

    fn read_exact_timed(&mut self, out: &mut [u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0usize;
        while filled < out.len() {
            let have = self.available();
            if !have.is_empty() {
                let take = have.len().min(out.len() - filled);
                out[filled..filled + take].copy_from_slice(&have[..take]);
                self.consume(take);
                filled += take;
                continue;
            }
            if Instant::now() > deadline {
                return Err(DriverError::Timeout(format!(
                    "timed out after {filled}/{} bytes",
                    out.len()
                )));
            }
            self.fill_more(deadline)?;
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).map_err(DriverError::Transport)?;
        self.io.flush().map_err(DriverError::Transport)
    }
}

enum Inner {
    Serial(ByteSource<Box<dyn serialport::SerialPort>>),
    Network(ByteSource<TcpStream>),
}

/// A transport to a single capture device: serial (115200 8-N-1, no flow
/// control) or network (IPv4 `host:port`).
pub struct Transport {
    identity: Identity,
    inner: Option<Inner>,
}

impl Transport {
    pub fn open(identity: Identity) -> Result<Self> {
        let inner = Self::dial(&identity)?;
        Ok(Self {
            identity,
            inner: Some(inner),
        })
    }

    pub fn from_connection_string(conn: &str) -> Result<Self> {
        Self::open(parse_connection_string(conn)?)
    }

    fn dial(identity: &Identity) -> Result<Inner> {
        match identity {
            Identity::Serial { path } => {
                debug!("opening serial transport at {path}");
                let port = serialport::new(path.as_str(), SERIAL_BAUD_RATE)
                    .data_bits(serialport::DataBits::Eight)
                    .parity(serialport::Parity::None)
                    .stop_bits(serialport::StopBits::One)
                    .flow_control(serialport::FlowControl::None)
                    .timeout(POLL_CHUNK)
                    .open()?;
                Ok(Inner::Serial(ByteSource::new(port)))
            }
            Identity::Network { host, port } => {
                debug!("opening network transport to {host}:{port}");
                let stream = TcpStream::connect((host.as_str(), *port))
                    .map_err(DriverError::Transport)?;
                stream
                    .set_nodelay(true)
                    .map_err(DriverError::Transport)?;
                Ok(Inner::Network(ByteSource::new(stream)))
            }
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_network(&self) -> bool {
        matches!(self.identity, Identity::Network { .. })
    }

    /// Close then re-open and leave the transport ready for a fresh
    /// handshake. Required after every capture (§4.5) because the device
    /// firmware leaves the stream in an unknown state after a run.
    pub fn reconnect(&mut self) -> Result<()> {
        self.close();
        self.inner = Some(Self::dial(&self.identity)?);
        Ok(())
    }

    pub fn close(&mut self) {
        self.inner = None;
    }

    fn inner_mut(&mut self) -> Result<&mut Inner> {
        self.inner
            .as_mut()
            .ok_or_else(|| DriverError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport is closed",
            )))
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self.inner_mut()? {
            Inner::Serial(s) => s.write_all(bytes),
            Inner::Network(s) => s.write_all(bytes),
        }
    }

    pub fn read_line(&mut self, timeout: Duration) -> Result<String> {
        match self.inner_mut()? {
            Inner::Serial(s) => s.read_line(timeout),
            Inner::Network(s) => s.read_line(timeout),
        }
    }

    pub fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        match self.inner_mut()? {
            Inner::Serial(s) => s.read_exact_timed(buf, timeout),
            Inner::Network(s) => s.read_exact_timed(buf, timeout),
        }
    }

    /// Drain and discard whatever is currently in flight, best-effort, up to
    /// a short deadline. Used when a `stop()` races the receive loop so a
    /// stray partial payload does not corrupt the next handshake.
    pub fn drain(&mut self, timeout: Duration) {
        let mut scratch = [0u8; 256];
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let res = match self.inner.as_mut() {
                Some(Inner::Serial(s)) => s.fill_more(deadline),
                Some(Inner::Network(s)) => s.fill_more(deadline),
                None => break,
            };
            match res {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(inner) = self.inner.as_mut() {
                        match inner {
                            Inner::Serial(s) => {
                                let n = s.available().len().min(scratch.len());
                                s.consume(n);
                            }
                            Inner::Network(s) => {
                                let n = s.available().len().min(scratch.len());
                                s.consume(n);
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }
    }
}

/// The seam the capture engine and handshake talk to. Implemented by
/// [`Transport`] for real devices and by an in-memory double in tests, so the
/// receive loop and handshake parsing can be exercised without hardware.
pub trait DeviceTransport: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn read_line(&mut self, timeout: Duration) -> Result<String>;
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;
    fn reconnect(&mut self) -> Result<()>;
    fn drain(&mut self, timeout: Duration);
    fn is_network(&self) -> bool;
    fn identity(&self) -> String;
}

impl DeviceTransport for Transport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        Transport::write(self, bytes)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String> {
        Transport::read_line(self, timeout)
    }

    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        Transport::read_bytes(self, buf, timeout)
    }

    fn reconnect(&mut self) -> Result<()> {
        Transport::reconnect(self)
    }

    fn drain(&mut self, timeout: Duration) {
        Transport::drain(self, timeout)
    }

    fn is_network(&self) -> bool {
        Transport::is_network(self)
    }

    fn identity(&self) -> String {
        self.identity.describe()
    }
}
